use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpg_keysign::{
    Context, Error, Keyring, SignOptions, SignProgress, SignState, SignTarget, TempKeyring,
};

/// Installs `body` as a stand-in gpg in `dir` and returns its path.
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let staging = dir.join(format!("{name}.tmp"));
    let path = dir.join(name);
    {
        let mut file = File::create(&staging).unwrap();
        write!(file, "#!/bin/sh\n{body}\n").unwrap();
        file.sync_all().unwrap();
    }
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).unwrap();
    fs::rename(&staging, &path).unwrap();
    path
}

/// Points `keyring` at the binary `path`, keeping its own homedir.
fn use_binary(keyring: &mut TempKeyring, path: &Path) {
    let homedir = keyring.path().to_string_lossy().into_owned();
    let ctx = keyring.context_mut();
    *ctx = Context::with_binary(path.to_string_lossy());
    ctx.set_option("homedir", Some(homedir));
}

/// Creates a passphrase-less key in `keyring` and returns its fingerprint.
async fn generate_key(keyring: &TempKeyring, uid: &str) -> String {
    let mut ctx = keyring.context().clone();
    ctx.set_option("pinentry-mode", Some("loopback"));
    ctx.set_option("passphrase", Some(""));
    let mut session =
        gpg_keysign::Session::start(&ctx, "quick-gen-key", [uid, "ed25519", "sign,cert", "never"])
            .expect("failed to start gpg");
    assert_eq!(session.close().await.unwrap(), 0, "{}", session.diagnostics());

    let keys = keyring
        .get_keys(Some(uid), false, true)
        .await
        .unwrap()
        .expect("generated key should be listed");
    keys.values()
        .next()
        .and_then(|k| k.fingerprint.clone())
        .expect("generated key should have a fingerprint")
}

#[tokio::test]
#[ignore]
async fn test_version_real() {
    let version = Keyring::new().version().await.expect("failed to run gpg");
    assert!(version.starts_with('2'), "unexpected gpg version {version}");
}

#[tokio::test]
#[ignore]
async fn test_empty_temp_keyring() {
    let keyring = TempKeyring::new().unwrap();
    assert!(keyring.get_keys(None, true, true).await.unwrap().is_none());
    assert!(keyring.export_data(None, false).await.unwrap().is_empty());
    assert!(keyring.list_signatures(None).await.unwrap().is_empty());
    keyring.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_import_garbage_real() {
    let keyring = TempKeyring::new().unwrap();
    let err = keyring.import_data(b"not a key").await.unwrap_err();
    assert!(matches!(err, Error::KeyNotFound(_)), "got {err:?}");
    keyring.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_export_import_round_trip_real() {
    let mut source = TempKeyring::new().unwrap();
    let fpr = generate_key(&source, "Alice <alice@example.org>").await;
    source
        .context_mut()
        .set_option("export-options", Some("export-minimal"));
    let data = source.export_data(Some(&fpr), false).await.unwrap();
    assert!(!data.is_empty());

    let mut target = TempKeyring::new().unwrap();
    assert!(target.import_data(&data).await.unwrap());
    target
        .context_mut()
        .set_option("export-options", Some("export-minimal"));
    let exported = target.export_data(Some(&fpr), false).await.unwrap();
    assert_eq!(exported, data);

    let keys = target.get_keys(Some(&fpr), true, true).await.unwrap().unwrap();
    let key = keys.get(&fpr).expect("imported key should be listed");
    assert!(!key.secret);
    assert_eq!(key.uids[0].uid, "Alice <alice@example.org>");

    let secret = source.get_keys(Some(&fpr), true, true).await.unwrap().unwrap();
    assert!(secret.get(&fpr).unwrap().secret);

    source.close().await.unwrap();
    target.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_sign_key_real() {
    let signer = TempKeyring::new().unwrap();
    let signer_fpr = generate_key(&signer, "Signer <signer@example.org>").await;

    let other = TempKeyring::new().unwrap();
    let fpr = generate_key(&other, "Bob <bob@example.org>").await;
    let public = other.export_data(Some(&fpr), false).await.unwrap();
    other.close().await.unwrap();

    assert!(signer.import_data(&public).await.unwrap());

    let mut seen = Vec::new();
    let options = SignOptions {
        target: SignTarget::All,
        local: false,
        timeout_secs: Some(60),
    };
    let signed = signer
        .sign_key_with(&fpr, options, |p| seen.push(p))
        .await
        .unwrap();
    assert!(signed);
    assert_eq!(seen.first(), Some(&SignProgress::Entered(SignState::Start)));
    assert_eq!(seen.last(), Some(&SignProgress::Completed));

    let sigs = signer.list_signatures(Some(&fpr)).await.unwrap();
    assert!(sigs.iter().any(|s| signer_fpr.ends_with(&s.keyid)));

    match signer.sign_key(&fpr, true).await {
        Err(Error::SigningConflict(_)) | Ok(false) => {}
        other => panic!("signing twice should not succeed, got {other:?}"),
    }

    signer.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_keyring_not_found_real() {
    let keyring = Keyring::with_homedir("/nonexistent/gnupg");
    let result = keyring.get_keys(None, false, true).await;
    assert!(!matches!(result, Ok(Some(_))));
}

#[test_log::test(tokio::test)]
async fn test_missing_binary() {
    let mut keyring = Keyring::with_homedir("/nonexistent/gnupg");
    *keyring.context_mut() = Context::with_binary("/nonexistent/bin/gpg");

    match keyring.get_keys(None, false, true).await {
        Err(Error::Startup { binary, .. }) => assert_eq!(binary, "/nonexistent/bin/gpg"),
        other => panic!("expected Startup error, got {other:?}"),
    }
    assert!(matches!(
        keyring.import_data(b"").await,
        Err(Error::Startup { .. })
    ));
}

#[tokio::test]
async fn test_fetch_keys_invalid_keyid() {
    let keyring = Keyring::with_homedir("/nonexistent/gnupg");
    for pattern in ["", "ABC", "GHIJKLMN", "bob@example.org"] {
        let result = keyring.fetch_keys(pattern, None).await;
        assert!(
            matches!(result, Err(Error::InvalidKeyId { .. })),
            "{pattern:?} gave {result:?}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn test_temp_keyrings_are_independent() {
    let (first, second) = tokio::join!(async { TempKeyring::new() }, async {
        TempKeyring::new()
    });
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.path(), second.path());

    let first_path = first.path().to_path_buf();
    let second_path = second.path().to_path_buf();
    first.close().await.unwrap();
    assert!(!first_path.exists());
    assert!(second_path.is_dir());
    drop(second);
    assert!(!second_path.exists());
}

#[test_log::test(tokio::test)]
async fn test_temp_keyrings_run_concurrently() {
    let bin = tempfile::tempdir().unwrap();
    let released = bin.path().join("released");

    // The listing only finishes once the import on the other store ran.
    let lister = script(
        bin.path(),
        "gpg-list",
        &format!(
            r#"while [ ! -e '{}' ]; do sleep 0.05; done
echo 'pub:u:255:22:792152527B75921E:1325372400:::u:::scESC:'
echo 'fpr:::::::::8DC901CE64146C048AD50FBB792152527B75921E:'
echo 'uid:u::::1325372400::A1B2C3::Alice <alice@example.org>::::::::::0:'"#,
            released.display()
        ),
    );
    let importer = script(
        bin.path(),
        "gpg-import",
        &format!(
            r#"cat >/dev/null
touch '{}'
echo '[GNUPG:] IMPORT_OK 1 8DC901CE64146C048AD50FBB792152527B75921E' >&2
echo '[GNUPG:] IMPORT_RES 1 0 1 0 0 0 0 0 0 0 0 0 0 0 0' >&2"#,
            released.display()
        ),
    );

    let mut first = TempKeyring::new().unwrap();
    let mut second = TempKeyring::new().unwrap();
    use_binary(&mut first, &lister);
    use_binary(&mut second, &importer);

    let (keys, imported) = tokio::time::timeout(Duration::from_secs(30), async {
        tokio::join!(
            first.get_keys(Some("7B75921E"), false, true),
            second.import_data(b"-----BEGIN PGP PUBLIC KEY BLOCK-----"),
        )
    })
    .await
    .expect("operations on separate stores should not wait on each other");

    let keys = keys.unwrap().expect("listing should match");
    assert!(keys.find("7B75921E").is_some());
    assert!(imported.unwrap());

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_temp_keyring_options_are_its_own() {
    let mut keyring = TempKeyring::new().unwrap();
    keyring.context_mut().set_flag("armor");
    let other = Keyring::new();
    assert!(other.context().option("armor").is_none());
    assert_eq!(keyring.context().option("armor"), Some(None));
}
