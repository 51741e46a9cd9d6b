//! Example: Certify someone's key without touching your own keyring
//!
//! The key is copied into a temporary keyring together with your secret
//! keys, signed there, and the signed key is printed armored and minimal,
//! ready to be sent back to its owner.
//!
//! Run with: RUST_LOG=debug cargo run --example sign_key <keyid> [user id]

use gpg_keysign::{Keyring, SignOptions, SignTarget, TempKeyring, default_homedir};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> gpg_keysign::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(keyid) = args.next() else {
        eprintln!("usage: sign_key <keyid> [user id]");
        std::process::exit(1);
    };
    let target = args.next().map_or(SignTarget::All, SignTarget::Uid);

    let keyring = Keyring::new();
    let public = keyring.export_data(Some(&keyid), false).await?;
    let secret = keyring.export_data(None, true).await?;

    let mut scratch = TempKeyring::new()?;
    if let Some(home) = default_homedir() {
        scratch.copy_config_from(home)?;
    }
    scratch.import_data(&secret).await?;
    scratch.import_data(&public).await?;

    let options = SignOptions {
        target,
        local: false,
        timeout_secs: Some(300),
    };
    let signed = scratch
        .sign_key_with(&keyid, options, |p| eprintln!("{p:?}"))
        .await;

    match signed {
        Ok(true) => {
            let ctx = scratch.context_mut();
            ctx.set_flag("armor");
            ctx.set_option("export-options", Some("export-minimal"));
            let data = scratch.export_data(Some(&keyid), false).await?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Ok(false) => eprintln!("gpg did not sign {keyid}"),
        Err(err) if err.is_recoverable() => eprintln!("{err}"),
        Err(err) => return Err(err),
    }

    scratch.close().await
}
