use std::fs;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::parse::{parse_keys, parse_signatures};
use crate::session::Session;
use crate::sign::{SignOptions, SignProgress, SignTarget, SigningConversation};
use crate::status::StatusLine;
use crate::types::{KeyMap, Signature};
use crate::validation::validate_keyid;

/// gpg's exit code when a listing matched no key.
pub const NO_KEYS_EXIT_CODE: i32 = 2;

const GPGCONF_BINARY: &str = "gpgconf";
const CONFIG_FILE: &str = "gpg.conf";
const TEMP_PREFIX: &str = "gpg-keysign-";
const NO_ARGS: [&str; 0] = [];

/// The home directory gpg uses when none is given: `$GNUPGHOME`, else
/// `~/.gnupg`.
pub fn default_homedir() -> Option<PathBuf> {
    match std::env::var_os("GNUPGHOME") {
        Some(home) if !home.is_empty() => Some(PathBuf::from(home)),
        _ => dirs::home_dir().map(|home| home.join(".gnupg")),
    }
}

/// A gpg key database and the operations run against it.
///
/// Every operation spawns one gpg process and waits for it to exit before
/// returning. Two keyrings never share state beyond the directories they
/// point at.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpg_keysign::Result<()> {
/// use gpg_keysign::Keyring;
///
/// let keyring = Keyring::new();
/// if let Some(keys) = keyring.get_keys(Some("alice@example.org"), false, true).await? {
///     for key in keys.values() {
///         println!("{key}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Keyring {
    context: Context,
    homedir: Option<PathBuf>,
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyring {
    /// The user's own key database, wherever gpg finds it by default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: Context::new(),
            homedir: None,
        }
    }

    /// The key database in `path`, passed to gpg as `--homedir`.
    #[must_use]
    pub fn with_homedir(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut context = Context::new();
        context.set_option("homedir", Some(path.to_string_lossy()));
        Self {
            context,
            homedir: Some(path),
        }
    }

    /// The directory gpg will operate on.
    pub fn homedir(&self) -> Option<PathBuf> {
        self.homedir.clone().or_else(default_homedir)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The option set used for every following operation, e.g. to add
    /// `armor` or `export-options export-minimal`.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Imports keys or signatures from `data`, armored or not.
    ///
    /// Fails with [`Error::KeyNotFound`] when gpg found nothing to import.
    /// Otherwise returns whether gpg exited successfully.
    pub async fn import_data(&self, data: &[u8]) -> Result<bool> {
        let mut session = Session::start(&self.context, "import", NO_ARGS)?;
        session.feed(data.to_vec())?;

        let result = match import_result(&mut session).await {
            Ok(line) => line,
            Err(Error::Protocol { .. }) => {
                session.close().await?;
                debug!(diagnostics = %session.diagnostics(), "nothing imported");
                return Err(Error::KeyNotFound("no key found in imported data".to_string()));
            }
            Err(err) => return Err(err),
        };

        let considered: u64 = result.arg(0).and_then(|n| n.parse().ok()).unwrap_or(0);
        let code = session.close().await?;
        if considered == 0 {
            return Err(Error::KeyNotFound("no key found in imported data".to_string()));
        }
        info!(considered, code, "imported keys");
        Ok(code == 0)
    }

    /// Exports the keys matching `pattern` (all keys if `None`), public or
    /// secret. Binary unless the context carries `armor`.
    ///
    /// Nothing matching is not an error: the result is simply empty.
    pub async fn export_data(&self, pattern: Option<&str>, secret: bool) -> Result<Vec<u8>> {
        let verb = if secret { "export-secret-keys" } else { "export" };
        let mut session = Session::start(&self.context, verb, pattern)?;
        let code = session.close().await?;
        if code != 0 {
            return Err(self.check_error(code, &session.diagnostics()));
        }
        Ok(session.into_output())
    }

    /// Downloads the key `keyid` from a keyserver into this database.
    ///
    /// `keyid` must be a key ID or fingerprint, never a user id. The
    /// keyserver, when given, only applies to this call.
    pub async fn fetch_keys(&self, keyid: &str, keyserver: Option<&str>) -> Result<bool> {
        let keyid = validate_keyid(keyid)?;
        let mut ctx = self.context.clone();
        if let Some(keyserver) = keyserver {
            ctx.set_option("keyserver", Some(keyserver));
        }

        let mut session = Session::start(&ctx, "recv-keys", [&keyid])?;
        let code = session.close().await?;
        if code != 0 {
            warn!(%keyid, code, diagnostics = %session.diagnostics(), "fetching key failed");
        }
        Ok(code == 0)
    }

    /// Loads the keys matching `pattern` (all keys if `None`).
    ///
    /// The public and secret listings are folded into one record per key.
    /// Returns `None` when nothing matched. A public key without secret
    /// material is still a match when both passes are asked for.
    pub async fn get_keys(
        &self,
        pattern: Option<&str>,
        secret: bool,
        public: bool,
    ) -> Result<Option<KeyMap>> {
        let mut keys = KeyMap::new();
        if public && !self.list_into("list-keys", pattern, &mut keys).await? {
            return Ok(None);
        }
        if secret {
            self.list_into("list-secret-keys", pattern, &mut keys).await?;
        }
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(keys))
    }

    /// Certifies every user id of the key matching `pattern`, or only the
    /// user id whose text is `pattern` when `sign_all` is false.
    pub async fn sign_key(&self, pattern: &str, sign_all: bool) -> Result<bool> {
        self.sign_key_with(pattern, plain_options(pattern, sign_all, false), |_| {})
            .await
    }

    /// Like [`sign_key`](Self::sign_key), but the certification is local
    /// and never exported.
    pub async fn locally_sign_key(&self, pattern: &str, sign_all: bool) -> Result<bool> {
        self.sign_key_with(pattern, plain_options(pattern, sign_all, true), |_| {})
            .await
    }

    /// Certifies the key matching `pattern` as described by `options`,
    /// reporting the conversation's progress to `callback`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example() -> gpg_keysign::Result<()> {
    /// use gpg_keysign::{Keyring, SignOptions, SignTarget};
    ///
    /// let keyring = Keyring::new();
    /// let options = SignOptions {
    ///     target: SignTarget::Position(2),
    ///     local: false,
    ///     timeout_secs: Some(300),
    /// };
    /// keyring
    ///     .sign_key_with("7B75921E", options, |p| println!("{p:?}"))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn sign_key_with<F>(
        &self,
        pattern: &str,
        options: SignOptions,
        callback: F,
    ) -> Result<bool>
    where
        F: FnMut(SignProgress),
    {
        let signing = self.sign_key_inner(pattern, &options, callback);

        match options.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), signing)
                .await
                .map_err(|_| Error::Timeout(secs))?,
            None => signing.await,
        }
    }

    async fn sign_key_inner<F>(
        &self,
        pattern: &str,
        options: &SignOptions,
        callback: F,
    ) -> Result<bool>
    where
        F: FnMut(SignProgress),
    {
        if options.target != SignTarget::All {
            self.resolve_identity(pattern, &options.target).await?;
        }
        let mut conversation = SigningConversation::start(
            &self.context,
            pattern,
            options.target.clone(),
            options.local,
        )?;
        conversation.run_with(callback).await
    }

    /// Makes sure the identity a conversation will look for is listed.
    async fn resolve_identity(&self, pattern: &str, target: &SignTarget) -> Result<()> {
        let keys = self
            .get_keys(Some(pattern), false, true)
            .await?
            .ok_or_else(|| Error::KeyNotFound(pattern.to_string()))?;
        let found = keys.values().any(|key| match target {
            SignTarget::All => true,
            SignTarget::Uid(uid) => key.uid_position(uid).is_some(),
            SignTarget::Position(n) => (1..=key.uids.len()).contains(n),
        });
        if !found {
            return Err(Error::KeyNotFound(format!("{target} on key {pattern}")));
        }
        Ok(())
    }

    /// Lists the signatures on the keys matching `pattern`.
    pub async fn list_signatures(&self, pattern: Option<&str>) -> Result<Vec<Signature>> {
        let mut session = Session::start(&self.context, "list-sigs", pattern)?;
        let code = session.close().await?;
        match code {
            0 => parse_signatures(&String::from_utf8_lossy(session.output())),
            NO_KEYS_EXIT_CODE => Ok(Vec::new()),
            _ => Err(self.check_error(code, &session.diagnostics())),
        }
    }

    /// Encrypts `data` to `recipient`; armored if the context carries
    /// `armor`.
    pub async fn encrypt_data(&self, data: &[u8], recipient: &str) -> Result<Vec<u8>> {
        let mut ctx = self.context.clone();
        ctx.set_option("recipient", Some(recipient));

        let mut session = Session::start(&ctx, "encrypt", NO_ARGS)?;
        session.feed(data.to_vec())?;
        let code = session.close().await?;
        if code != 0 {
            return Err(self.check_error(code, &session.diagnostics()));
        }
        Ok(session.into_output())
    }

    /// The version of the gpg binary, e.g. `2.2.40`.
    pub async fn version(&self) -> Result<String> {
        let mut session = Session::start(&self.context, "version", NO_ARGS)?;
        let code = session.close().await?;
        let output = String::from_utf8_lossy(session.output());
        if code != 0 {
            return Err(self.check_error(code, &session.diagnostics()));
        }
        parse_version(&output).ok_or_else(|| Error::Protocol {
            expected: "gpg (GnuPG) <version>".to_string(),
            actual: output.lines().next().map(str::to_string),
        })
    }

    /// Runs one listing pass into `keys`; `false` when gpg reported that
    /// nothing matched.
    async fn list_into(
        &self,
        verb: &str,
        pattern: Option<&str>,
        keys: &mut KeyMap,
    ) -> Result<bool> {
        let mut session = Session::start(&self.context, verb, pattern)?;
        let code = session.close().await?;
        match code {
            0 => {
                parse_keys(&String::from_utf8_lossy(session.output()), keys)?;
                Ok(true)
            }
            NO_KEYS_EXIT_CODE => {
                debug!(verb, ?pattern, "no matching keys");
                Ok(false)
            }
            _ => Err(self.check_error(code, &session.diagnostics())),
        }
    }

    fn check_error(&self, status: i32, stderr: &str) -> Error {
        check_gpg_error(self.homedir().as_deref(), status, stderr)
    }
}

async fn import_result(session: &mut Session) -> Result<StatusLine> {
    session.status().seek("IMPORT_OK").await?;
    session.status().seek("IMPORT_RES").await
}

fn plain_options(pattern: &str, sign_all: bool, local: bool) -> SignOptions {
    SignOptions {
        target: if sign_all {
            SignTarget::All
        } else {
            SignTarget::Uid(pattern.to_string())
        },
        local,
        timeout_secs: None,
    }
}

fn parse_version(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.starts_with("gpg (GnuPG"))?;
    let version = line.rsplit(' ').next()?;
    version
        .starts_with(|c: char| c.is_ascii_digit())
        .then(|| version.to_string())
}

fn check_gpg_error(homedir: Option<&Path>, status: i32, stderr: &str) -> Error {
    if stderr.contains("Permission denied") || stderr.contains("permission denied") {
        return Error::PermissionDenied;
    }

    if let Some(homedir) = homedir
        && stderr.contains("No such file or directory")
        && stderr.contains(&*homedir.to_string_lossy())
    {
        return Error::KeyringNotInitialized;
    }

    Error::Gpg {
        status,
        stderr: stderr.to_string(),
    }
}

/// A key database in a fresh temporary directory, removed with everything
/// in it by [`close`](Self::close) or, failing that, on drop.
///
/// Dropping it without `close` waits for `gpgconf` on the current thread,
/// blocking an async runtime's worker while it runs.
///
/// Dereferences to [`Keyring`] for all operations.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpg_keysign::Result<()> {
/// use gpg_keysign::{Keyring, TempKeyring};
///
/// let public = Keyring::new().export_data(Some("7B75921E"), false).await?;
/// let scratch = TempKeyring::new()?;
/// scratch.import_data(&public).await?;
/// scratch.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TempKeyring {
    keyring: Keyring,
    dir: Option<TempDir>,
}

impl TempKeyring {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        debug!(path = %dir.path().display(), "created temporary keyring");
        Ok(Self {
            keyring: Keyring::with_homedir(dir.path()),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        self.keyring.homedir.as_deref().unwrap_or(Path::new(""))
    }

    /// Copies `gpg.conf` from `home` so the temporary database behaves
    /// like the user's own. Returns whether there was one to copy.
    pub fn copy_config_from(&self, home: impl AsRef<Path>) -> Result<bool> {
        let source = home.as_ref().join(CONFIG_FILE);
        match fs::copy(&source, self.path().join(CONFIG_FILE)) {
            Ok(_) => {
                debug!(source = %source.display(), "copied gpg configuration");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Stops the gpg daemons started for this directory and deletes it.
    pub async fn close(mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        let status = tokio::process::Command::new(GPGCONF_BINARY)
            .env("GNUPGHOME", dir.path())
            .arg("--homedir")
            .arg(dir.path())
            .args(["--kill", "all"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(err) = status {
            debug!(%err, "could not stop gpg daemons");
        }

        remove_dir(dir)
    }
}

impl Deref for TempKeyring {
    type Target = Keyring;

    fn deref(&self) -> &Keyring {
        &self.keyring
    }
}

impl DerefMut for TempKeyring {
    fn deref_mut(&mut self) -> &mut Keyring {
        &mut self.keyring
    }
}

impl Drop for TempKeyring {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let status = std::process::Command::new(GPGCONF_BINARY)
                .env("GNUPGHOME", dir.path())
                .arg("--homedir")
                .arg(dir.path())
                .args(["--kill", "all"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(err) = status {
                debug!(%err, "could not stop gpg daemons");
            }
            if let Err(err) = remove_dir(dir) {
                warn!(%err, "failed to remove temporary keyring");
            }
        }
    }
}

fn remove_dir(dir: TempDir) -> Result<()> {
    let path = dir.path().to_path_buf();
    match dir.close() {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "temporary keyring already gone");
            Ok(())
        }
        result => {
            debug!(path = %path.display(), "removed temporary keyring");
            Ok(result?)
        }
    }
}
