//! The `--sign-key` prompt exchange.
//!
//! gpg asks a fixed sequence of questions on the status leg and reads the
//! answers from the command leg. [`SigningConversation`] walks that
//! sequence as an explicit state machine: any unexpected line kills gpg,
//! so a half-answered signature is never saved.

use std::fmt;

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::parse::unescape;
use crate::session::Session;
use crate::status::StatusLine;

const SIGN_ALL_PROMPT: &str = r"GET_BOOL keyedit\.sign_all\.okay";
const SIGN_UID_PROMPT: &str = r"GET_BOOL sign_uid\.okay";
const MENU_PROMPT: &str = r"GET_LINE keyedit\.prompt";
const SAVE_PROMPT: &str = r"GET_BOOL keyedit\.save\.okay";
const GOOD_PASSPHRASE: &str = "GOOD_PASSPHRASE";
const BAD_PASSPHRASE: &str = "BAD_PASSPHRASE";
const KEYSIG_ERROR: &str = "ERROR keysig";
const ALREADY_SIGNED: &str = "ALREADY_SIGNED";

/// Which identities of a key to certify.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SignTarget {
    /// Every user id on the key.
    #[default]
    All,
    /// The user id with exactly this text.
    Uid(String),
    /// The n-th user id, counting from 1 in listing order. Photo ids are
    /// not counted.
    Position(usize),
}

impl fmt::Display for SignTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all user ids"),
            Self::Uid(uid) => write!(f, "user id {uid:?}"),
            Self::Position(n) => write!(f, "user id #{n}"),
        }
    }
}

/// Options for [`Keyring::sign_key_with`](crate::Keyring::sign_key_with).
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    pub target: SignTarget,
    /// Make a non-exportable certification (`--lsign-key`).
    pub local: bool,
    /// Kill gpg if the conversation has not finished by then.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignState {
    Start,
    ConfirmSignAll,
    SelectIdentity,
    ConfirmSignature,
    PassphraseConfirmed,
    Save,
    Done,
    Aborted,
}

/// Progress reported while a conversation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignProgress {
    Entered(SignState),
    Completed,
    Failed { message: String },
}

/// Drives one `--sign-key` (or `--lsign-key`) invocation to completion.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpg_keysign::Result<()> {
/// use gpg_keysign::{Context, SignTarget, SigningConversation};
///
/// let ctx = Context::new();
/// let mut conversation =
///     SigningConversation::start(&ctx, "7B75921E", SignTarget::All, false)?;
/// let signed = conversation.run_with(|p| println!("{p:?}")).await?;
/// # Ok(())
/// # }
/// ```
pub struct SigningConversation {
    session: Session,
    pattern: String,
    target: SignTarget,
    local: bool,
    state: SignState,
    sign_prompt_pending: bool,
    save_prompt_pending: Option<StatusLine>,
    selected: bool,
    conflict: Option<String>,
}

impl SigningConversation {
    /// Starts gpg on `pattern`; nothing is answered until [`run`](Self::run).
    pub fn start(ctx: &Context, pattern: &str, target: SignTarget, local: bool) -> Result<Self> {
        let verb = if local { "lsign-key" } else { "sign-key" };
        let session = Session::start(ctx, verb, [pattern])?;
        Ok(Self {
            session,
            pattern: pattern.to_string(),
            target,
            local,
            state: SignState::Start,
            sign_prompt_pending: false,
            save_prompt_pending: None,
            selected: false,
            conflict: None,
        })
    }

    pub fn state(&self) -> SignState {
        self.state
    }

    pub async fn run(&mut self) -> Result<bool> {
        self.run_with(|_| {}).await
    }

    /// Runs the exchange, reporting every state change to `callback`.
    ///
    /// Returns whether gpg exited successfully after the last answer. On
    /// error gpg has already been killed and the state is
    /// [`SignState::Aborted`].
    pub async fn run_with<F>(&mut self, mut callback: F) -> Result<bool>
    where
        F: FnMut(SignProgress),
    {
        match self.drive(&mut callback).await {
            Ok(signed) => {
                info!(pattern = %self.pattern, signed, "signing finished");
                callback(SignProgress::Completed);
                Ok(signed)
            }
            Err(err) => {
                let err = self.fail(err).await;
                callback(SignProgress::Entered(SignState::Aborted));
                callback(SignProgress::Failed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn drive<F>(&mut self, callback: &mut F) -> Result<bool>
    where
        F: FnMut(SignProgress),
    {
        loop {
            debug!(state = ?self.state, "signing");
            callback(SignProgress::Entered(self.state));
            self.state = match self.state {
                SignState::Start => self.on_start().await?,
                SignState::ConfirmSignAll => self.on_confirm_sign_all().await?,
                SignState::SelectIdentity => self.on_select_identity().await?,
                SignState::ConfirmSignature => self.on_confirm_signature().await?,
                SignState::PassphraseConfirmed => self.on_passphrase_confirmed().await?,
                SignState::Save => self.on_save().await?,
                SignState::Done => return self.finish().await,
                SignState::Aborted => return Err(Error::SessionClosed),
            };
        }
    }

    async fn on_start(&mut self) -> Result<SignState> {
        let line = self
            .seek(&format!("{SIGN_ALL_PROMPT}|{SIGN_UID_PROMPT}"))
            .await?;
        // A key with a single user id skips the sign-all question.
        if line.arg(0) == Some("sign_uid.okay") {
            self.sign_prompt_pending = true;
            Ok(SignState::ConfirmSignature)
        } else {
            Ok(SignState::ConfirmSignAll)
        }
    }

    async fn on_confirm_sign_all(&mut self) -> Result<SignState> {
        if self.target == SignTarget::All {
            self.answer("y").await?;
            Ok(SignState::ConfirmSignature)
        } else {
            self.answer("n").await?;
            Ok(SignState::SelectIdentity)
        }
    }

    async fn on_select_identity(&mut self) -> Result<SignState> {
        self.seek(MENU_PROMPT).await?;
        let position = self.find_identity().await?;
        self.answer(&position.to_string()).await?;
        self.seek(MENU_PROMPT).await?;
        self.answer(if self.local { "lsign" } else { "sign" }).await?;
        self.selected = true;
        Ok(SignState::ConfirmSignature)
    }

    async fn on_confirm_signature(&mut self) -> Result<SignState> {
        if !std::mem::take(&mut self.sign_prompt_pending) {
            self.seek(SIGN_UID_PROMPT).await?;
        }
        self.answer("y").await?;
        Ok(SignState::PassphraseConfirmed)
    }

    /// gpg 2.1 and later sign through the agent and never report
    /// `GOOD_PASSPHRASE`: the next thing seen is the save prompt or, when
    /// every identity was signed, the end of the stream.
    async fn on_passphrase_confirmed(&mut self) -> Result<SignState> {
        let pattern = format!(
            "{GOOD_PASSPHRASE}|{BAD_PASSPHRASE}|{KEYSIG_ERROR}|{MENU_PROMPT}|{SAVE_PROMPT}"
        );
        let line = match self.seek(&pattern).await {
            Ok(line) => line,
            Err(Error::Protocol { actual: None, .. }) if !self.selected => {
                debug!("gpg saved without asking");
                return Ok(SignState::Done);
            }
            Err(err) => return Err(err),
        };
        match line.keyword.as_str() {
            GOOD_PASSPHRASE if self.selected => Ok(SignState::Save),
            GOOD_PASSPHRASE => Ok(SignState::Done),
            "GET_LINE" | "GET_BOOL" => {
                self.save_prompt_pending = Some(line);
                Ok(SignState::Save)
            }
            _ => Err(Error::Protocol {
                expected: GOOD_PASSPHRASE.to_string(),
                actual: Some(line.to_string()),
            }),
        }
    }

    async fn on_save(&mut self) -> Result<SignState> {
        let line = match self.save_prompt_pending.take() {
            Some(line) => line,
            None => self.seek(&format!("{MENU_PROMPT}|{SAVE_PROMPT}")).await?,
        };
        if line.keyword == "GET_BOOL" {
            self.answer("y").await?;
        } else {
            self.answer("save").await?;
        }
        Ok(SignState::Done)
    }

    async fn finish(&mut self) -> Result<bool> {
        let code = self.session.close().await?;
        if code != 0
            && let Some(keyid) = self.conflict.take()
        {
            return Err(Error::SigningConflict(keyid));
        }
        Ok(code == 0)
    }

    /// Scans the identity rows gpg listed before its menu prompt and
    /// returns the menu index of the target.
    ///
    /// The menu numbers photo ids (`uat`) along with user ids; each row
    /// carries its own index in field 14.
    async fn find_identity(&mut self) -> Result<usize> {
        let mut rows = 0;
        let mut position = 0;
        while let Some(line) = self.session.read_output_line().await? {
            let fields: Vec<&str> = line.split(':').collect();
            if !matches!(fields[0], "uid" | "uat") {
                continue;
            }
            rows += 1;
            let index = menu_index(&fields).unwrap_or(rows);
            if fields[0] != "uid" {
                continue;
            }
            position += 1;
            let text = fields.get(9).map(|f| unescape(f)).unwrap_or_default();
            let found = match &self.target {
                SignTarget::Uid(uid) => *uid == text,
                SignTarget::Position(n) => *n == position,
                SignTarget::All => false,
            };
            if found {
                debug!(index, position, uid = %text, "selected identity");
                return Ok(index);
            }
        }
        Err(Error::KeyNotFound(format!(
            "{} on key {}",
            self.target, self.pattern
        )))
    }

    async fn answer(&mut self, line: &str) -> Result<()> {
        self.session.write_line(line).await?;
        self.expect("GOT_IT").await?;
        Ok(())
    }

    async fn expect(&mut self, pattern: &str) -> Result<StatusLine> {
        self.session.status().expect(pattern).await
    }

    /// Seeks `pattern`, noting any `ALREADY_SIGNED` passed on the way.
    async fn seek(&mut self, pattern: &str) -> Result<StatusLine> {
        let watched = format!("{ALREADY_SIGNED}|{pattern}");
        loop {
            let line = self.session.status().seek(&watched).await?;
            if line.keyword != ALREADY_SIGNED {
                return Ok(line);
            }
            let keyid = line.arg(0).unwrap_or(&self.pattern).to_string();
            debug!(%keyid, "already signed");
            self.conflict = Some(keyid);
        }
    }

    async fn fail(&mut self, err: Error) -> Error {
        self.state = SignState::Aborted;
        if let Err(abort_err) = self.session.abort().await {
            warn!(%abort_err, "failed to reap gpg");
        }
        warn!(pattern = %self.pattern, %err, "signing aborted");
        match (self.conflict.take(), err) {
            (Some(keyid), Error::Protocol { .. }) => Error::SigningConflict(keyid),
            (_, err) => err,
        }
    }
}

/// The `index,flags` field of an edit-menu identity row.
fn menu_index(fields: &[&str]) -> Option<usize> {
    fields.get(13)?.split(',').next()?.parse().ok()
}
