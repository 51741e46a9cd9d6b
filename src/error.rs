use std::io;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot start {binary}: {source}")]
    Startup {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error(
        "protocol error: expected {expected:?}, got {}",
        .actual.as_deref().map_or("end of stream".to_string(), |l| format!("{l:?}"))
    )]
    Protocol {
        expected: String,
        actual: Option<String>,
    },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("unknown listing record type '{tag}' in line {line:?}")]
    UnknownRecord { tag: String, line: String },

    #[error("malformed listing record {line:?}: {reason}")]
    MalformedRecord { line: String, reason: String },

    #[error("key already signed: {0}")]
    SigningConflict(String),

    #[error("gpg exited with status {status}: {stderr}")]
    Gpg { status: i32, stderr: String },

    #[error("invalid key ID '{keyid}': {reason}")]
    InvalidKeyId { keyid: String, reason: String },

    #[error("invalid status pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("keyring not initialized")]
    KeyringNotInitialized,

    #[error("permission denied")]
    PermissionDenied,

    #[error("failed to capture gpg {0}")]
    PipeCaptureFailed(&'static str),

    #[error("gpg session already closed")]
    SessionClosed,

    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("i/o error while talking to gpg: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the caller can present this error as a plain message and
    /// carry on (try another source, skip an already certified key).
    ///
    /// Everything else means the conversation with gpg itself went wrong.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::KeyNotFound(_) | Self::SigningConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
