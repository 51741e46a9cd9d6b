//! Driving `gpg` as a subprocess to inspect, exchange and certify keys.
//!
//! gpg has no stable library interface. This crate talks to it the way
//! its own frontends do: machine-readable status lines on `--status-fd`,
//! answers to prompts on `--command-fd`, and `--with-colons` listings,
//! and returns Rust types.
//!
//! # Example
//!
//! ```no_run
//! use gpg_keysign::{Keyring, TempKeyring};
//!
//! #[tokio::main]
//! async fn main() -> gpg_keysign::Result<()> {
//!     let keyring = Keyring::new();
//!     let public = keyring.export_data(Some("7B75921E"), false).await?;
//!
//!     // Certify in a scratch database so the user's keyring is untouched.
//!     let scratch = TempKeyring::new()?;
//!     scratch.import_data(&public).await?;
//!     if scratch.sign_key("7B75921E", true).await? {
//!         let signed = scratch.export_data(Some("7B75921E"), false).await?;
//!         println!("{} bytes of signed key", signed.len());
//!     }
//!     scratch.close().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Requirements
//!
//! - `gpg` (GnuPG 2.x) on `PATH`, or a path set with [`Context::with_binary`]
//! - `gpgconf` to stop the agents of a [`TempKeyring`]
//! - a pinentry or a running agent for operations that need a passphrase

mod context;
mod error;
mod keyring;
mod parse;
mod session;
mod sign;
mod status;
mod types;
mod validation;

#[cfg(test)]
mod test_util;

pub use context::{Context, DEFAULT_OPTIONS, TRAILING_OPTIONS};
pub use error::{Error, Result};
pub use keyring::{Keyring, NO_KEYS_EXIT_CODE, TempKeyring, default_homedir};
pub use parse::{KeyFields, Record, TrustFields, UidFields, parse_keys, parse_signatures};
pub use session::{Session, StatusLeg};
pub use sign::{SignOptions, SignProgress, SignState, SignTarget, SigningConversation};
pub use status::{STATUS_PREFIX, StatusLine, StatusScanner};
pub use types::{Capabilities, Key, KeyFlags, KeyMap, KeyValidity, Signature, Subkey, Uid};
pub use validation::validate_keyid;
