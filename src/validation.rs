use crate::error::{Error, Result};

/// Checks that `keyid` names a key unambiguously enough to fetch it from a
/// keyserver, and normalizes it.
///
/// Accepted forms:
/// - 8 hex characters (short key ID, discouraged due to collisions)
/// - 16 hex characters (long key ID)
/// - 40 hex characters (fingerprint), optionally grouped with spaces the
///   way gpg prints it
/// - any of the above with a `0x` prefix
///
/// User ids and e-mail addresses are rejected: a keyserver search by name
/// returns whatever anyone uploaded under that name.
///
/// Returns the key ID uppercased, without prefix or spaces.
pub fn validate_keyid(keyid: &str) -> Result<String> {
    let invalid = |reason: String| Error::InvalidKeyId {
        keyid: keyid.to_string(),
        reason,
    };

    let trimmed = keyid.trim();
    let normalized: String = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| *c != ' ')
        .collect::<String>()
        .to_uppercase();

    if normalized.is_empty() {
        return Err(invalid("key ID cannot be empty".to_string()));
    }

    if !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid(
            "key ID must contain only hexadecimal characters".to_string(),
        ));
    }

    match normalized.len() {
        8 | 16 | 40 => Ok(normalized),
        len => Err(invalid(format!(
            "key ID must be 8, 16, or 40 hex characters (got {len})"
        ))),
    }
}
