use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// GPG key validity level.
///
/// Represents how confident GPG is that the key belongs to the claimed identity.
/// This is derived from signature verification and the web of trust, not to be
/// confused with owner trust (how much we trust the key owner to sign other keys).
///
/// Values correspond to GPG's validity field in `--with-colons` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[non_exhaustive]
pub enum KeyValidity {
    /// Validity unknown (new key or insufficient data)
    #[default]
    Unknown,
    /// Validity undefined (not yet computed)
    Undefined,
    /// Key is explicitly distrusted
    Never,
    /// Marginally valid (some trust path exists)
    Marginal,
    /// Fully valid (strong trust path)
    Full,
    /// Ultimately valid (user's own key or explicitly trusted)
    Ultimate,
    /// Key has expired
    Expired,
    /// Key has been revoked
    Revoked,
    /// Key is invalid (e.g. missing self-signature)
    Invalid,
    /// Key has been disabled
    Disabled,
}

impl KeyValidity {
    pub fn from_gpg_char(c: char) -> Self {
        match c {
            'o' => Self::Unknown,
            'q' | '-' => Self::Undefined,
            'n' => Self::Never,
            'm' => Self::Marginal,
            'f' => Self::Full,
            'u' => Self::Ultimate,
            'e' => Self::Expired,
            'r' => Self::Revoked,
            'i' => Self::Invalid,
            'd' => Self::Disabled,
            _ => Self::Unknown,
        }
    }

    pub fn from_field(field: &str) -> Self {
        field
            .chars()
            .next()
            .map(Self::from_gpg_char)
            .unwrap_or_default()
    }
}

/// What a key (or subkey) may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub encrypt: bool,
    pub sign: bool,
    pub certify: bool,
    pub authenticate: bool,
}

impl Capabilities {
    /// Reads a capability field such as `scSC` or `eE`.
    ///
    /// Letters are matched case-insensitively: upper case letters describe
    /// the usable capabilities of the whole key, lower case ones the key
    /// itself, and either is enough to set the flag.
    pub fn from_letters(letters: &str) -> Self {
        let has = |c: char| letters.chars().any(|l| l.eq_ignore_ascii_case(&c));
        Self {
            encrypt: has('e'),
            sign: has('s'),
            certify: has('c'),
            authenticate: has('a'),
        }
    }
}

/// Revocation/expiry state shared by keys and subkeys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFlags {
    pub revoked: bool,
    pub expired: bool,
    pub disabled: bool,
    pub invalid: bool,
}

impl KeyFlags {
    pub(crate) fn from_listing(validity: KeyValidity, capabilities: &str) -> Self {
        Self {
            revoked: validity == KeyValidity::Revoked,
            expired: validity == KeyValidity::Expired,
            disabled: validity == KeyValidity::Disabled || capabilities.contains('D'),
            invalid: validity == KeyValidity::Invalid,
        }
    }

    pub(crate) fn union(&mut self, other: KeyFlags) {
        self.revoked |= other.revoked;
        self.expired |= other.expired;
        self.disabled |= other.disabled;
        self.invalid |= other.invalid;
    }

    /// True when none of the flags rule the key out for use.
    pub fn usable(&self) -> bool {
        !(self.revoked || self.expired || self.disabled || self.invalid)
    }
}

/// An identity (user id) bound to a primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uid {
    pub uid: String,
    pub validity: KeyValidity,
    pub creation: i64,
    pub expiry: i64,
    pub hash: String,
}

/// A subkey bound to a primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subkey {
    pub keyid: String,
    pub fingerprint: Option<String>,
    pub length: u32,
    pub algorithm: u32,
    pub creation: i64,
    pub expiry: i64,
    pub validity: KeyValidity,
    pub capabilities: Capabilities,
    pub flags: KeyFlags,
    pub secret: bool,
}

impl Subkey {
    pub fn created(&self) -> Option<DateTime<Utc>> {
        timestamp(self.creation)
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        timestamp(self.expiry)
    }

    fn merge(&mut self, other: Subkey) {
        if self.fingerprint.is_none() {
            self.fingerprint = other.fingerprint;
        }
        self.flags.union(other.flags);
        self.secret |= other.secret;
    }
}

/// An OpenPGP primary key as reconstructed from one or more listing passes.
///
/// `creation` is `-1` when the listing did not carry a usable timestamp and
/// `expiry` is `0` for keys that never expire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Key {
    pub fingerprint: Option<String>,
    pub keyid: Option<String>,
    pub length: u32,
    pub algorithm: u32,
    pub creation: i64,
    pub expiry: i64,
    pub validity: KeyValidity,
    pub capabilities: Capabilities,
    pub flags: KeyFlags,
    pub secret: bool,
    pub uids: Vec<Uid>,
    pub subkeys: Vec<Subkey>,
}

impl Key {
    /// The string this key is addressed by: its fingerprint, or the key id
    /// when the listing did not include one.
    pub fn address(&self) -> Option<&str> {
        self.fingerprint.as_deref().or(self.keyid.as_deref())
    }

    /// The last `len` hex digits of the fingerprint (or key id).
    pub fn short_id(&self, len: usize) -> &str {
        let id = self.address().unwrap_or_default();
        &id[id.len().saturating_sub(len)..]
    }

    pub fn uid(&self, hash: &str) -> Option<&Uid> {
        self.uids.iter().find(|u| u.hash == hash)
    }

    /// 1-based position of the identity whose text is `uid`.
    pub fn uid_position(&self, uid: &str) -> Option<usize> {
        self.uids.iter().position(|u| u.uid == uid).map(|i| i + 1)
    }

    pub fn subkey(&self, keyid: &str) -> Option<&Subkey> {
        self.subkeys.iter().find(|s| s.keyid == keyid)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        timestamp(self.creation)
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        timestamp(self.expiry)
    }

    /// Adds an identity unless one with the same hash is already present.
    pub(crate) fn push_uid(&mut self, uid: Uid) {
        if self.uid(&uid.hash).is_none() {
            self.uids.push(uid);
        }
    }

    /// Adds a subkey, or folds it into the existing one with the same id.
    pub(crate) fn push_subkey(&mut self, subkey: Subkey) {
        match self.subkeys.iter_mut().find(|s| s.keyid == subkey.keyid) {
            Some(existing) => existing.merge(subkey),
            None => self.subkeys.push(subkey),
        }
    }

    /// Folds a second listing pass of the same key into this one.
    pub(crate) fn merge(&mut self, other: Key) {
        if self.fingerprint.is_none() {
            self.fingerprint = other.fingerprint;
        }
        if self.keyid.is_none() {
            self.keyid = other.keyid;
        }
        self.flags.union(other.flags);
        self.secret |= other.secret;
        for uid in other.uids {
            self.push_uid(uid);
        }
        for subkey in other.subkeys {
            self.push_subkey(subkey);
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pub   {}/{}", self.length, self.short_id(8))?;
        if let Some(created) = self.created() {
            write!(f, " {}", created.date_naive())?;
        }
        if let Some(expires) = self.expires() {
            write!(f, " [expires: {}]", expires.date_naive())?;
        }
        writeln!(f)?;
        if let Some(fpr) = &self.fingerprint {
            writeln!(f, "      Fingerprint = {fpr}")?;
        }
        for uid in &self.uids {
            writeln!(f, "uid   [{:?}] {}", uid.validity, uid.uid)?;
        }
        for sub in &self.subkeys {
            let id = &sub.keyid[sub.keyid.len().saturating_sub(8)..];
            write!(f, "sub   {}/{}", sub.length, id)?;
            if let Some(created) = sub.created() {
                write!(f, " {}", created.date_naive())?;
            }
            if let Some(expires) = sub.expires() {
                write!(f, " [expires: {}]", expires.date_naive())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Keys from one or more listing passes, addressed by fingerprint (or key
/// id when no fingerprint was listed).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyMap {
    keys: BTreeMap<String, Key>,
}

impl KeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<&Key> {
        self.keys.get(address)
    }

    /// Finds a key by fingerprint, key id, or a suffix of either
    /// (`7B75921E` matches the key whose fingerprint ends with it).
    pub fn find(&self, id: &str) -> Option<&Key> {
        let id = id.trim_start_matches("0x").to_uppercase();
        self.keys.values().find(|k| {
            let fpr = k.fingerprint.as_deref().unwrap_or_default();
            let keyid = k.keyid.as_deref().unwrap_or_default();
            (!fpr.is_empty() && fpr.to_uppercase().ends_with(&id))
                || (!keyid.is_empty() && keyid.to_uppercase().ends_with(&id))
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Key)> {
        self.keys.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Key> {
        self.keys.values()
    }

    /// Inserts `key`, merging it into an existing record with the same
    /// fingerprint or, failing that, the same key id.
    pub(crate) fn insert(&mut self, key: Key) {
        let Some(address) = key.address().map(str::to_string) else {
            return;
        };

        if let Some(existing) = self.keys.get_mut(&address) {
            existing.merge(key);
            return;
        }

        if let Some(keyid) = key.keyid.as_deref()
            && let Some(existing) = self
                .keys
                .values_mut()
                .find(|k| k.keyid.as_deref() == Some(keyid))
        {
            existing.merge(key);
            return;
        }

        self.keys.insert(address, key);
    }
}

impl IntoIterator for KeyMap {
    type Item = (String, Key);
    type IntoIter = std::collections::btree_map::IntoIter<String, Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.into_iter()
    }
}

/// A signature on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub keyid: String,
    pub uid: String,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub sig_class: String,
}

impl Signature {
    /// Whether this is an exportable certification of a user id
    /// (classes `10x` to `13x`).
    pub fn is_certification(&self) -> bool {
        matches!(self.sig_class.get(..2), Some("10" | "11" | "12" | "13"))
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}
