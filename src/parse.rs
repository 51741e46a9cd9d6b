//! Decoding of `--with-colons` listings.
//!
//! Every line is one record; its first field is a tag selecting how the
//! remaining fields are read. See `doc/DETAILS` in the GnuPG sources for
//! the column layout. Unknown tags are an error: a key missing a record we
//! do not understand would look complete while carrying the wrong flags.

use chrono::NaiveDateTime;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::{Capabilities, Key, KeyFlags, KeyMap, KeyValidity, Signature, Subkey, Uid};

/// Fields shared by `pub`, `sec`, `sub` and `ssb` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFields {
    pub validity: KeyValidity,
    pub length: u32,
    pub algorithm: u32,
    pub keyid: String,
    pub creation: i64,
    pub expiry: i64,
    pub capabilities: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidFields {
    pub validity: KeyValidity,
    pub creation: i64,
    pub expiry: i64,
    pub hash: String,
    pub uid: String,
}

/// The `tru` line summarising the trust database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustFields {
    pub stale: bool,
    pub model: u32,
    pub creation: i64,
    pub expiry: i64,
}

/// One line of a colon listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    PublicKey(KeyFields),
    SecretKey(KeyFields),
    Fingerprint(String),
    PublicSubkey(KeyFields),
    SecretSubkey(KeyFields),
    Uid(UidFields),
    Trust(TrustFields),
    UserAttribute,
    RevocationKey,
    Keygrip,
    Blank,
}

type Decoder = fn(&[&str], &str) -> Result<Record>;

const DECODERS: &[(&str, Decoder)] = &[
    ("pub", decode_pub),
    ("sec", decode_sec),
    ("fpr", decode_fpr),
    ("sub", decode_sub),
    ("ssb", decode_ssb),
    ("uid", decode_uid),
    ("tru", decode_tru),
    ("uat", ignore_uat),
    ("rvk", ignore_rvk),
    ("grp", ignore_grp),
    ("", blank),
];

fn decode_pub(fields: &[&str], line: &str) -> Result<Record> {
    key_fields(fields, line).map(Record::PublicKey)
}

fn decode_sec(fields: &[&str], line: &str) -> Result<Record> {
    key_fields(fields, line).map(Record::SecretKey)
}

fn decode_fpr(fields: &[&str], line: &str) -> Result<Record> {
    let fpr = required(fields, 9, line)?;
    Ok(Record::Fingerprint(fpr.to_string()))
}

fn decode_sub(fields: &[&str], line: &str) -> Result<Record> {
    key_fields(fields, line).map(Record::PublicSubkey)
}

fn decode_ssb(fields: &[&str], line: &str) -> Result<Record> {
    key_fields(fields, line).map(Record::SecretSubkey)
}

fn decode_uid(fields: &[&str], line: &str) -> Result<Record> {
    uid_fields(fields, line).map(Record::Uid)
}

fn decode_tru(fields: &[&str], line: &str) -> Result<Record> {
    trust_fields(fields, line).map(Record::Trust)
}

fn ignore_uat(_: &[&str], _: &str) -> Result<Record> {
    Ok(Record::UserAttribute)
}

fn ignore_rvk(_: &[&str], _: &str) -> Result<Record> {
    Ok(Record::RevocationKey)
}

fn ignore_grp(_: &[&str], _: &str) -> Result<Record> {
    Ok(Record::Keygrip)
}

fn blank(_: &[&str], _: &str) -> Result<Record> {
    Ok(Record::Blank)
}

impl Record {
    pub fn decode(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        let tag = fields[0];

        let (_, decode) = DECODERS
            .iter()
            .find(|(t, _)| *t == tag)
            .ok_or_else(|| Error::UnknownRecord {
                tag: tag.to_string(),
                line: line.to_string(),
            })?;

        decode(&fields, line)
    }
}

/// Folds a `--list-keys` or `--list-secret-keys` dump into `keys`.
///
/// Records of a key already present in `keys` (same fingerprint, or same
/// key id when fingerprints are missing) are merged into it, so a public
/// pass followed by a secret pass yields one key with `secret` set.
pub fn parse_keys(output: &str, keys: &mut KeyMap) -> Result<()> {
    let mut state = ListingState::default();

    for line in output.lines() {
        let record = Record::decode(line)?;
        trace!(?record, "decoded listing record");
        state.apply(record, line, keys)?;
    }

    state.commit(keys);
    Ok(())
}

#[derive(Default)]
struct ListingState {
    key: Option<Key>,
    subkey: Option<Subkey>,
}

impl ListingState {
    fn apply(&mut self, record: Record, line: &str, keys: &mut KeyMap) -> Result<()> {
        match record {
            Record::PublicKey(fields) => {
                self.commit(keys);
                self.key = Some(new_key(fields, false));
            }
            Record::SecretKey(fields) => {
                self.commit(keys);
                self.key = Some(new_key(fields, true));
            }
            Record::Fingerprint(fpr) => {
                if let Some(subkey) = self.subkey.as_mut() {
                    subkey.fingerprint.get_or_insert(fpr);
                } else if let Some(key) = self.key.as_mut() {
                    key.fingerprint.get_or_insert(fpr);
                } else {
                    return Err(orphan(line, "fingerprint"));
                }
            }
            Record::PublicSubkey(fields) => {
                self.open_subkey(new_subkey(fields, false), line)?;
            }
            Record::SecretSubkey(fields) => {
                self.open_subkey(new_subkey(fields, true), line)?;
            }
            Record::Uid(fields) => {
                self.flush_subkey();
                let key = self.key.as_mut().ok_or_else(|| orphan(line, "user id"))?;
                key.push_uid(Uid {
                    uid: fields.uid,
                    validity: fields.validity,
                    creation: fields.creation,
                    expiry: fields.expiry,
                    hash: fields.hash,
                });
            }
            Record::Trust(trust) => {
                if trust.stale {
                    debug!("trust database needs a check");
                }
            }
            Record::UserAttribute | Record::RevocationKey | Record::Keygrip | Record::Blank => {}
        }
        Ok(())
    }

    fn open_subkey(&mut self, subkey: Subkey, line: &str) -> Result<()> {
        self.flush_subkey();
        if self.key.is_none() {
            return Err(orphan(line, "subkey"));
        }
        self.subkey = Some(subkey);
        Ok(())
    }

    fn flush_subkey(&mut self) {
        if let Some(subkey) = self.subkey.take()
            && let Some(key) = self.key.as_mut()
        {
            key.push_subkey(subkey);
        }
    }

    fn commit(&mut self, keys: &mut KeyMap) {
        self.flush_subkey();
        if let Some(key) = self.key.take() {
            keys.insert(key);
        }
    }
}

fn new_key(fields: KeyFields, secret: bool) -> Key {
    Key {
        fingerprint: None,
        keyid: Some(fields.keyid),
        length: fields.length,
        algorithm: fields.algorithm,
        creation: fields.creation,
        expiry: fields.expiry,
        validity: fields.validity,
        capabilities: Capabilities::from_letters(&fields.capabilities),
        flags: KeyFlags::from_listing(fields.validity, &fields.capabilities),
        secret,
        uids: Vec::new(),
        subkeys: Vec::new(),
    }
}

fn new_subkey(fields: KeyFields, secret: bool) -> Subkey {
    Subkey {
        capabilities: Capabilities::from_letters(&fields.capabilities),
        flags: KeyFlags::from_listing(fields.validity, &fields.capabilities),
        keyid: fields.keyid,
        fingerprint: None,
        length: fields.length,
        algorithm: fields.algorithm,
        creation: fields.creation,
        expiry: fields.expiry,
        validity: fields.validity,
        secret,
    }
}

fn orphan(line: &str, what: &str) -> Error {
    Error::MalformedRecord {
        line: line.to_string(),
        reason: format!("{what} without an owning key"),
    }
}

fn key_fields(fields: &[&str], line: &str) -> Result<KeyFields> {
    arity(fields, 12, line)?;
    Ok(KeyFields {
        validity: KeyValidity::from_field(fields[1]),
        length: parse_number(fields[2], line)?,
        algorithm: parse_number(fields[3], line)?,
        keyid: fields[4].to_string(),
        creation: parse_creation(fields[5], line)?,
        expiry: parse_expiry(fields[6], line)?,
        capabilities: fields[11].to_string(),
    })
}

fn uid_fields(fields: &[&str], line: &str) -> Result<UidFields> {
    arity(fields, 10, line)?;
    Ok(UidFields {
        validity: KeyValidity::from_field(fields[1]),
        creation: parse_creation(fields[5], line)?,
        expiry: parse_expiry(fields[6], line)?,
        hash: fields[7].to_string(),
        uid: unescape(fields[9]),
    })
}

fn trust_fields(fields: &[&str], line: &str) -> Result<TrustFields> {
    let get = |i: usize| fields.get(i).copied().unwrap_or_default();
    Ok(TrustFields {
        stale: get(1) == "o",
        model: parse_number(get(2), line)?,
        creation: parse_expiry(get(3), line)?,
        expiry: parse_expiry(get(4), line)?,
    })
}

fn arity(fields: &[&str], min: usize, line: &str) -> Result<()> {
    if fields.len() < min {
        return Err(Error::MalformedRecord {
            line: line.to_string(),
            reason: format!("expected at least {min} fields, found {}", fields.len()),
        });
    }
    Ok(())
}

fn required<'a>(fields: &[&'a str], index: usize, line: &str) -> Result<&'a str> {
    arity(fields, index + 1, line)?;
    match fields[index] {
        "" => Err(Error::MalformedRecord {
            line: line.to_string(),
            reason: format!("field {} is empty", index + 1),
        }),
        value => Ok(value),
    }
}

fn parse_number(field: &str, line: &str) -> Result<u32> {
    if field.is_empty() {
        return Ok(0);
    }
    field.parse().map_err(|_| Error::MalformedRecord {
        line: line.to_string(),
        reason: format!("'{field}' is not a number"),
    })
}

/// Creation dates: empty means unavailable (`-1`).
fn parse_creation(field: &str, line: &str) -> Result<i64> {
    match field {
        "" => Ok(-1),
        _ => parse_timestamp(field, line),
    }
}

/// Expiry dates: empty means never (`0`).
fn parse_expiry(field: &str, line: &str) -> Result<i64> {
    match field {
        "" => Ok(0),
        _ => parse_timestamp(field, line),
    }
}

/// Timestamps are seconds since the epoch, or ISO 8601 basic format
/// (`20210101T000000`) when gpg runs without `--fixed-list-mode`.
fn parse_timestamp(field: &str, line: &str) -> Result<i64> {
    if let Ok(secs) = field.parse::<i64>() {
        return Ok(secs);
    }
    NaiveDateTime::parse_from_str(field, "%Y%m%dT%H%M%S")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| Error::MalformedRecord {
            line: line.to_string(),
            reason: format!("'{field}' is not a timestamp"),
        })
}

/// Undoes the `\xHH` escaping gpg applies to colons and control
/// characters in user ids.
pub(crate) fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && let Some(hex) = field.get(i + 2..i + 4)
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            out.push(byte);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

pub fn parse_signatures(output: &str) -> Result<Vec<Signature>> {
    let mut signatures = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields[0] != "sig" {
            continue;
        }

        if fields.len() > 9 {
            let keyid = fields[4];
            if keyid.is_empty() {
                debug!("skipping signature with empty keyid");
                continue;
            }

            signatures.push(Signature {
                keyid: keyid.to_string(),
                created: date(fields[5]),
                expires: date(fields[6]),
                uid: unescape(fields[9]),
                sig_class: fields.get(10).copied().unwrap_or_default().to_string(),
            });
        }
    }

    Ok(signatures)
}

fn date(field: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    field
        .parse::<i64>()
        .ok()
        .filter(|ts| *ts > 0)
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
}
