//! Embedded transaction parameters.
//!
//! A push carries its fee, nonce, push-key id and signature in the last
//! line of the pushed commit message, tag message, or note blob:
//!
//! ```text
//! tx: fee=1 nonce=4 pkID=pk1abc... sig=z3x... [mergeID=0001] [deleteRef]
//! ```
//!
//! The signature covers the enclosing git object's content with the
//! `sig` token stripped, so it can be computed before the final object
//! exists.

use std::str::FromStr;
use std::{fmt, num::ParseIntError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{PublicKey, Signature, SignatureError};
use crate::git::Oid;

/// Line prefix announcing transaction parameters.
pub const PREFIX: &str = "tx:";
/// Prefix of a push-key identifier.
pub const PUSH_KEY_PREFIX: &str = "pk";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("message has no transaction parameters")]
    Missing,
    #[error("unknown transaction parameter '{0}'")]
    UnknownField(String),
    #[error("duplicate transaction parameter '{0}'")]
    DuplicateField(&'static str),
    #[error("missing transaction parameter '{0}'")]
    MissingField(&'static str),
    #[error("invalid value for '{field}': {err}")]
    InvalidInt {
        field: &'static str,
        err: ParseIntError,
    },
    #[error("push key id is malformed")]
    PushKey(#[from] PushKeyError),
    #[error("invalid signature encoding: {0}")]
    Signature(#[from] SignatureError),
    #[error("invalid merge proposal id '{0}'")]
    MergeId(String),
}

#[derive(Error, Debug)]
pub enum PushKeyError {
    #[error("push key id is missing the '{}' prefix", PUSH_KEY_PREFIX)]
    Prefix,
    #[error("push key id has invalid length {0}")]
    Length(usize),
    #[error("invalid character '{0}' in push key id")]
    InvalidCharacter(char),
}

/// An on-chain push-key identifier. Resolved to a public key and owner
/// address through the chain; never interpreted locally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PushKeyId(String);

impl PushKeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the identifier for an ed25519 push key.
    pub fn of(key: &PublicKey) -> Self {
        let encoded = multibase::encode(multibase::Base::Base58Btc, key.0.as_ref());

        Self(format!("{PUSH_KEY_PREFIX}{encoded}"))
    }
}

impl fmt::Display for PushKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PushKeyId {
    type Err = PushKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix(PUSH_KEY_PREFIX).ok_or(PushKeyError::Prefix)?;

        if body.len() < 32 || body.len() > 64 {
            return Err(PushKeyError::Length(s.len()));
        }
        if let Some(c) = body.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(PushKeyError::InvalidCharacter(c));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for PushKeyId {
    type Error = PushKeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<PushKeyId> for String {
    fn from(id: PushKeyId) -> Self {
        id.0
    }
}

/// A four-digit merge proposal identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MergeId(u16);

impl MergeId {
    pub fn number(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for MergeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for MergeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(ParseError::MergeId(s.to_owned()));
        }
        Ok(Self(s.parse().map_err(|_| ParseError::MergeId(s.to_owned()))?))
    }
}

impl TryFrom<String> for MergeId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<MergeId> for String {
    fn from(id: MergeId) -> Self {
        id.to_string()
    }
}

/// The transaction descriptor embedded in a pushed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxParams {
    pub fee: u64,
    pub nonce: u64,
    pub push_key: PushKeyId,
    pub signature: Option<Signature>,
    pub merge_id: Option<MergeId>,
    pub delete_ref: bool,
}

impl TxParams {
    /// Parse a `tx:` line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let rest = line.trim().strip_prefix(PREFIX).ok_or(ParseError::Missing)?;

        let mut fee = None;
        let mut nonce = None;
        let mut push_key = None;
        let mut signature = None;
        let mut merge_id = None;
        let mut delete_ref = false;

        for token in rest.split_whitespace() {
            match token.split_once('=') {
                Some(("fee", v)) => set_int(&mut fee, "fee", v)?,
                Some(("nonce", v)) => set_int(&mut nonce, "nonce", v)?,
                Some(("pkID", v)) => {
                    if push_key.replace(v.parse::<PushKeyId>()?).is_some() {
                        return Err(ParseError::DuplicateField("pkID"));
                    }
                }
                Some(("sig", v)) => {
                    if signature.replace(v.parse::<Signature>()?).is_some() {
                        return Err(ParseError::DuplicateField("sig"));
                    }
                }
                Some(("mergeID", v)) => {
                    if merge_id.replace(v.parse::<MergeId>()?).is_some() {
                        return Err(ParseError::DuplicateField("mergeID"));
                    }
                }
                None if token == "deleteRef" => delete_ref = true,
                _ => return Err(ParseError::UnknownField(token.to_owned())),
            }
        }

        Ok(Self {
            fee: fee.ok_or(ParseError::MissingField("fee"))?,
            nonce: nonce.ok_or(ParseError::MissingField("nonce"))?,
            push_key: push_key.ok_or(ParseError::MissingField("pkID"))?,
            signature,
            merge_id,
            delete_ref,
        })
    }

    /// Find and parse the `tx:` line of a commit/tag message. The
    /// parameters must be on the message's last non-empty line.
    pub fn from_message(message: &str) -> Result<Self, ParseError> {
        let line = message
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or(ParseError::Missing)?;

        if !line.trim_start().starts_with(PREFIX) {
            return Err(ParseError::Missing);
        }
        Self::parse(line)
    }

    /// The payload a note signature covers:
    /// `fee || nonce || pkID || annotated object hash`.
    pub fn note_payload(&self, annotated: Oid) -> Vec<u8> {
        format!("{}{}{}{}", self.fee, self.nonce, self.push_key, annotated).into_bytes()
    }
}

impl fmt::Display for TxParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX} fee={} nonce={} pkID={}",
            self.fee, self.nonce, self.push_key
        )?;
        if let Some(sig) = &self.signature {
            write!(f, " sig={sig}")?;
        }
        if let Some(merge_id) = &self.merge_id {
            write!(f, " mergeID={merge_id}")?;
        }
        if self.delete_ref {
            write!(f, " deleteRef")?;
        }
        Ok(())
    }
}

fn set_int(slot: &mut Option<u64>, field: &'static str, value: &str) -> Result<(), ParseError> {
    let parsed = value
        .parse()
        .map_err(|err| ParseError::InvalidInt { field, err })?;
    if slot.replace(parsed).is_some() {
        return Err(ParseError::DuplicateField(field));
    }
    Ok(())
}

/// Strip the `sig` token from an object's content, producing the bytes
/// the signature covers.
pub fn strip_signature(content: &str) -> String {
    let mut out = String::with_capacity(content.len());

    for (i, line) in content.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.trim_start().starts_with(PREFIX) {
            let kept = line
                .split(' ')
                .filter(|token| !token.starts_with("sig="))
                .collect::<Vec<_>>()
                .join(" ");
            out.push_str(&kept);
        } else {
            out.push_str(line);
        }
    }
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}
