//! BLS12-381 signatures for push-note endorsements.
//!
//! Uses the `min_pk` variant: 48-byte public keys on G1, 96-byte
//! signatures on G2. Aggregation is over distinct messages, since every
//! endorser signs its own `(note-id, public-key)` pair.

use std::cmp::Ordering;
use std::{fmt, str::FromStr};

use blst::min_pk;
use blst::BLST_ERROR;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hash-to-curve domain separation tag, per the BLS signature
/// ciphersuite for G2.
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Compressed public key size in bytes.
pub const PUBLIC_KEY_BYTES: usize = 48;
/// Compressed signature size in bytes.
pub const SIGNATURE_BYTES: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid bls key or signature encoding")]
    Encoding,
    #[error("bls signature verification failed")]
    VerifyFailed,
    #[error("nothing to aggregate")]
    Empty,
}

impl From<BLST_ERROR> for Error {
    fn from(err: BLST_ERROR) -> Self {
        match err {
            BLST_ERROR::BLST_VERIFY_FAIL => Self::VerifyFailed,
            _ => Self::Encoding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid multibase string: {0}")]
    Multibase(#[from] multibase::Error),
    #[error("invalid bls encoding")]
    Encoding,
}

/// A BLS public key, stored compressed.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PublicKey([u8; PUBLIC_KEY_BYTES]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }

    fn to_blst(self) -> Result<min_pk::PublicKey, Error> {
        min_pk::PublicKey::from_bytes(&self.0).map_err(Error::from)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = multibase::Base::Base58Btc;
        write!(f, "{}", multibase::encode(base, self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bls::PublicKey({self})")
    }
}

impl From<PublicKey> for String {
    fn from(pk: PublicKey) -> Self {
        pk.to_string()
    }
}

impl From<[u8; PUBLIC_KEY_BYTES]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_BYTES]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        // Round-trip through blst so that non-curve points are rejected
        // at the boundary.
        let pk = min_pk::PublicKey::from_bytes(bytes)?;

        Ok(Self(pk.to_bytes()))
    }
}

impl FromStr for PublicKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, bytes) = multibase::decode(s)?;

        Self::try_from(bytes.as_slice()).map_err(|_| DecodeError::Encoding)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = DecodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// A BLS signature, stored compressed. Either a single endorser's
/// signature or an aggregate.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Signature([u8; SIGNATURE_BYTES]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_BYTES] {
        &self.0
    }

    fn to_blst(self) -> Result<min_pk::Signature, Error> {
        min_pk::Signature::from_bytes(&self.0).map_err(Error::from)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = multibase::Base::Base58Btc;
        write!(f, "{}", multibase::encode(base, self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bls::Signature({self})")
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.to_string()
    }
}

impl From<[u8; SIGNATURE_BYTES]> for Signature {
    fn from(bytes: [u8; SIGNATURE_BYTES]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        let sig = min_pk::Signature::from_bytes(bytes)?;

        Ok(Self(sig.to_bytes()))
    }
}

impl FromStr for Signature {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, bytes) = multibase::decode(s)?;

        Self::try_from(bytes.as_slice()).map_err(|_| DecodeError::Encoding)
    }
}

impl TryFrom<String> for Signature {
    type Error = DecodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// A BLS secret key.
#[derive(Clone)]
pub struct SecretKey(min_pk::SecretKey);

impl SecretKey {
    /// Derive a secret key from input key material. `ikm` must hold at
    /// least 32 bytes of entropy.
    pub fn from_ikm(ikm: &[u8]) -> Result<Self, Error> {
        min_pk::SecretKey::key_gen(ikm, &[]).map(Self).map_err(Error::from)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk().to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg, DST, &[]).to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("bls::SecretKey").finish()
    }
}

/// Verify a single signature over a message.
pub fn verify(pk: &PublicKey, msg: &[u8], sig: &Signature) -> Result<(), Error> {
    let pk = pk.to_blst()?;
    let sig = sig.to_blst()?;

    match sig.verify(true, msg, DST, &[], &pk, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        err => Err(err.into()),
    }
}

/// Aggregate signatures into one. The caller is responsible for a stable
/// input ordering.
pub fn aggregate(sigs: &[Signature]) -> Result<Signature, Error> {
    let sigs = sigs
        .iter()
        .map(|s| s.to_blst())
        .collect::<Result<Vec<_>, _>>()?;
    let refs = sigs.iter().collect::<Vec<_>>();
    let agg = min_pk::AggregateSignature::aggregate(&refs, true).map_err(Error::from)?;

    Ok(Signature(agg.to_signature().to_bytes()))
}

/// Verify an aggregate signature over per-signer messages. `pairs` must
/// be in the same order the signatures were aggregated in.
pub fn aggregate_verify(pairs: &[(PublicKey, Vec<u8>)], sig: &Signature) -> Result<(), Error> {
    if pairs.is_empty() {
        return Err(Error::Empty);
    }
    let pks = pairs
        .iter()
        .map(|(pk, _)| pk.to_blst())
        .collect::<Result<Vec<_>, _>>()?;
    let pk_refs = pks.iter().collect::<Vec<_>>();
    let msgs = pairs.iter().map(|(_, msg)| msg.as_slice()).collect::<Vec<_>>();
    let sig = sig.to_blst()?;

    match sig.aggregate_verify(true, &msgs, DST, &pk_refs, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        err => Err(err.into()),
    }
}
