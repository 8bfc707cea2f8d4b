use std::{convert::TryInto, fmt, str::FromStr};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Blake2b instantiated with a 32-byte output size.
pub type Blake2b256 = Blake2b<U32>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid digest length {0}")]
    InvalidLength(usize),
    #[error("invalid hexadecimal digit '{0}'")]
    InvalidHex(char),
}

/// A Blake2b-256 hash.
#[derive(Serialize, Deserialize, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(into = "String", try_from = "String")]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self::from(Blake2b256::digest(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8; 32]> for Digest {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Digest> for [u8; 32] {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidLength(bytes.len()))?;

        Ok(bytes.into())
    }
}

impl FromStr for Digest {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(DecodeError::InvalidLength(s.len()));
        }
        let mut bytes = [0; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| DecodeError::InvalidHex('?'))?;
            bytes[i] = u8::from_str_radix(hex, 16)
                .map_err(|_| DecodeError::InvalidHex(hex.chars().next().unwrap_or('?')))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Digest {
    type Error = DecodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<blake2::digest::Output<Blake2b256>> for Digest {
    fn from(array: blake2::digest::Output<Blake2b256>) -> Self {
        Self(array.into())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::Digest;

    #[test]
    fn test_display_parse() {
        let digest = Digest::new(b"starboard");
        let parsed = Digest::from_str(&digest.to_string()).unwrap();

        assert_eq!(digest, parsed);
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(Digest::new(b"keel"), Digest::new(b"keel"));
        assert_ne!(Digest::new(b"keel"), Digest::new(b"hull"));
    }
}
