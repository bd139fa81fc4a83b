use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

pub const SHA256_PREFIX: &str = "sha256:";

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("unsupported digest algorithm in {0}")]
    UnsupportedAlgorithm(String),
    #[error("malformed digest hex in {0}")]
    MalformedHex(String),
}

/// Algorithm-prefixed content hash. Only sha256 is supported; the string
/// form is canonical (`sha256:` + 64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn compute(bytes: &[u8]) -> Self {
        Digest(format!("{SHA256_PREFIX}{}", sha256_hex(bytes)))
    }

    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let hex = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| DigestError::UnsupportedAlgorithm(s.to_string()))?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::MalformedHex(s.to_string()));
        }
        if hex.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(DigestError::MalformedHex(s.to_string()));
        }
        Ok(Digest(s.to_string()))
    }

    pub fn verify(bytes: &[u8], expected: &Digest) -> bool {
        Digest::compute(bytes) == *expected
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(s: String) -> Result<Self, DigestError> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(output, "{:02x}", byte);
    }
    output
}
