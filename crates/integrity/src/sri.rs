use crate::error::{Error, ErrorKind, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Supported digest algorithms, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}
impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn output_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

/// A single Subresource Integrity digest, e.g. `sha512-<base64>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Integrity {
    algorithm: Algorithm,
    digest: Vec<u8>,
}
impl Integrity {
    /// Digest `data` with `algorithm`.
    pub fn compute(algorithm: Algorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(data),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether `data` hashes to this digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == self.digest
    }
}
impl Display for Integrity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}-{}", self.algorithm.as_str(), STANDARD.encode(&self.digest))
    }
}
impl FromStr for Integrity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || ErrorKind::Malformed(s.to_string());
        // Options (`sha512-abc?ct=application/gzip`) are allowed but ignored.
        let token = s.trim().split('?').next().unwrap_or_default();
        let Some((name, encoded)) = token.split_once('-') else {
            exn::bail!(malformed());
        };
        let Some(algorithm) = Algorithm::from_name(&name.to_ascii_lowercase()) else {
            exn::bail!(malformed());
        };
        let Ok(digest) = STANDARD.decode(encoded) else {
            exn::bail!(malformed());
        };
        if digest.len() != algorithm.output_len() {
            exn::bail!(malformed());
        }
        Ok(Self { algorithm, digest })
    }
}

/// Result of checking content against an integrity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The content matched using the given (strongest available) algorithm.
    Verified(Algorithm),
    /// The integrity string only names algorithms we do not implement (such
    /// as `sha1`), so nothing was checked.
    Unsupported,
}

/// Check `data` against an integrity string, which may contain several
/// space-separated digests.
///
/// Only digests using the strongest supported algorithm present are
/// considered, and any one of them matching is enough.
///
/// ```
/// use regmirror_integrity::{Algorithm, Integrity, Verification, verify};
///
/// let sri = Integrity::compute(Algorithm::Sha512, b"tarball").to_string();
/// assert_eq!(verify(&sri, b"tarball").unwrap(), Verification::Verified(Algorithm::Sha512));
/// assert!(verify(&sri, b"tarbal").is_err());
/// ```
pub fn verify(integrity: &str, data: &[u8]) -> Result<Verification> {
    let mut candidates = Vec::new();
    for token in integrity.split_whitespace() {
        let name = token.split_once('-').map(|(name, _)| name.to_ascii_lowercase()).unwrap_or_default();
        if Algorithm::from_name(&name).is_none() {
            continue;
        }
        candidates.push(token.parse::<Integrity>()?);
    }
    let Some(strongest) = candidates.iter().map(Integrity::algorithm).max() else {
        return Ok(Verification::Unsupported);
    };
    let actual = Integrity::compute(strongest, data);
    let mut expected = candidates.iter().filter(|c| c.algorithm == strongest);
    if expected.clone().any(|c| c.digest == actual.digest) {
        return Ok(Verification::Verified(strongest));
    }
    exn::bail!(ErrorKind::Mismatch {
        expected: expected.next().map(ToString::to_string).unwrap_or_default(),
        actual: actual.to_string(),
    })
}
