//! Product fingerprint parsing and validation
//!
//! A fingerprint is the stable key (job id, ASIN, SKU, ...) identifying one unit
//! of work. It is the idempotency key of the processing store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum fingerprint length in characters
pub const MAX_FINGERPRINT_LEN: usize = 256;

/// Length of the sanitised prefix kept in storage keys
const STORAGE_PREFIX_LEN: usize = 48;

/// Stable identifier for one product
///
/// Surrounding whitespace is trimmed; the remaining value is kept verbatim
/// (fingerprints are case sensitive).
///
/// # Examples
///
/// ```
/// use product_video_publisher::fingerprint::ProductFingerprint;
///
/// let fp = ProductFingerprint::parse("  B07XJ8C8F5 ").unwrap();
/// assert_eq!(fp.as_str(), "B07XJ8C8F5");
/// assert!(ProductFingerprint::parse("   ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductFingerprint(String);

impl ProductFingerprint {
    /// Parse and validate a fingerprint
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty after trimming, too long, or
    /// contains control characters.
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let value = s.trim();
        if value.is_empty() {
            return Err(FingerprintError::Empty);
        }

        let len = value.chars().count();
        if len > MAX_FINGERPRINT_LEN {
            return Err(FingerprintError::TooLong {
                len,
                max: MAX_FINGERPRINT_LEN,
            });
        }

        if let Some(c) = value.chars().find(|c| c.is_control()) {
            return Err(FingerprintError::InvalidCharacter(c.escape_default().to_string()));
        }

        Ok(Self(value.to_string()))
    }

    /// The fingerprint value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe key unique to this fingerprint
    ///
    /// A readable sanitised prefix followed by the first 16 hex digits of the
    /// SHA-256 of the full value, so fingerprints that sanitise to the same
    /// prefix still map to distinct keys.
    pub fn storage_key(&self) -> String {
        let prefix: String = self
            .0
            .chars()
            .take(STORAGE_PREFIX_LEN)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let digest = Sha256::digest(self.0.as_bytes());
        let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();

        format!("{prefix}-{hash}")
    }
}

impl fmt::Display for ProductFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProductFingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProductFingerprint> for String {
    fn from(fp: ProductFingerprint) -> Self {
        fp.0
    }
}

impl std::str::FromStr for ProductFingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Fingerprint validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// Empty or whitespace-only value
    #[error("fingerprint cannot be empty")]
    Empty,

    /// Value longer than the allowed maximum
    #[error("fingerprint is {len} characters long (max: {max})")]
    TooLong {
        /// Actual length in characters
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Control character in value
    #[error("fingerprint contains invalid character '{0}'")]
    InvalidCharacter(String),
}
