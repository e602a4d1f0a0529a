//! Strong type definitions for the CRR client.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// A 16-byte replica identifier.
///
/// Generated once when a replica is installed and never reassigned. Travels
/// as standard base64 on the wire and is compared bytewise when breaking
/// last-writer-wins ties.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteId(pub [u8; 16]);

impl SiteId {
    /// Length of a site id in bytes.
    pub const LEN: usize = 16;

    /// Generate a random site id.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Encode as standard base64, the form used in stream URLs and JSON.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Decode from standard base64.
    pub fn from_base64(s: &str) -> Result<Self, CoreError> {
        let bytes = BASE64
            .decode(s.as_bytes())
            .map_err(|e| CoreError::InvalidSiteId(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }

    /// The all-zero site id.
    pub const ZERO: Self = Self([0u8; 16]);
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for SiteId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 16]> for SiteId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for SiteId {
    type Error = CoreError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 16] = slice.try_into().map_err(|_| {
            CoreError::InvalidSiteId(format!(
                "expected {} bytes, got {}",
                Self::LEN,
                slice.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

impl Serialize for SiteId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for SiteId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(d)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
