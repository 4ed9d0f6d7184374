//! Content hashing for change detection.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::FieldValue;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest of a row's canonical content.
///
/// The digest covers the untagged JSON form of every non-empty field,
/// encoded with sorted keys. Row ids and timestamps are not part of it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hashes a set of fields.
    pub fn of_fields(fields: &BTreeMap<String, FieldValue>) -> Self {
        let canonical: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .filter_map(|(name, value)| {
                value
                    .normalized()
                    .map(|v| (name.clone(), v.canonical_json()))
            })
            .collect();
        // serde_json maps are ordered by key, so the encoding is stable.
        let encoded = serde_json::Value::Object(canonical).to_string();
        let digest = Sha256::digest(encoded.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl FromStr for ContentHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(ProtocolError::InvalidHash(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ProtocolError::InvalidHash(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
