//! Validated structured metadata map (spec §3, §9 design note).
//!
//! Replaces opaque JSON blobs with a map validated at ingress: at most 20
//! keys, each key at most 50 chars, each value at most 500 chars, and the
//! canonical serialized form at most 1024 bytes.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::sanitize::sanitize;

const MAX_KEYS: usize = 20;
const MAX_KEY_LEN: usize = 50;
const MAX_VALUE_LEN: usize = 500;
const MAX_SERIALIZED_BYTES: usize = 1024;

/// A metadata map that is always within the §3 caps and sanitized.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn empty() -> Self {
        Metadata(BTreeMap::new())
    }

    /// Validates and sanitizes a raw map from an untrusted caller.
    pub fn from_map(raw: BTreeMap<String, String>) -> Result<Self, GatewayError> {
        if raw.len() > MAX_KEYS {
            return Err(GatewayError::validation(format!("metadata has {} keys, max {MAX_KEYS}", raw.len())));
        }
        let mut cleaned = BTreeMap::new();
        for (key, value) in raw {
            if key.is_empty() || key.len() > MAX_KEY_LEN {
                return Err(GatewayError::validation(format!("metadata key `{key}` exceeds {MAX_KEY_LEN} chars")));
            }
            if value.len() > MAX_VALUE_LEN {
                return Err(GatewayError::validation(format!("metadata value for `{key}` exceeds {MAX_VALUE_LEN} chars")));
            }
            cleaned.insert(key, sanitize(&value));
        }
        let candidate = Metadata(cleaned);
        let serialized = serde_json::to_vec(&candidate).map_err(|e| GatewayError::internal(e.to_string()))?;
        if serialized.len() > MAX_SERIALIZED_BYTES {
            return Err(GatewayError::validation(format!(
                "metadata serializes to {} bytes, max {MAX_SERIALIZED_BYTES}",
                serialized.len()
            )));
        }
        Ok(candidate)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}
