//! PII masking for transaction events and dashboard logs.
//!
//! Patron and item identifiers are replaced by a deterministic one-way
//! mapping so correlated events stay correlatable without carrying the
//! original value. Credentials are never mapped, only blanked: a
//! deterministic mask of a short PIN would invite offline guessing.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{Result, Sip2Error};

type HmacSha256 = Hmac<Sha256>;

/// Replacement for credential-class values.
const BLANKED: &str = "********";

/// Maximum payload nesting the recursive masker will follow.
const MAX_DEPTH: usize = 64;

/// Deterministic masker keyed by the process-wide master key.
#[derive(Clone)]
pub struct Masker {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Masker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Masker").field("key_configured", &self.key.is_some()).finish()
    }
}

impl Masker {
    pub fn new(master_key: &[u8]) -> Self {
        Self { key: Some(master_key.to_vec()) }
    }

    /// A masker with no key: `mask` fails and payload masking falls back
    /// to asterisk redaction.
    pub fn unkeyed() -> Self {
        Self { key: None }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// One-way deterministic mapping of an identifier.
    ///
    /// Empty input passes through unchanged. The result is `MASKED_`
    /// followed by the first 16 hex characters of
    /// HMAC-SHA-256(master key, input).
    pub fn mask(&self, value: &str) -> Result<String> {
        if value.is_empty() {
            return Ok(String::new());
        }
        let key = self.key.as_deref().ok_or(Sip2Error::MasterKeyMissing)?;
        // HMAC accepts keys of any length; new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Sip2Error::MasterKeyMissing)?;
        mac.update(value.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(format!("MASKED_{}", &digest[..16]))
    }

    /// Mask an identifier, falling back to asterisks without a key.
    fn mask_or_blank(&self, value: &str) -> String {
        self.mask(value).unwrap_or_else(|_| BLANKED.to_string())
    }

    /// Recursively mask every sensitive field in a structured payload.
    ///
    /// Total over any `serde_json::Value`; primitives and arrays pass
    /// through with their elements masked in place.
    pub fn mask_payload(&self, value: &Value) -> Value {
        self.mask_value(value, 0)
    }

    fn mask_value(&self, value: &Value, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            return value.clone();
        }
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, entry) in map {
                    out.insert(key.clone(), self.mask_entry(key, entry, depth + 1));
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.mask_value(v, depth + 1)).collect())
            }
            other => other.clone(),
        }
    }

    fn mask_entry(&self, key: &str, value: &Value, depth: usize) -> Value {
        let lower = key.to_lowercase();
        if is_credential_key(&lower) {
            match value {
                Value::String(_) => Value::String(BLANKED.to_string()),
                other => other.clone(),
            }
        } else if is_identifier_key(&lower) {
            match value {
                Value::String(s) => Value::String(self.mask_or_blank(s)),
                other => other.clone(),
            }
        } else {
            self.mask_value(value, depth)
        }
    }
}

/// Credential-class keys are blanked outright.
fn is_credential_key(lower: &str) -> bool {
    lower.contains("password") || lower.contains("pin") || lower == "cq" || lower == "co"
}

/// Identifier-class keys get the deterministic mask.
fn is_identifier_key(lower: &str) -> bool {
    lower.contains("patronidentifier")
        || lower.contains("patronbarcode")
        || lower.contains("patronname")
        || lower.contains("itemidentifier")
        || lower.contains("itembarcode")
        || lower.contains("personalname")
        || lower == "aa"
        || lower == "ab"
        || lower == "ae"
}
