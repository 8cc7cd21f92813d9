//! Configuration module
//!
//! Typed access to environment variables plus the branch list the
//! connection manager is built from. Branches are described as JSON,
//! either inline in `SIP2_BRANCHES` or in a file named by
//! `SIP2_BRANCHES_FILE`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
#[cfg(test)]
use std::collections::HashMap;
use std::env;
use std::fs;

/// Typed configuration keys
///
/// Using an enum for config keys provides compile-time safety
/// and prevents typos compared to string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Master key for the masking service (32+ hex characters)
    MasterKey,

    /// Default SC location code sent in Login requests
    LocationCode,

    /// Inline JSON array of branch definitions
    Branches,

    /// Path to a JSON file with branch definitions
    BranchesFile,
}

impl ConfigKey {
    /// Get the environment variable name for this key
    pub fn env_var(&self) -> &'static str {
        match self {
            ConfigKey::MasterKey => "SIP2_MASTER_KEY",
            ConfigKey::LocationCode => "SIP2_LOCATION_CODE",
            ConfigKey::Branches => "SIP2_BRANCHES",
            ConfigKey::BranchesFile => "SIP2_BRANCHES_FILE",
        }
    }

    /// Get default value for this key (if any)
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            ConfigKey::LocationCode => Some("GATEWAY"),
            _ => None,
        }
    }
}

/// Service credentials for the per-branch Login handshake.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("user", &self.user)
            .field("password", &"********")
            .finish()
    }
}

/// Vendor-specific protocol behavior.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorProfile {
    /// Reject inbound frames whose checksum does not verify.
    #[serde(default)]
    pub checksum_required: bool,
    /// Perform an SC Status round-trip right after Login.
    #[serde(default)]
    pub post_login_sc_status: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// One LMS endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchConfig {
    /// Stable branch identifier external callers address.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Connect and per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// The `AO` institution id presented to the LMS.
    pub institution_id: String,
    #[serde(default)]
    pub tls: bool,
    /// Strict certificate validation. Only disable for self-signed LMS
    /// endpoints.
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    #[serde(default)]
    pub credentials: Option<ServiceCredentials>,
    #[serde(default)]
    pub profile: Option<VendorProfile>,
}

impl BranchConfig {
    pub fn checksum_required(&self) -> bool {
        self.profile.as_ref().map(|p| p.checksum_required).unwrap_or(false)
    }

    pub fn post_login_sc_status(&self) -> bool {
        self.profile.as_ref().map(|p| p.post_login_sc_status).unwrap_or(false)
    }
}

/// Everything the gateway core needs at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub branches: Vec<BranchConfig>,
    pub location_code: String,
    /// Decoded master key bytes, absent when `SIP2_MASTER_KEY` is unset.
    pub master_key: Option<Vec<u8>>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key.env_var()).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(ConfigKey) -> Option<String>,
    {
        let branches_json = match get(ConfigKey::Branches) {
            Some(inline) => Some(inline),
            None => match get(ConfigKey::BranchesFile) {
                Some(path) => {
                    Some(fs::read_to_string(&path).with_context(|| format!("reading {}", path))?)
                }
                None => None,
            },
        };

        let branches = match branches_json {
            Some(json) => {
                serde_json::from_str(&json).context(ConfigKey::Branches.env_var())?
            }
            None => Vec::new(),
        };

        let master_key = match get(ConfigKey::MasterKey) {
            Some(hex_key) if !hex_key.is_empty() => Some(decode_master_key(&hex_key)?),
            _ => None,
        };

        Ok(GatewayConfig {
            branches,
            location_code: get(ConfigKey::LocationCode).unwrap_or_else(|| {
                ConfigKey::LocationCode.default_value().unwrap_or_default().to_string()
            }),
            master_key,
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key.env_var()).map(|v| v.to_string()))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.branches.is_empty() {
            errors.push("No branches configured.".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for branch in &self.branches {
            if branch.id.trim().is_empty() {
                errors.push("Branch with empty id.".to_string());
            }
            if !seen.insert(branch.id.as_str()) {
                errors.push(format!("Duplicate branch id '{}'.", branch.id));
            }
            if branch.host.trim().is_empty() {
                errors.push(format!("Branch '{}' has an empty host.", branch.id));
            }
            if branch.port == 0 {
                errors.push(format!("Branch '{}' has port 0.", branch.id));
            }
            if branch.timeout_ms == 0 {
                errors.push(format!("Branch '{}' has a zero timeout.", branch.id));
            }
            if branch.institution_id.trim().is_empty() {
                errors.push(format!("Branch '{}' has an empty institution id.", branch.id));
            }
            if let Some(creds) = &branch.credentials {
                if creds.user.trim().is_empty() {
                    errors.push(format!("Branch '{}' credentials have an empty user.", branch.id));
                }
            }
        }

        if self.master_key.is_none() {
            errors.push(format!(
                "{} is not set; transaction events will fall back to asterisk redaction.",
                ConfigKey::MasterKey.env_var()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("Configuration validation failed:\n  - {}", errors.join("\n  - "))
        }
    }
}

/// Decode and length-check the masking master key.
fn decode_master_key(hex_key: &str) -> Result<Vec<u8>> {
    if hex_key.len() < 32 {
        bail!(
            "{} must be at least 32 hex characters, got {}",
            ConfigKey::MasterKey.env_var(),
            hex_key.len()
        );
    }
    hex::decode(hex_key).context(ConfigKey::MasterKey.env_var())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRANCHES: &str = r#"[
        {"id": "main", "host": "lms.example.org", "port": 6001,
         "institutionId": "MAIN",
         "credentials": {"user": "sc", "password": "secret"},
         "profile": {"checksumRequired": true, "postLoginScStatus": true}},
        {"id": "east", "host": "east.example.org", "port": 6002,
         "institutionId": "EAST", "tls": true, "tlsVerify": false}
    ]"#;

    fn minimal_valid_env() -> HashMap<&'static str, &'static str> {
        let mut m = HashMap::new();
        m.insert("SIP2_BRANCHES", BRANCHES);
        m.insert("SIP2_MASTER_KEY", "0123456789abcdef0123456789abcdef");
        m
    }

    #[test]
    fn test_valid_minimal_config() {
        let config = GatewayConfig::from_map(&minimal_valid_env()).expect("should parse");
        assert_eq!(config.branches.len(), 2);
        assert_eq!(config.location_code, "GATEWAY"); // default
        assert_eq!(config.master_key.as_ref().unwrap().len(), 16);
        config.validate().expect("should validate");
    }

    #[test]
    fn test_branch_fields() {
        let config = GatewayConfig::from_map(&minimal_valid_env()).unwrap();
        let main = &config.branches[0];
        assert_eq!(main.id, "main");
        assert_eq!(main.port, 6001);
        assert_eq!(main.timeout_ms, 10_000); // default
        assert!(main.checksum_required());
        assert!(main.post_login_sc_status());
        assert!(main.tls_verify); // default strict

        let east = &config.branches[1];
        assert!(east.tls);
        assert!(!east.tls_verify);
        assert!(!east.checksum_required()); // no profile
        assert!(east.credentials.is_none());
    }

    #[test]
    fn test_custom_location_code() {
        let mut env = minimal_valid_env();
        env.insert("SIP2_LOCATION_CODE", "BRANCH-GW-01");
        let config = GatewayConfig::from_map(&env).unwrap();
        assert_eq!(config.location_code, "BRANCH-GW-01");
    }

    #[test]
    fn test_invalid_branches_json() {
        let mut env = minimal_valid_env();
        env.insert("SIP2_BRANCHES", "not json");
        let result = GatewayConfig::from_map(&env);
        assert!(result.is_err());
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("SIP2_BRANCHES"), "error should mention SIP2_BRANCHES: {}", err);
    }

    #[test]
    fn test_missing_master_key_is_tolerated_at_parse() {
        let mut env = minimal_valid_env();
        env.remove("SIP2_MASTER_KEY");
        let config = GatewayConfig::from_map(&env).expect("should parse");
        assert!(config.master_key.is_none());
        // but validation flags it
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("SIP2_MASTER_KEY"));
    }

    #[test]
    fn test_short_master_key_rejected() {
        let mut env = minimal_valid_env();
        env.insert("SIP2_MASTER_KEY", "abcd");
        assert!(GatewayConfig::from_map(&env).is_err());
    }

    #[test]
    fn test_non_hex_master_key_rejected() {
        let mut env = minimal_valid_env();
        env.insert("SIP2_MASTER_KEY", "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz");
        assert!(GatewayConfig::from_map(&env).is_err());
    }

    #[test]
    fn test_validation_duplicate_branch_ids() {
        let mut env = minimal_valid_env();
        env.insert(
            "SIP2_BRANCHES",
            r#"[{"id": "main", "host": "a", "port": 1, "institutionId": "A"},
                {"id": "main", "host": "b", "port": 2, "institutionId": "B"}]"#,
        );
        let config = GatewayConfig::from_map(&env).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Duplicate branch id"), "{}", err);
    }

    #[test]
    fn test_validation_no_branches() {
        let mut env = minimal_valid_env();
        env.insert("SIP2_BRANCHES", "[]");
        let config = GatewayConfig::from_map(&env).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("No branches"), "{}", err);
    }

    #[test]
    fn test_validation_port_zero() {
        let mut env = minimal_valid_env();
        env.insert(
            "SIP2_BRANCHES",
            r#"[{"id": "main", "host": "a", "port": 0, "institutionId": "A"}]"#,
        );
        let config = GatewayConfig::from_map(&env).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port 0"), "{}", err);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = ServiceCredentials { user: "sc".into(), password: "secret".into() };
        let out = format!("{:?}", creds);
        assert!(!out.contains("secret"));
        assert!(out.contains("********"));
    }
}
