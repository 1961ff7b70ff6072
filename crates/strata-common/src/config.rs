//! Configuration types for strata
//!
//! Each binary loads a JSON config file; a missing file falls back to the
//! defaults so single-node setups run with flags alone.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

/// Storage server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Replication group this server belongs to
    pub group_id: String,
    /// Address advertised to the metadata service (defaults to the listen
    /// address when empty)
    pub advertise_address: String,
    /// Volume rollover threshold
    pub max_volume_bytes: u64,
    /// Age after which a pending upload is reported and aborted
    pub expiration_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            group_id: "group-0".to_string(),
            advertise_address: String::new(),
            max_volume_bytes: 4 * 1024 * 1024 * 1024, // 4 GB
            expiration_secs: 60,
        }
    }
}

/// Proxy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Maximum number of groups with open channel sets
    pub max_groups: usize,
    /// Wall-clock deadline for one storage call including replica rotation
    pub execute_timeout_ms: u64,
    /// Period of the expired-blob sweep
    pub sweep_interval_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_groups: 10,
            execute_timeout_ms: 2_000,
            sweep_interval_secs: 30,
        }
    }
}

/// Auth server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Superuser created at startup
    pub root_user: String,
    pub root_pass: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            root_user: "root".to_string(),
            root_pass: "root".to_string(),
        }
    }
}

/// Load a JSON config file, falling back to defaults when the file does
/// not exist. A file that exists but fails to parse is an error.
pub fn load_config<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| {
        Error::Configuration(format!("failed to parse {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config: ProxyConfig = load_config("/nonexistent/proxy.json").unwrap();
        assert_eq!(config.max_groups, 10);
        assert_eq!(config.execute_timeout_ms, 2_000);
        assert_eq!(config.sweep_interval_secs, 30);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, r#"{"group_id":"g7","max_volume_bytes":1024}"#).unwrap();

        let config: StorageConfig = load_config(&path).unwrap();
        assert_eq!(config.group_id, "g7");
        assert_eq!(config.max_volume_bytes, 1024);
        assert_eq!(config.expiration_secs, 60);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();

        let result: Result<AuthConfig> = load_config(&path);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
