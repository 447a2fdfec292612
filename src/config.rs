use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub network: NetworkConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the REST/object-store backend, e.g. http://host:54321
    pub base_url: String,
    pub api_key: Option<String>,
    pub auth_token: Option<String>,
    pub raw_bucket: String,
    pub processed_bucket: String,
    /// Path probed by the network monitor.
    pub health_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub max_consecutive_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub probe_interval_secs: u64,
    /// Probes slower than this report a weak connection.
    pub weak_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_concurrent_uploads: usize,
    pub max_retries: u32,
    /// Start an upload pass whenever connectivity comes back.
    pub upload_on_reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            remote: RemoteConfig::default(),
            sync: SyncConfig::default(),
            network: NetworkConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:54321".to_string(),
            api_key: None,
            auth_token: None,
            raw_bucket: "raw-data".to_string(),
            processed_bucket: "processed-data".to_string(),
            health_path: "/rest/v1/".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_retries: 3,
            max_consecutive_failures: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            request_timeout_secs: 30,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 10,
            weak_latency_ms: 1_500,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            max_retries: 3,
            upload_on_reconnect: true,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn weak_latency(&self) -> Duration {
        Duration::from_millis(self.weak_latency_ms)
    }
}

impl Config {
    /// Load a JSON config file (or the defaults when `path` is `None`) and
    /// apply `FIELDSYNC_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Config::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("FIELDSYNC_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(url) = lookup("FIELDSYNC_REMOTE_URL") {
            self.remote.base_url = url;
        }
        if let Some(key) = lookup("FIELDSYNC_API_KEY") {
            self.remote.api_key = Some(key);
        }
        if let Some(token) = lookup("FIELDSYNC_AUTH_TOKEN") {
            self.remote.auth_token = Some(token);
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "FIELDSYNC_SYNC_INTERVAL_SECS".to_string(),
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("sync.interval_secs", self.sync.interval_secs == 0),
            ("sync.max_retries", self.sync.max_retries == 0),
            (
                "sync.max_consecutive_failures",
                self.sync.max_consecutive_failures == 0,
            ),
            ("upload.max_concurrent_uploads", self.upload.max_concurrent_uploads == 0),
            ("upload.max_retries", self.upload.max_retries == 0),
            ("network.probe_interval_secs", self.network.probe_interval_secs == 0),
        ];

        for (key, invalid) in checks {
            if invalid {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_default_values_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.interval(), Duration::from_secs(30));
        assert_eq!(cfg.sync.max_retries, 3);
        assert_eq!(cfg.sync.max_consecutive_failures, 3);
        assert_eq!(cfg.sync.backoff_max_ms, 300_000);
        assert_eq!(cfg.network.probe_interval(), Duration::from_secs(10));
        assert_eq!(cfg.upload.max_concurrent_uploads, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let cfg: Config =
            serde_json::from_str(r#"{"data_dir": "/tmp/fs", "sync": {"max_retries": 5}}"#).unwrap();
        assert_eq!(cfg.data_dir, "/tmp/fs");
        assert_eq!(cfg.sync.max_retries, 5);
        assert_eq!(cfg.sync.max_consecutive_failures, 3);
        assert_eq!(cfg.remote.raw_bucket, "raw-data");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FIELDSYNC_REMOTE_URL", "http://backend:8000"),
            ("FIELDSYNC_API_KEY", "anon"),
            ("FIELDSYNC_SYNC_INTERVAL_SECS", "12"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.remote.base_url, "http://backend:8000");
        assert_eq!(cfg.remote.api_key.as_deref(), Some("anon"));
        assert_eq!(cfg.sync.interval_secs, 12);
    }

    #[test]
    fn invalid_override_is_reported() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides(|k| {
                (k == "FIELDSYNC_SYNC_INTERVAL_SECS").then(|| "soon".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = Config::default();
        cfg.upload.max_concurrent_uploads = 0;
        assert!(cfg.validate().is_err());
    }
}
