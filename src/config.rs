use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

use crate::registry::DuplicatePolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Upper bound for a timeout requested through the payload.
    #[serde(default = "default_max_request_timeout", with = "duration_ms")]
    pub max_request_timeout: Duration,

    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            request_timeout: default_request_timeout(),
            max_request_timeout: default_max_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl BrokerConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(s: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.event_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_request_timeout < self.request_timeout {
            return Err(ConfigError::Invalid(
                "max_request_timeout must not be less than request_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// デフォルト値の定義
fn default_event_buffer_size() -> usize {
    1000
}
fn default_request_timeout() -> Duration {
    crate::coordinator::REQUEST_TIMEOUT
}
fn default_max_request_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = BrokerConfig::from_str("{}").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
    }

    #[test]
    fn test_parse_overrides() {
        let config = BrokerConfig::from_str(
            r#"{"event_buffer_size": 64, "request_timeout": 250, "duplicate_policy": "supersede"}"#,
        )
        .unwrap();
        assert_eq!(config.event_buffer_size, 64);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Supersede);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            BrokerConfig::from_str(r#"{"event_buffer_size": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BrokerConfig::from_str(r#"{"request_timeout": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BrokerConfig::from_str(r#"{"duplicate_policy": "queue"}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"shutdown_timeout": 100}}"#).unwrap();

        let config = BrokerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_millis(100));

        assert!(matches!(
            BrokerConfig::from_file("/nonexistent/broker.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
