use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::engine::EngineError;
use crate::icmp::IpVersion;

pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_PAYLOAD_SIZE: usize = 64;

fn default_payload_size() -> usize {
    DEFAULT_PAYLOAD_SIZE
}

/// Tunables of one engine as stored in a configuration document.
///
/// Keys this version does not know about are kept in `extra` and written
/// back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub ip_version: IpVersion,
    /// Milliseconds between transmission rounds.
    pub interval: u64,
    /// Milliseconds to wait for each reply.
    pub timeout: u64,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EngineConfig {
    pub fn new(ip_version: IpVersion) -> Self {
        Self {
            ip_version,
            interval: DEFAULT_INTERVAL_MS,
            timeout: DEFAULT_TIMEOUT_MS,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            extra: Map::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn to_document(&self) -> Value {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_document(document: &Value) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_value(document.clone())
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.interval == 0 {
            return Err(EngineError::InvalidConfig("interval must be greater than 0".into()));
        }
        if self.timeout == 0 {
            return Err(EngineError::InvalidConfig("timeout must be greater than 0".into()));
        }
        if self.payload_size > 65500 {
            return Err(EngineError::InvalidConfig("payload size exceeds 65500 bytes".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_keys() {
        let document = EngineConfig::new(IpVersion::V4).to_document();
        assert_eq!(document["ipVersion"], "v4");
        assert_eq!(document["interval"], 1000);
        assert_eq!(document["timeout"], 3000);
        assert_eq!(document["payloadSize"], 64);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let document = json!({
            "ipVersion": "v6",
            "interval": 2500,
            "timeout": 800,
            "engineTag": "lab-b",
            "vendor": { "burst": 3 }
        });

        let config = EngineConfig::from_document(&document).unwrap();
        assert_eq!(config.ip_version, IpVersion::V6);
        assert_eq!(config.payload_size, DEFAULT_PAYLOAD_SIZE);
        assert_eq!(config.extra["vendor"]["burst"], 3);

        let saved = config.to_document();
        assert_eq!(saved["engineTag"], "lab-b");
        assert_eq!(saved["vendor"], json!({ "burst": 3 }));
        assert_eq!(EngineConfig::from_document(&saved).unwrap(), config);
    }

    #[test]
    fn test_invalid_documents() {
        assert!(EngineConfig::from_document(&json!({ "interval": 5 })).is_err());
        assert!(matches!(
            EngineConfig::from_document(&json!({ "ipVersion": "v4", "interval": 0, "timeout": 10 })),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
