//! Session configuration

use crate::transport::ble::framer::DEFAULT_MAX_BODY_SIZE;
use crate::transport::ble::gatt::{
    WriteType, CREDENTIAL_SERVICE_UUID, DEFAULT_ATT_MTU, MAX_ATT_MTU, PASSWORD_CHARACTERISTIC_UUID,
    PAYLOAD_CHARACTERISTIC_UUID,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default transfer unit requested after discovery
pub const DEFAULT_REQUESTED_MTU: u16 = 512;

/// Default depth of the write worker queue
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid max body size: must be > 0")]
    InvalidMaxBodySize,

    #[error("Invalid requested MTU: must be {min}-{max}, got {got}")]
    InvalidMtu { min: u16, max: u16, got: u16 },

    #[error("Invalid write queue depth: must be > 0")]
    InvalidQueueDepth,

    #[error("Read and write characteristics must differ")]
    SharedCharacteristic,
}

/// Settings for one transfer session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frame body size in characters
    pub max_body_size: usize,
    /// Transfer unit requested once services are discovered
    pub requested_mtu: u16,
    pub write_type: WriteType,
    pub service_uuid: Uuid,
    pub read_characteristic_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    pub write_queue_depth: usize,
    /// Issue the password read as soon as the link is ready
    pub read_on_ready: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            requested_mtu: DEFAULT_REQUESTED_MTU,
            write_type: WriteType::WithoutResponse,
            service_uuid: CREDENTIAL_SERVICE_UUID,
            read_characteristic_uuid: PASSWORD_CHARACTERISTIC_UUID,
            write_characteristic_uuid: PAYLOAD_CHARACTERISTIC_UUID,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            read_on_ready: true,
        }
    }
}

impl SessionConfig {
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_requested_mtu(mut self, mtu: u16) -> Self {
        self.requested_mtu = mtu;
        self
    }

    pub fn with_write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    pub fn with_read_on_ready(mut self, enabled: bool) -> Self {
        self.read_on_ready = enabled;
        self
    }

    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_size == 0 {
            return Err(ConfigError::InvalidMaxBodySize);
        }
        if !(DEFAULT_ATT_MTU..=MAX_ATT_MTU).contains(&self.requested_mtu) {
            return Err(ConfigError::InvalidMtu {
                min: DEFAULT_ATT_MTU,
                max: MAX_ATT_MTU,
                got: self.requested_mtu,
            });
        }
        if self.write_queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }
        if self.read_characteristic_uuid == self.write_characteristic_uuid {
            return Err(ConfigError::SharedCharacteristic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert_eq!(config.max_body_size, 256);
        assert_eq!(config.requested_mtu, 512);
        assert_eq!(config.write_type, WriteType::WithoutResponse);
        assert!(config.read_on_ready);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(
            SessionConfig::default().with_max_body_size(0).validate(),
            Err(ConfigError::InvalidMaxBodySize)
        );
        assert_eq!(
            SessionConfig::default().with_requested_mtu(600).validate(),
            Err(ConfigError::InvalidMtu { min: 23, max: 517, got: 600 })
        );
        assert_eq!(
            SessionConfig::default().with_write_queue_depth(0).validate(),
            Err(ConfigError::InvalidQueueDepth)
        );

        let mut shared = SessionConfig::default();
        shared.read_characteristic_uuid = shared.write_characteristic_uuid;
        assert_eq!(shared.validate(), Err(ConfigError::SharedCharacteristic));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"max_body_size": 128, "write_type": "with_response"}"#)
                .expect("deserialize");

        assert_eq!(config.max_body_size, 128);
        assert_eq!(config.write_type, WriteType::WithResponse);
        assert_eq!(config.service_uuid, CREDENTIAL_SERVICE_UUID);
        assert_eq!(config.requested_mtu, DEFAULT_REQUESTED_MTU);
    }
}
