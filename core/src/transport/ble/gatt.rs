/// GATT service definition for credential transfer
///
/// This module provides the fixed service/characteristic identifiers, the
/// capability descriptors a link reports, and the platform traits a session
/// drives (connect, discover, negotiate, read, write, disconnect).

use crate::transport::abstraction::LinkEventSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Credential transfer service UUID
pub const CREDENTIAL_SERVICE_UUID: Uuid = Uuid::from_u128(0xE20A39F4_73F5_4BC4_A12F_17D1AD07A961);

/// Characteristic the peer exposes its password on
pub const PASSWORD_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8C380001_10BD_4FDB_BA21_1922D6CF860D);

/// Characteristic the credential frames are written to
pub const PAYLOAD_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x08590F7E_DB05_467E_8757_72F6FAEB13D4);

/// Maximum GATT characteristic value size (ATT protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// ATT transfer unit every link starts with before negotiation
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest ATT transfer unit a client may request
pub const MAX_ATT_MTU: u16 = 517;

/// Bytes of every ATT write PDU taken by opcode and handle
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl GattError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, GattError::PermissionDenied(_))
    }
}

/// How a characteristic write is issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    /// Write request; the peer answers with a write response
    WithResponse,
    /// Write command; the stack confirms once the packet left the controller
    WithoutResponse,
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteType::WithResponse => write!(f, "with_response"),
            WriteType::WithoutResponse => write!(f, "without_response"),
        }
    }
}

/// Characteristic properties relevant to the transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// Descriptor of one characteristic reported by the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Descriptor of one service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristicInfo>,
}

impl GattService {
    /// The credential service as a peripheral exposes it
    pub fn credential_service(service: Uuid, read: Uuid, write: Uuid) -> Self {
        Self {
            uuid: service,
            characteristics: vec![
                GattCharacteristicInfo {
                    uuid: read,
                    properties: CharacteristicProperties {
                        read: true,
                        ..Default::default()
                    },
                },
                GattCharacteristicInfo {
                    uuid: write,
                    properties: CharacteristicProperties {
                        write: true,
                        write_without_response: true,
                        ..Default::default()
                    },
                },
            ],
        }
    }

    /// Look up a characteristic of this service
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Find `characteristic` on `service` within a capability list
pub fn find_characteristic(
    services: &[GattService],
    service: Uuid,
    characteristic: Uuid,
) -> Option<&GattCharacteristicInfo> {
    services
        .iter()
        .find(|s| s.uuid == service)
        .and_then(|s| s.characteristic(characteristic))
}

/// One characteristic write handed to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWriteRequest {
    pub service: Uuid,
    pub characteristic: Uuid,
    /// Frame index; the platform echoes it in the acknowledgement
    pub frame: usize,
    pub value: Vec<u8>,
    pub write_type: WriteType,
}

impl GattWriteRequest {
    /// Create a new write request
    pub fn new(
        service: Uuid,
        characteristic: Uuid,
        frame: usize,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<Self, GattError> {
        if value.len() > MAX_CHARACTERISTIC_SIZE {
            return Err(GattError::WriteFailed(format!(
                "value of {} bytes exceeds characteristic size",
                value.len()
            )));
        }
        Ok(Self {
            service,
            characteristic,
            frame,
            value,
            write_type,
        })
    }
}

/// A device that can be connected to. Connecting creates the connection handle.
#[cfg_attr(test, mockall::automock)]
pub trait GattDevice: Send + Sync {
    /// Open a link. Completion is delivered through `events` as
    /// [`LinkEvent::ConnectionStateChanged`](crate::transport::LinkEvent).
    fn connect(&self, events: LinkEventSink) -> Result<Arc<dyn GattConnection>, GattError>;
}

/// A live link to a peer.
///
/// Every operation only issues the request; completion arrives later as a
/// link event on the sink the connection was opened with.
#[cfg_attr(test, mockall::automock)]
pub trait GattConnection: Send + Sync {
    /// Request service discovery
    fn discover_services(&self) -> Result<(), GattError>;

    /// Current capability list (may be empty before discovery completes)
    fn services(&self) -> Vec<GattService>;

    /// Request a larger transfer unit
    fn request_mtu(&self, mtu: u16) -> Result<(), GattError>;

    /// Read a characteristic value
    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), GattError>;

    /// Write a characteristic value
    fn write_characteristic(&self, request: GattWriteRequest) -> Result<(), GattError>;

    /// Tear the link down and release platform resources
    fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_identifiers() {
        assert_eq!(
            CREDENTIAL_SERVICE_UUID.to_string(),
            "e20a39f4-73f5-4bc4-a12f-17d1ad07a961"
        );
        assert_eq!(
            PASSWORD_CHARACTERISTIC_UUID.to_string(),
            "8c380001-10bd-4fdb-ba21-1922d6cf860d"
        );
        assert_eq!(
            PAYLOAD_CHARACTERISTIC_UUID.to_string(),
            "08590f7e-db05-467e-8757-72f6faeb13d4"
        );
    }

    #[test]
    fn test_find_characteristic() {
        let services = vec![GattService::credential_service(
            CREDENTIAL_SERVICE_UUID,
            PASSWORD_CHARACTERISTIC_UUID,
            PAYLOAD_CHARACTERISTIC_UUID,
        )];

        let read = find_characteristic(
            &services,
            CREDENTIAL_SERVICE_UUID,
            PASSWORD_CHARACTERISTIC_UUID,
        )
        .expect("read characteristic");
        assert!(read.properties.read);
        assert!(!read.properties.write);

        let write = find_characteristic(
            &services,
            CREDENTIAL_SERVICE_UUID,
            PAYLOAD_CHARACTERISTIC_UUID,
        )
        .expect("write characteristic");
        assert!(write.properties.write_without_response);

        assert!(find_characteristic(&services, Uuid::nil(), PAYLOAD_CHARACTERISTIC_UUID).is_none());
        assert!(find_characteristic(&[], CREDENTIAL_SERVICE_UUID, PAYLOAD_CHARACTERISTIC_UUID).is_none());
    }

    #[test]
    fn test_gatt_write_request_creation() {
        let request = GattWriteRequest::new(
            CREDENTIAL_SERVICE_UUID,
            PAYLOAD_CHARACTERISTIC_UUID,
            0,
            b"0/abc/EOM".to_vec(),
            WriteType::WithoutResponse,
        )
        .expect("Valid request");

        assert_eq!(request.frame, 0);
        assert_eq!(request.value.len(), 9);
    }

    #[test]
    fn test_gatt_write_request_max_size() {
        let result = GattWriteRequest::new(
            CREDENTIAL_SERVICE_UUID,
            PAYLOAD_CHARACTERISTIC_UUID,
            0,
            vec![0u8; MAX_CHARACTERISTIC_SIZE + 1],
            WriteType::WithResponse,
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_write_type_serde_names() {
        let json = serde_json::to_string(&WriteType::WithoutResponse).expect("serialize");
        assert_eq!(json, "\"without_response\"");
        let parsed: WriteType = serde_json::from_str("\"with_response\"").expect("deserialize");
        assert_eq!(parsed, WriteType::WithResponse);
    }

    #[test]
    fn test_permission_denied_classification() {
        assert!(GattError::PermissionDenied("BLUETOOTH_CONNECT".into()).is_permission_denied());
        assert!(!GattError::NotConnected.is_permission_denied());
    }
}
