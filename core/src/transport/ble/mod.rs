/// BLE (Bluetooth Low Energy) Transport Module
///
/// This module provides the protocol-level pieces of the credential transfer
/// link. It includes:
///
/// - **gatt**: credential service identifiers, the GATT data model, and the
///   device/connection traits a platform implements
/// - **framer**: splitting a payload into indexed frames and reassembling them
/// - **loopback**: an in-process peripheral serving the credential service
///
/// Platform adapters (btleplug on desktop, native stacks on mobile) implement
/// [`GattDevice`] and [`GattConnection`]; everything here is testable without
/// Bluetooth hardware.

pub mod framer;
pub mod gatt;
pub mod loopback;

// Re-export commonly used types
pub use framer::{
    frame, largest_frame, AssemblyProgress, Frame, FrameAssembler, FrameError,
    DEFAULT_MAX_BODY_SIZE, EOM_MARKER,
};

pub use gatt::{
    find_characteristic, CharacteristicProperties, GattCharacteristicInfo, GattConnection,
    GattDevice, GattError, GattService, GattWriteRequest, WriteType, ATT_WRITE_OVERHEAD,
    CREDENTIAL_SERVICE_UUID, DEFAULT_ATT_MTU, MAX_ATT_MTU, MAX_CHARACTERISTIC_SIZE,
    PASSWORD_CHARACTERISTIC_UUID, PAYLOAD_CHARACTERISTIC_UUID,
};

pub use loopback::{LoopbackDevice, LoopbackFaults};
