// Transport module: GATT link events and BLE framing

pub mod abstraction;
pub mod ble;

pub use abstraction::{GattStatus, LinkEvent, LinkEventSink};
