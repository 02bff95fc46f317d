// Credlink Core: chunked credential transfer over a BLE GATT link
#![allow(clippy::empty_line_after_doc_comments)]
//
// A central connects to a peripheral exposing the credential service, reads
// a one-time password from one characteristic, and writes a JSON credential
// to another as indexed frames, one frame per acknowledged write.

pub mod payload;
pub mod session;
pub mod transport;

pub use payload::{Payload, PayloadError};
pub use session::{
    CommandStatus, ConfigError, LinkState, SessionConfig, SessionError, SessionSnapshot,
    TransferProgress, TransferSession, TransferState,
};
pub use transport::ble::{
    Frame, FrameAssembler, FrameError, GattConnection, GattDevice, GattError, GattService,
    LoopbackDevice, LoopbackFaults, WriteType,
};
pub use transport::{GattStatus, LinkEvent, LinkEventSink};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports_frame_a_payload() {
        let payload = Payload::new("A".repeat(300));
        let frames = transport::ble::frame(payload.as_str(), SessionConfig::default().max_body_size)
            .expect("frame");

        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_last);
    }
}
