//! Link abstraction layer for credlink
//!
//! Defines the completion events a GATT link delivers to a session and the
//! sink the platform uses to deliver them.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Completion status reported by the platform for a GATT operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    /// Operation completed
    Success,
    /// Operation failed with a platform status code
    Failure(u8),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "success"),
            GattStatus::Failure(code) => write!(f, "failure({:#04x})", code),
        }
    }
}

/// Asynchronous completion events from the link to the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    /// The link came up or went down
    ConnectionStateChanged { connected: bool },
    /// Service discovery finished; the capability list can be re-read
    ServicesDiscovered { status: GattStatus },
    /// Transfer unit negotiation finished
    MtuChanged { mtu: u16, status: GattStatus },
    /// A characteristic read completed
    CharacteristicRead {
        characteristic: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// A characteristic write was acknowledged by the peer
    CharacteristicWritten {
        characteristic: Uuid,
        frame: usize,
        status: GattStatus,
    },
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::ConnectionStateChanged { connected } => {
                write!(f, "ConnectionStateChanged {{ connected: {} }}", connected)
            }
            LinkEvent::ServicesDiscovered { status } => {
                write!(f, "ServicesDiscovered {{ status: {} }}", status)
            }
            LinkEvent::MtuChanged { mtu, status } => {
                write!(f, "MtuChanged {{ mtu: {}, status: {} }}", mtu, status)
            }
            LinkEvent::CharacteristicRead {
                characteristic,
                value,
                status,
            } => write!(
                f,
                "CharacteristicRead {{ characteristic: {}, value_len: {}, status: {} }}",
                characteristic,
                value.len(),
                status
            ),
            LinkEvent::CharacteristicWritten {
                characteristic,
                frame,
                status,
            } => write!(
                f,
                "CharacteristicWritten {{ characteristic: {}, frame: {}, status: {} }}",
                characteristic, frame, status
            ),
        }
    }
}

/// Handle the platform uses to deliver [`LinkEvent`]s for one connection.
///
/// Every sink is stamped with the generation of the connection it was created
/// for. Once the session tears that connection down, events still arriving
/// through the old sink are discarded by the session.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the connection this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns false once the session has shut down.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    /// Build a detached sink and the receiving end, for platform adapter tests
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<(u64, LinkEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, tx), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gatt_status_display() {
        assert_eq!(GattStatus::Success.to_string(), "success");
        assert_eq!(GattStatus::Failure(0x85).to_string(), "failure(0x85)");
        assert!(GattStatus::Success.is_success());
        assert!(!GattStatus::Failure(1).is_success());
    }

    #[test]
    fn test_link_event_display() {
        let event = LinkEvent::CharacteristicWritten {
            characteristic: Uuid::nil(),
            frame: 3,
            status: GattStatus::Success,
        };
        let display = format!("{}", event);
        assert!(display.contains("CharacteristicWritten"));
        assert!(display.contains("frame: 3"));

        let read = LinkEvent::CharacteristicRead {
            characteristic: Uuid::nil(),
            value: vec![1, 2, 3],
            status: GattStatus::Success,
        };
        assert!(read.to_string().contains("value_len: 3"));
    }

    #[test]
    fn test_sink_stamps_generation() {
        let (sink, mut rx) = LinkEventSink::channel(7);
        assert_eq!(sink.generation(), 7);
        assert!(sink.emit(LinkEvent::ConnectionStateChanged { connected: true }));

        let (generation, event) = rx.try_recv().expect("event delivered");
        assert_eq!(generation, 7);
        assert_eq!(event, LinkEvent::ConnectionStateChanged { connected: true });
    }

    #[test]
    fn test_sink_reports_closed_receiver() {
        let (sink, rx) = LinkEventSink::channel(1);
        drop(rx);
        assert!(!sink.emit(LinkEvent::ServicesDiscovered {
            status: GattStatus::Success
        }));
    }
}
