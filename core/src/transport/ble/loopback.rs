//! In-process peripheral
//!
//! [`LoopbackDevice`] plays the remote side of the credential service: it
//! answers password reads, reassembles written frames and acknowledges every
//! write through the session's event sink. Faults can be injected to exercise
//! refusal, lost and duplicated acknowledgements, and permission denial.

use super::framer::{AssemblyProgress, FrameAssembler};
use super::gatt::{
    GattConnection, GattDevice, GattError, GattService, GattWriteRequest, CREDENTIAL_SERVICE_UUID,
    MAX_ATT_MTU, PASSWORD_CHARACTERISTIC_UUID, PAYLOAD_CHARACTERISTIC_UUID,
};
use crate::transport::abstraction::{GattStatus, LinkEvent, LinkEventSink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Faults the loopback peripheral injects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackFaults {
    /// `connect` fails synchronously
    pub refuse_connection: bool,
    /// `request_mtu` fails synchronously
    pub refuse_mtu: bool,
    /// Never acknowledge the write of this frame
    pub drop_ack_for: Option<usize>,
    /// Acknowledge every write twice
    pub duplicate_acks: bool,
    /// Writes fail with a permission error
    pub deny_writes: bool,
}

#[derive(Debug, Default)]
struct Peripheral {
    assembler: FrameAssembler,
    written: Vec<Vec<u8>>,
    payloads: Vec<String>,
    link: Option<LinkEventSink>,
    connections: usize,
}

/// Loopback peripheral that serves the credential service in process
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    password: Arc<str>,
    max_mtu: u16,
    faults: LoopbackFaults,
    peripheral: Arc<Mutex<Peripheral>>,
}

impl LoopbackDevice {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Arc::from(password.into()),
            max_mtu: MAX_ATT_MTU,
            faults: LoopbackFaults::default(),
            peripheral: Arc::new(Mutex::new(Peripheral::default())),
        }
    }

    pub fn with_faults(mut self, faults: LoopbackFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Largest transfer unit the peripheral accepts
    pub fn with_max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    /// Raw values written so far, across all connections
    pub fn written_frames(&self) -> Vec<String> {
        self.peripheral
            .lock()
            .written
            .iter()
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    /// Payloads reassembled from a complete frame sequence
    pub fn received_payloads(&self) -> Vec<String> {
        self.peripheral.lock().payloads.clone()
    }

    /// Number of successful `connect` calls
    pub fn connection_count(&self) -> usize {
        self.peripheral.lock().connections
    }

    /// Drop the current link from the peripheral side
    pub fn drop_link(&self) -> bool {
        let link = self.peripheral.lock().link.take();
        match link {
            Some(sink) => {
                info!("Loopback peripheral dropped the link");
                sink.emit(LinkEvent::ConnectionStateChanged { connected: false })
            }
            None => false,
        }
    }
}

impl GattDevice for LoopbackDevice {
    fn connect(&self, events: LinkEventSink) -> Result<Arc<dyn GattConnection>, GattError> {
        if self.faults.refuse_connection {
            warn!("Loopback peripheral refused connection");
            return Err(GattError::ConnectionFailed("peripheral refused".into()));
        }

        {
            let mut peripheral = self.peripheral.lock();
            peripheral.connections += 1;
            peripheral.assembler.reset();
            peripheral.link = Some(events.clone());
        }
        events.emit(LinkEvent::ConnectionStateChanged { connected: true });
        debug!("Loopback connection {} opened", events.generation());

        Ok(Arc::new(LoopbackConnection {
            device: self.clone(),
            events,
            discovered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackConnection {
    device: LoopbackDevice,
    events: LinkEventSink,
    discovered: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> Result<(), GattError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GattError::NotConnected);
        }
        Ok(())
    }

    fn acknowledge(&self, characteristic: Uuid, frame: usize) {
        let faults = &self.device.faults;
        if faults.drop_ack_for == Some(frame) {
            debug!("Loopback dropping acknowledgement for frame {}", frame);
            return;
        }
        let ack = LinkEvent::CharacteristicWritten {
            characteristic,
            frame,
            status: GattStatus::Success,
        };
        if faults.duplicate_acks {
            self.events.emit(ack.clone());
        }
        self.events.emit(ack);
    }
}

impl GattConnection for LoopbackConnection {
    fn discover_services(&self) -> Result<(), GattError> {
        self.ensure_open()?;
        self.discovered.store(true, Ordering::Release);
        self.events.emit(LinkEvent::ServicesDiscovered {
            status: GattStatus::Success,
        });
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        if !self.discovered.load(Ordering::Acquire) {
            return Vec::new();
        }
        vec![GattService::credential_service(
            CREDENTIAL_SERVICE_UUID,
            PASSWORD_CHARACTERISTIC_UUID,
            PAYLOAD_CHARACTERISTIC_UUID,
        )]
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), GattError> {
        self.ensure_open()?;
        if self.device.faults.refuse_mtu {
            return Err(GattError::Unsupported("transfer unit negotiation".into()));
        }
        self.events.emit(LinkEvent::MtuChanged {
            mtu: mtu.min(self.device.max_mtu),
            status: GattStatus::Success,
        });
        Ok(())
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), GattError> {
        self.ensure_open()?;
        if service != CREDENTIAL_SERVICE_UUID || characteristic != PASSWORD_CHARACTERISTIC_UUID {
            return Err(GattError::CharacteristicNotFound(characteristic));
        }
        self.events.emit(LinkEvent::CharacteristicRead {
            characteristic,
            value: self.device.password.as_bytes().to_vec(),
            status: GattStatus::Success,
        });
        Ok(())
    }

    fn write_characteristic(&self, request: GattWriteRequest) -> Result<(), GattError> {
        self.ensure_open()?;
        if self.device.faults.deny_writes {
            return Err(GattError::PermissionDenied("write to payload characteristic".into()));
        }
        if request.service != CREDENTIAL_SERVICE_UUID
            || request.characteristic != PAYLOAD_CHARACTERISTIC_UUID
        {
            return Err(GattError::CharacteristicNotFound(request.characteristic));
        }

        {
            let mut peripheral = self.device.peripheral.lock();
            peripheral.written.push(request.value.clone());
            match peripheral.assembler.push(&request.value) {
                Ok(AssemblyProgress::Complete(payload)) => {
                    info!("Loopback peripheral received {} chars", payload.chars().count());
                    peripheral.payloads.push(payload);
                    peripheral.assembler.reset();
                }
                Ok(AssemblyProgress::Partial { received }) => {
                    debug!("Loopback peripheral holds {} frames", received)
                }
                Err(e) => warn!("Loopback peripheral rejected frame {}: {}", request.frame, e),
            }
        }

        self.acknowledge(request.characteristic, request.frame);
        Ok(())
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut peripheral = self.device.peripheral.lock();
            let ours = peripheral
                .link
                .as_ref()
                .is_some_and(|sink| sink.generation() == self.events.generation());
            if ours {
                peripheral.link = None;
            }
        }
        self.events
            .emit(LinkEvent::ConnectionStateChanged { connected: false });
    }
}
