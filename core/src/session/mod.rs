//! Chunked transfer session
//!
//! Ties the pieces together: the connection lifecycle, the read-once password
//! read, the transfer driver, and the observable state a presentation layer
//! binds to.
//!
//! The platform delivers completion events through a [`LinkEventSink`]; a pump
//! task feeds them to the session. Each accepted write acknowledgement queues
//! the next frame for the write worker, so frame `i + 1` is never issued
//! before frame `i` was acknowledged.

pub mod config;
pub mod driver;
pub mod lifecycle;
pub mod state;
mod worker;

pub use config::{ConfigError, SessionConfig};
pub use driver::{DriverAction, TransferDriver, TransferError, TransferState};
pub use lifecycle::{LifecycleAction, LinkLifecycle, LinkState};
pub use state::{ObservableState, SessionSnapshot, TransferProgress};

use crate::payload::Payload;
use crate::transport::abstraction::{GattStatus, LinkEvent, LinkEventSink};
use crate::transport::ble::framer::{self, Frame, FrameError};
use crate::transport::ble::gatt::{
    find_characteristic, GattConnection, GattDevice, GattError, ATT_WRITE_OVERHEAD,
    MAX_CHARACTERISTIC_SIZE,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use worker::WriteJob;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Framing failed: {0}")]
    Frame(#[from] FrameError),
    #[error("Frame {index} encodes to {len} bytes, over the {limit}-byte transfer unit")]
    FrameTooLarge {
        index: usize,
        len: usize,
        limit: usize,
    },
    #[error(transparent)]
    Gatt(#[from] GattError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Transfer aborted at frame {0}")]
    TransferAborted(usize),
    #[error("Session closed")]
    Closed,
}

/// Outcome of a command that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The request was handed to the link
    Issued,
    /// There is no connection handle; nothing happened
    NoConnection,
    /// The link does not expose the characteristic the command needs
    CharacteristicUnavailable,
    /// Nothing to do in the current state
    Ignored,
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    device: Arc<dyn GattDevice>,
    link: RwLock<Option<Arc<dyn GattConnection>>>,
    /// Bumped whenever a connection is opened or released
    generation: AtomicU64,
    lifecycle: Mutex<LinkLifecycle>,
    driver: Mutex<TransferDriver>,
    state: ObservableState,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    writes_tx: mpsc::Sender<WriteJob>,
}

/// A chunked transfer session against one peer.
///
/// Dropping the session stops its event pump and write worker.
pub struct TransferSession {
    inner: Arc<SessionInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransferSession {
    /// Frame `payload` and start the session tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        device: Arc<dyn GattDevice>,
        payload: Payload,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let frames = framer::frame(payload.as_str(), config.max_body_size)?;

        let limit = (usize::from(config.requested_mtu) - ATT_WRITE_OVERHEAD)
            .min(MAX_CHARACTERISTIC_SIZE);
        if let Some((index, len)) = framer::largest_frame(&frames) {
            if len > limit {
                return Err(SessionError::FrameTooLarge { index, len, limit });
            }
        }

        let total_frames = frames.len();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writes_tx, writes_rx) = mpsc::channel(config.write_queue_depth);

        let inner = Arc::new(SessionInner {
            lifecycle: Mutex::new(LinkLifecycle::new(config.requested_mtu)),
            config,
            device,
            link: RwLock::new(None),
            generation: AtomicU64::new(0),
            driver: Mutex::new(TransferDriver::new(frames)),
            state: ObservableState::new(SessionSnapshot::initial(total_frames)),
            events_tx,
            writes_tx,
        });

        let tasks = vec![
            tokio::spawn(run_event_pump(inner.clone(), events_rx)),
            tokio::spawn(worker::run_write_worker(inner.clone(), writes_rx)),
        ];

        info!(
            "Transfer session created: {} chars in {} frames",
            payload.char_len(),
            total_frames
        );
        Ok(Self { inner, tasks })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The frames this session sends, in order
    pub fn frames(&self) -> Vec<Frame> {
        self.inner.driver.lock().frames().to_vec()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    /// Open the link. Only acts when disconnected.
    pub fn connect(&self) -> Result<CommandStatus, SessionError> {
        self.inner.connect()
    }

    /// Tear the link down from any state
    pub fn disconnect(&self) -> CommandStatus {
        let actions = self.inner.lifecycle.lock().disconnect();
        if actions.is_empty() {
            return CommandStatus::NoConnection;
        }
        self.inner.apply_lifecycle(actions);
        self.inner.publish_link_state();
        CommandStatus::Issued
    }

    /// Ask the link to (re)discover services
    pub fn discover_services(&self) -> Result<CommandStatus, SessionError> {
        let Some(conn) = self.inner.connection() else {
            debug!("discover_services without connection");
            return Ok(CommandStatus::NoConnection);
        };
        conn.discover_services()?;
        Ok(CommandStatus::Issued)
    }

    /// Issue one read of the password characteristic
    pub fn read_password(&self) -> Result<CommandStatus, SessionError> {
        self.inner.issue_read()
    }

    /// Start sending at frame 0
    pub fn start_transfer(&self) -> Result<CommandStatus, SessionError> {
        self.inner.start_transfer()
    }

    /// Return a completed or aborted transfer to `Idle`
    pub fn reset_transfer(&self) -> Result<(), SessionError> {
        let mut driver = self.inner.driver.lock();
        driver.reset()?;
        self.inner.publish_progress(&driver);
        Ok(())
    }

    /// Feed a link event directly, bypassing the connection generation check
    pub fn handle_event(&self, event: LinkEvent) {
        self.inner.handle_event(event);
    }

    /// Wait until the link is ready
    pub async fn wait_ready(&self, timeout: Duration) -> Result<SessionSnapshot, SessionError> {
        self.wait_for(timeout, "link ready", |s| s.link_state == LinkState::Ready)
            .await
    }

    /// Wait until a password value has been read
    pub async fn wait_for_password(&self, timeout: Duration) -> Result<String, SessionError> {
        let snapshot = self
            .wait_for(timeout, "password", |s| s.last_password_read.is_some())
            .await?;
        snapshot.last_password_read.ok_or(SessionError::Closed)
    }

    /// Wait until the transfer completes or aborts
    pub async fn wait_for_transfer(
        &self,
        timeout: Duration,
    ) -> Result<TransferProgress, SessionError> {
        let snapshot = self
            .wait_for(timeout, "transfer", |s| s.transfer.state.is_terminal())
            .await?;
        match snapshot.transfer.state {
            TransferState::Aborted { cursor } => Err(SessionError::TransferAborted(cursor)),
            _ => Ok(snapshot.transfer),
        }
    }

    async fn wait_for<F>(
        &self,
        timeout: Duration,
        what: &'static str,
        predicate: F,
    ) -> Result<SessionSnapshot, SessionError>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.inner.state.subscribe();
        // The watch guard borrows `rx`; clone it out before `rx` drops.
        let outcome = tokio::time::timeout(timeout, rx.wait_for(predicate))
            .await
            .map(|waited| waited.map(|snapshot| snapshot.clone()));
        match outcome {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout(what)),
        }
    }

    /// Disconnect and stop the session tasks
    pub fn shutdown(mut self) {
        self.disconnect();
        self.stop_tasks();
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

async fn run_event_pump(
    inner: Arc<SessionInner>,
    mut events: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
) {
    while let Some((generation, event)) = events.recv().await {
        let current = inner.generation.load(Ordering::Acquire);
        if generation != current {
            debug!("Dropping {} from stale connection {}", event, generation);
            continue;
        }
        inner.handle_event(event);
    }
}

impl SessionInner {
    fn connection(&self) -> Option<Arc<dyn GattConnection>> {
        self.link.read().clone()
    }

    fn connect(&self) -> Result<CommandStatus, SessionError> {
        if !self.lifecycle.lock().begin_connect() {
            debug!("connect ignored: link is {}", self.lifecycle.lock().state());
            return Ok(CommandStatus::Ignored);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let sink = LinkEventSink::new(generation, self.events_tx.clone());

        // Held across the platform call so no event of this generation is
        // handled before the handle is stored.
        let mut link = self.link.write();
        match self.device.connect(sink) {
            Ok(conn) => {
                *link = Some(conn);
                drop(link);
                info!("Connecting (connection {})", generation);
                self.publish_link_state();
                Ok(CommandStatus::Issued)
            }
            Err(e) => {
                drop(link);
                self.lifecycle.lock().connect_failed();
                self.publish_link_state();
                error!("Connect failed: {}", e);
                Err(e.into())
            }
        }
    }

    fn handle_event(&self, event: LinkEvent) {
        debug!("Link event: {}", event);
        match event {
            LinkEvent::ConnectionStateChanged { connected } => {
                let actions = self.lifecycle.lock().on_connection_state(connected);
                self.apply_lifecycle(actions);
            }
            LinkEvent::ServicesDiscovered { status } => {
                if !status.is_success() {
                    warn!("Service discovery reported {}", status);
                }
                let actions = self
                    .lifecycle
                    .lock()
                    .on_services_discovered(status.is_success());
                self.apply_lifecycle(actions);
            }
            LinkEvent::MtuChanged { mtu, status } => {
                if !status.is_success() {
                    warn!("Transfer unit negotiation reported {}; using default", status);
                }
                let actions = self
                    .lifecycle
                    .lock()
                    .on_mtu_changed(mtu, status.is_success());
                self.apply_lifecycle(actions);
            }
            LinkEvent::CharacteristicRead {
                characteristic,
                value,
                status,
            } => self.on_read(characteristic, value, status),
            LinkEvent::CharacteristicWritten {
                characteristic,
                frame,
                status,
            } => self.on_write_ack(characteristic, frame, status),
        }
        self.publish_link_state();
    }

    fn apply_lifecycle(&self, actions: Vec<LifecycleAction>) {
        let mut queue: VecDeque<LifecycleAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                LifecycleAction::CaptureServices => {
                    if let Some(conn) = self.connection() {
                        let services = conn.services();
                        debug!("Capability list: {} services", services.len());
                        self.state.update(|s| s.discovered_services = services);
                    }
                }
                LifecycleAction::RequestDiscovery => {
                    if let Some(conn) = self.connection() {
                        match conn.discover_services() {
                            Ok(()) => debug!("Service discovery requested"),
                            Err(e) if e.is_permission_denied() => {
                                error!("Service discovery denied: {}", e)
                            }
                            Err(e) => warn!("Service discovery request failed: {}", e),
                        }
                    }
                }
                LifecycleAction::RequestMtu(mtu) => {
                    let result = match self.connection() {
                        Some(conn) => conn.request_mtu(mtu),
                        None => Err(GattError::NotConnected),
                    };
                    match result {
                        Ok(()) => debug!("Requested transfer unit {}", mtu),
                        Err(e) => {
                            warn!("Transfer unit request failed: {}; using default", e);
                            queue.extend(self.lifecycle.lock().mtu_request_failed());
                        }
                    }
                }
                LifecycleAction::ApplyMtu(mtu) => {
                    info!("Transfer unit negotiated: {}", mtu);
                    self.state.update(|s| s.mtu = mtu);
                    self.check_frames_fit(mtu);
                }
                LifecycleAction::Ready => {
                    info!("Link ready");
                    if self.config.read_on_ready {
                        if let Err(e) = self.issue_read() {
                            error!("Password read failed: {}", e);
                        }
                    }
                }
                LifecycleAction::Release => self.release_link(),
            }
        }
    }

    fn release_link(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let conn = self.link.write().take();
        if let Some(conn) = conn {
            conn.disconnect();
            info!("Connection released");
        }
        self.abort_transfer();
    }

    fn abort_transfer(&self) {
        let mut driver = self.driver.lock();
        if driver.abort() {
            warn!("Transfer aborted at frame {}", driver.cursor());
            self.publish_progress(&driver);
        }
    }

    fn check_frames_fit(&self, mtu: u16) {
        let limit = usize::from(mtu).saturating_sub(ATT_WRITE_OVERHEAD);
        let largest = framer::largest_frame(self.driver.lock().frames());
        if let Some((index, len)) = largest {
            if len > limit {
                warn!(
                    "Frame {} is {} bytes but the link carries {} per write",
                    index, len, limit
                );
            }
        }
    }

    fn issue_read(&self) -> Result<CommandStatus, SessionError> {
        let Some(conn) = self.connection() else {
            debug!("read_password without connection");
            return Ok(CommandStatus::NoConnection);
        };
        let service = self.config.service_uuid;
        let characteristic = self.config.read_characteristic_uuid;
        if find_characteristic(&conn.services(), service, characteristic).is_none() {
            debug!("Password characteristic not available");
            return Ok(CommandStatus::CharacteristicUnavailable);
        }
        conn.read_characteristic(service, characteristic)?;
        debug!("Password read issued");
        Ok(CommandStatus::Issued)
    }

    fn on_read(&self, characteristic: Uuid, value: Vec<u8>, status: GattStatus) {
        if characteristic != self.config.read_characteristic_uuid {
            debug!("Ignoring read of {}", characteristic);
            return;
        }
        if !status.is_success() {
            warn!("Password read reported {}", status);
            return;
        }
        let password = String::from_utf8_lossy(&value).into_owned();
        info!("Password read ({} bytes)", value.len());
        self.state.update(|s| s.last_password_read = Some(password));
    }

    fn start_transfer(&self) -> Result<CommandStatus, SessionError> {
        let Some(conn) = self.connection() else {
            debug!("start_transfer without connection");
            return Ok(CommandStatus::NoConnection);
        };
        let service = self.config.service_uuid;
        let characteristic = self.config.write_characteristic_uuid;
        if find_characteristic(&conn.services(), service, characteristic).is_none() {
            debug!("Payload characteristic not available");
            return Ok(CommandStatus::CharacteristicUnavailable);
        }

        let action = {
            let mut driver = self.driver.lock();
            let action = driver.start()?;
            self.publish_progress(&driver);
            action
        };
        match action {
            DriverAction::Write { frame, value } => {
                info!("Transfer started");
                self.enqueue_write(frame, value);
            }
            DriverAction::Completed => info!("Transfer completed: nothing to send"),
        }
        Ok(CommandStatus::Issued)
    }

    fn on_write_ack(&self, characteristic: Uuid, frame: usize, status: GattStatus) {
        if characteristic != self.config.write_characteristic_uuid {
            debug!("Ignoring write acknowledgement for {}", characteristic);
            return;
        }
        if !status.is_success() {
            warn!("Write of frame {} reported {}", frame, status);
            return;
        }

        let action = {
            let mut driver = self.driver.lock();
            let Some(action) = driver.on_acknowledgement(frame) else {
                debug!(
                    "Ignoring acknowledgement for frame {} (transfer {})",
                    frame,
                    driver.state()
                );
                return;
            };
            self.state.update(|s| s.successful_write_count += 1);
            self.publish_progress(&driver);
            action
        };

        match action {
            DriverAction::Write { frame, value } => {
                debug!("Frame {} acknowledged", frame - 1);
                self.enqueue_write(frame, value);
            }
            DriverAction::Completed => info!("Transfer completed: {} frames", frame + 1),
        }
    }

    fn publish_progress(&self, driver: &TransferDriver) {
        let progress = TransferProgress {
            state: driver.state(),
            cursor: driver.cursor(),
            total_frames: driver.len(),
        };
        self.state.update(|s| s.transfer = progress);
    }

    fn publish_link_state(&self) {
        let link_state = self.lifecycle.lock().state();
        let previous = self.state.snapshot().link_state;
        if previous != link_state {
            info!("Link state {} -> {}", previous, link_state);
        }
        self.state.update(|s| {
            s.link_state = link_state;
            s.connected = link_state.is_connected();
        });
    }
}
