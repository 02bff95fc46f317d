//! Observable session state.
//!
//! The session is the only writer; presentation code subscribes and reads.

use crate::session::driver::TransferState;
use crate::session::lifecycle::LinkState;
use crate::transport::ble::gatt::{GattService, DEFAULT_ATT_MTU};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Transfer progress as seen by subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub state: TransferState,
    /// Next (or in-flight) frame index
    pub cursor: usize,
    pub total_frames: usize,
}

/// Point-in-time copy of everything a presentation layer may display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub link_state: LinkState,
    pub last_password_read: Option<String>,
    /// Accepted write acknowledgements over the session lifetime
    pub successful_write_count: u64,
    pub discovered_services: Vec<GattService>,
    /// ATT transfer unit currently in effect
    pub mtu: u16,
    pub transfer: TransferProgress,
}

impl SessionSnapshot {
    pub(crate) fn initial(total_frames: usize) -> Self {
        Self {
            connected: false,
            link_state: LinkState::Disconnected,
            last_password_read: None,
            successful_write_count: 0,
            discovered_services: Vec::new(),
            mtu: DEFAULT_ATT_MTU,
            transfer: TransferProgress {
                state: TransferState::Idle,
                cursor: 0,
                total_frames,
            },
        }
    }
}

/// Single-writer broadcast cell holding the latest [`SessionSnapshot`]
#[derive(Debug)]
pub struct ObservableState {
    tx: watch::Sender<SessionSnapshot>,
}

impl ObservableState {
    pub fn new(initial: SessionSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value
    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    /// New subscriber, starting at the current value
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    /// Apply `f`; subscribers are woken only if the snapshot changed
    pub(crate) fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionSnapshot),
    {
        self.tx.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            f(snapshot);
            *snapshot != before
        });
    }
}
