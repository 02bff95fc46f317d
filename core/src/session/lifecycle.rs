//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ServicesDiscovered -> Ready
//!       ^______________________________________________________|
//!                      disconnect / link lost
//! ```
//!
//! Like the transfer driver this performs no I/O. Each input returns the
//! actions the session must carry out against the link.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No connection handle
    Disconnected,
    /// Handle created, waiting for the link to come up
    Connecting,
    /// Link up, service discovery requested
    Connected,
    /// Services known, transfer unit negotiation in progress
    ServicesDiscovered,
    /// Reads and writes can be issued
    Ready,
}

impl LinkState {
    /// The link is up, whatever the discovery progress
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            LinkState::Connected | LinkState::ServicesDiscovered | LinkState::Ready
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::ServicesDiscovered => write!(f, "ServicesDiscovered"),
            LinkState::Ready => write!(f, "Ready"),
        }
    }
}

/// Work the session must do after a lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Snapshot the capability list the link currently reports
    CaptureServices,
    /// Ask the link to discover services
    RequestDiscovery,
    /// Ask the link for a larger transfer unit
    RequestMtu(u16),
    /// Record a negotiated transfer unit
    ApplyMtu(u16),
    /// The link became ready
    Ready,
    /// Release the connection handle
    Release,
}

/// Connection lifecycle
#[derive(Debug, Clone)]
pub struct LinkLifecycle {
    state: LinkState,
    requested_mtu: u16,
}

impl LinkLifecycle {
    pub fn new(requested_mtu: u16) -> Self {
        Self {
            state: LinkState::Disconnected,
            requested_mtu,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Enter `Connecting`. Returns false (and changes nothing) unless
    /// currently `Disconnected`.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != LinkState::Disconnected {
            return false;
        }
        self.state = LinkState::Connecting;
        true
    }

    /// Creating the handle failed synchronously
    pub fn connect_failed(&mut self) {
        self.state = LinkState::Disconnected;
    }

    /// The link reported a connection state change
    pub fn on_connection_state(&mut self, connected: bool) -> Vec<LifecycleAction> {
        match (self.state, connected) {
            (LinkState::Connecting, true) => {
                self.state = LinkState::Connected;
                vec![
                    LifecycleAction::CaptureServices,
                    LifecycleAction::RequestDiscovery,
                ]
            }
            (LinkState::Disconnected, _) => Vec::new(),
            (_, false) => {
                self.state = LinkState::Disconnected;
                vec![LifecycleAction::Release]
            }
            // already up; a repeated "connected" changes nothing
            (_, true) => Vec::new(),
        }
    }

    /// Service discovery finished
    pub fn on_services_discovered(&mut self, success: bool) -> Vec<LifecycleAction> {
        match self.state {
            LinkState::Connected if success => {
                self.state = LinkState::ServicesDiscovered;
                vec![
                    LifecycleAction::CaptureServices,
                    LifecycleAction::RequestMtu(self.requested_mtu),
                ]
            }
            LinkState::ServicesDiscovered | LinkState::Ready if success => {
                vec![LifecycleAction::CaptureServices]
            }
            _ => Vec::new(),
        }
    }

    /// The transfer unit request could not be issued. Negotiation is best
    /// effort: the link proceeds with the default unit.
    pub fn mtu_request_failed(&mut self) -> Vec<LifecycleAction> {
        if self.state != LinkState::ServicesDiscovered {
            return Vec::new();
        }
        self.state = LinkState::Ready;
        vec![LifecycleAction::Ready]
    }

    /// Negotiation finished, successfully or not
    pub fn on_mtu_changed(&mut self, mtu: u16, success: bool) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();
        if success && self.state.is_connected() {
            actions.push(LifecycleAction::ApplyMtu(mtu));
        }
        if self.state == LinkState::ServicesDiscovered {
            self.state = LinkState::Ready;
            actions.push(LifecycleAction::Ready);
        }
        actions
    }

    /// Caller-initiated teardown, valid from any state
    pub fn disconnect(&mut self) -> Vec<LifecycleAction> {
        if self.state == LinkState::Disconnected {
            return Vec::new();
        }
        self.state = LinkState::Disconnected;
        vec![LifecycleAction::Release]
    }
}
