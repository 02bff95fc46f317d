//! Transfer driver: one frame in flight, advanced by acknowledgements.
//!
//! The driver is a pure state machine. It never touches the link: `start` and
//! `on_acknowledgement` return the write the caller must dispatch next.
//!
//! ```text
//! ┌──────┐ start ┌────────────────┐ ack(last) ┌───────────┐
//! │ Idle │──────>│ Sending(cursor)│──────────>│ Completed │
//! └──────┘       └────────────────┘           └───────────┘
//!                  │  ack(cursor) -> Sending(cursor + 1)
//!                  │ link lost
//!                  ↓
//!               ┌─────────┐
//!               │ Aborted │
//!               └─────────┘
//! ```

use crate::transport::ble::framer::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from driving a transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer can only start from Idle (currently {0})")]
    NotIdle(TransferState),
    #[error("Transfer is still sending frame {0}")]
    StillSending(usize),
}

/// Transfer driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Not started
    Idle,
    /// Frame `cursor` is in flight
    Sending { cursor: usize },
    /// Every frame acknowledged
    Completed,
    /// The link went away mid-transfer
    Aborted { cursor: usize },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Aborted { .. })
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Idle => write!(f, "Idle"),
            TransferState::Sending { cursor } => write!(f, "Sending({})", cursor),
            TransferState::Completed => write!(f, "Completed"),
            TransferState::Aborted { cursor } => write!(f, "Aborted({})", cursor),
        }
    }
}

/// Next step the caller must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    /// Write this frame to the payload characteristic
    Write { frame: usize, value: Vec<u8> },
    /// The last frame was acknowledged
    Completed,
}

/// Sequential frame writer
#[derive(Debug, Clone)]
pub struct TransferDriver {
    frames: Vec<Frame>,
    state: TransferState,
}

impl TransferDriver {
    /// Create a driver over an already framed payload
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            state: TransferState::Idle,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Index of the next (or in-flight) frame; `len()` once completed
    pub fn cursor(&self) -> usize {
        match self.state {
            TransferState::Idle => 0,
            TransferState::Sending { cursor } | TransferState::Aborted { cursor } => cursor,
            TransferState::Completed => self.frames.len(),
        }
    }

    /// Number of frames in the transfer
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Begin sending at frame 0
    pub fn start(&mut self) -> Result<DriverAction, TransferError> {
        if self.state != TransferState::Idle {
            return Err(TransferError::NotIdle(self.state));
        }
        if self.frames.is_empty() {
            self.state = TransferState::Completed;
            return Ok(DriverAction::Completed);
        }
        self.state = TransferState::Sending { cursor: 0 };
        Ok(self.write_action(0))
    }

    /// Feed a write acknowledgement for `frame`.
    ///
    /// Returns `None` when the acknowledgement does not match the in-flight
    /// frame (stale, duplicate, or arriving outside `Sending`).
    pub fn on_acknowledgement(&mut self, frame: usize) -> Option<DriverAction> {
        let TransferState::Sending { cursor } = self.state else {
            return None;
        };
        if frame != cursor {
            return None;
        }

        let next = cursor + 1;
        if next < self.frames.len() {
            self.state = TransferState::Sending { cursor: next };
            Some(self.write_action(next))
        } else {
            self.state = TransferState::Completed;
            Some(DriverAction::Completed)
        }
    }

    /// The link is gone; a transfer in flight can never finish
    pub fn abort(&mut self) -> bool {
        if let TransferState::Sending { cursor } = self.state {
            self.state = TransferState::Aborted { cursor };
            return true;
        }
        false
    }

    /// Return a finished or aborted transfer to `Idle`
    pub fn reset(&mut self) -> Result<(), TransferError> {
        if let TransferState::Sending { cursor } = self.state {
            return Err(TransferError::StillSending(cursor));
        }
        self.state = TransferState::Idle;
        Ok(())
    }

    fn write_action(&self, index: usize) -> DriverAction {
        DriverAction::Write {
            frame: index,
            value: self.frames[index].encode().into_bytes(),
        }
    }
}
