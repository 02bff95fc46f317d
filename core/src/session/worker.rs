//! Dedicated write worker.
//!
//! Frame writes never run on the thread that delivered the acknowledgement.
//! They are queued on a bounded channel and issued one by one by this task.
//! Jobs carry the connection generation they were queued for; a job outliving
//! its connection is dropped instead of being written to a newer link.

use super::SessionInner;
use crate::transport::ble::gatt::{find_characteristic, GattWriteRequest};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// One frame waiting to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WriteJob {
    pub generation: u64,
    pub frame: usize,
    pub value: Vec<u8>,
}

pub(crate) async fn run_write_worker(inner: Arc<SessionInner>, mut jobs: mpsc::Receiver<WriteJob>) {
    while let Some(job) = jobs.recv().await {
        inner.dispatch_write(job);
    }
    debug!("Write worker stopped");
}

impl SessionInner {
    pub(crate) fn enqueue_write(&self, frame: usize, value: Vec<u8>) {
        let job = WriteJob {
            generation: self.generation.load(Ordering::Acquire),
            frame,
            value,
        };
        if let Err(e) = self.writes_tx.try_send(job) {
            warn!("Write queue rejected frame {}: {}", frame, e);
        }
    }

    pub(crate) fn dispatch_write(&self, job: WriteJob) {
        let current = self.generation.load(Ordering::Acquire);
        if job.generation != current {
            debug!(
                "Dropping frame {} queued for connection {} (now {})",
                job.frame, job.generation, current
            );
            return;
        }

        let Some(conn) = self.connection() else {
            debug!("No connection; frame {} not written", job.frame);
            return;
        };
        let service = self.config.service_uuid;
        let characteristic = self.config.write_characteristic_uuid;
        if find_characteristic(&conn.services(), service, characteristic).is_none() {
            debug!("Payload characteristic missing; frame {} not written", job.frame);
            return;
        }

        let frame = job.frame;
        let len = job.value.len();
        let request = match GattWriteRequest::new(
            service,
            characteristic,
            frame,
            job.value,
            self.config.write_type,
        ) {
            Ok(request) => request,
            Err(e) => {
                error!("Frame {} cannot be written: {}", frame, e);
                return;
            }
        };

        debug!("Write start: frame {} ({} bytes)", frame, len);
        match conn.write_characteristic(request) {
            Ok(()) => debug!("Write issued: frame {}", frame),
            Err(e) if e.is_permission_denied() => {
                error!("Write of frame {} denied: {}", frame, e);
                self.abort_transfer();
            }
            Err(e) => warn!("Write of frame {} failed: {}", frame, e),
        }
    }
}
