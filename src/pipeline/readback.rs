//! Asynchronous readback of the vertex arena.
//!
//! The completion callback is the only place a build task is started. It
//! converts the transferred bytes into a durable `Arc<[Vec4]>` before handing
//! them to the scheduler, so the build worker never touches memory the device
//! may reuse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info};

use super::scheduler::BuildTask;
use crate::gpu::{GpuBuffer, GpuDevice, VERTEX_POSITION_STRIDE};
use crate::util::{Error, Result, Vec4};

/// State of one arena transfer.
pub enum ReadbackState {
    /// Requested, not yet delivered.
    Waiting,
    /// Transfer failed; no build was started.
    Failed(Error),
    /// Delivered and a build task was started.
    Building(BuildTask),
    /// The task or failure has been handed to the pass.
    Taken,
    /// Completed after the ticket was abandoned; ignored.
    Discarded,
}

/// Handle to a requested readback.
pub struct ReadbackTicket {
    state: Arc<Mutex<ReadbackState>>,
    /// Set to stop a late completion from starting a build.
    abandoned: Arc<AtomicBool>,
}

impl ReadbackTicket {
    /// True while the transfer has not completed.
    pub fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), ReadbackState::Waiting)
    }

    /// Take the failure, if the transfer failed.
    pub fn take_failure(&self) -> Option<Error> {
        let mut state = self.state.lock();
        if !matches!(*state, ReadbackState::Failed(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, ReadbackState::Taken) {
            ReadbackState::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Take the build task started by the completion callback.
    pub fn take_task(&self) -> Option<BuildTask> {
        let mut state = self.state.lock();
        if !matches!(*state, ReadbackState::Building(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, ReadbackState::Taken) {
            ReadbackState::Building(task) => Some(task),
            _ => None,
        }
    }

    /// Ignore the transfer if it completes later.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }
}

impl Drop for ReadbackTicket {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Request a host copy of `positions` and start a build from it on success.
///
/// `start_build` runs inside the completion callback with the durable copy.
pub fn request(
    device: &Arc<dyn GpuDevice>,
    pass: u64,
    positions: &GpuBuffer,
    start_build: impl FnOnce(Arc<[Vec4]>) -> BuildTask + Send + 'static,
) -> Result<ReadbackTicket> {
    let state = Arc::new(Mutex::new(ReadbackState::Waiting));
    let abandoned = Arc::new(AtomicBool::new(false));
    let expected = positions.count() * VERTEX_POSITION_STRIDE;
    let requested_at = Instant::now();

    let sink = Arc::clone(&state);
    let skip = Arc::clone(&abandoned);
    device.request_readback(
        positions.id(),
        Box::new(move |result| {
            if skip.load(Ordering::SeqCst) {
                info!(pass, "discarding readback of superseded pass");
                *sink.lock() = ReadbackState::Discarded;
                return;
            }
            let next = match result {
                Ok(bytes) if bytes.len() >= expected => {
                    info!(
                        pass,
                        bytes = expected,
                        "arena readback completed in {:.2}ms",
                        requested_at.elapsed().as_secs_f64() * 1000.0
                    );
                    let vertices: Arc<[Vec4]> = bytemuck::pod_collect_to_vec::<u8, Vec4>(&bytes[..expected]).into();
                    ReadbackState::Building(start_build(vertices))
                }
                Ok(bytes) => {
                    let e = Error::ReadbackFailed(format!("expected {expected} bytes, got {}", bytes.len()));
                    error!(pass, "{e}");
                    ReadbackState::Failed(e)
                }
                Err(e) => {
                    error!(pass, "{e}");
                    ReadbackState::Failed(e)
                }
            };
            *sink.lock() = next;
        }),
    )?;

    Ok(ReadbackTicket { state, abandoned })
}
