//! In-process [`GpuDevice`] emulation.
//!
//! Buffers are plain byte vectors. Extraction runs the reference kernel on the
//! rayon pool; readbacks snapshot the buffer when requested and complete on a
//! later [`GpuDevice::poll`], the same way a mapped staging buffer would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::extract::extract_mesh;
use super::layout::{TRIANGLE_ATTRIBUTE_STRIDE, VERTEX_POSITION_STRIDE};
use super::{BufferDesc, BufferId, ExtractionJob, GpuDevice, ReadbackCallback};
use crate::util::{Error, Result};

struct PendingReadback {
    data: Result<Vec<u8>>,
    polls_left: u32,
    callback: ReadbackCallback,
}

#[derive(Default)]
struct HostState {
    buffers: HashMap<u32, Vec<u8>>,
    next_id: u32,
    pending: Vec<PendingReadback>,
}

/// CPU-backed device for tests and headless runs.
pub struct HostDevice {
    state: Mutex<HostState>,
    readback_latency: u32,
    fail_next_readback: AtomicBool,
    fail_next_write: AtomicBool,
    dispatches: AtomicUsize,
}

impl HostDevice {
    /// Device whose readbacks complete on the first poll after the request.
    pub fn new() -> Self {
        Self::with_readback_latency(1)
    }

    /// Device whose readbacks complete after `polls` calls to `poll()`.
    pub fn with_readback_latency(polls: u32) -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            readback_latency: polls.max(1),
            fail_next_readback: AtomicBool::new(false),
            fail_next_write: AtomicBool::new(false),
            dispatches: AtomicUsize::new(0),
        }
    }

    /// Make the next requested readback report a transfer error.
    pub fn fail_next_readback(&self) {
        self.fail_next_readback.store(true, Ordering::SeqCst);
    }

    /// Make the next buffer write fail.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Readbacks requested but not yet delivered.
    pub fn pending_readbacks(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Total extraction dispatches executed.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    /// Copy of a buffer's current contents.
    pub fn read_buffer(&self, id: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&id.0).cloned()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn write_into(buffers: &mut HashMap<u32, Vec<u8>>, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
    let buffer = buffers.get_mut(&id.0).ok_or(Error::UnknownBuffer(id))?;
    let size = buffer.len() as u64;
    let end = offset + data.len() as u64;
    if end > size {
        return Err(Error::WriteOutOfRange {
            offset,
            len: data.len(),
            size,
        });
    }
    buffer[offset as usize..end as usize].copy_from_slice(data);
    Ok(())
}

impl GpuDevice for HostDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferId> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.buffers.insert(id, vec![0; desc.size_bytes() as usize]);
        tracing::trace!(label = desc.label, id, bytes = desc.size_bytes(), "create buffer");
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, id: BufferId) {
        self.state.lock().buffers.remove(&id.0);
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(Error::other(format!("write to buffer {} rejected", id.0)));
        }
        write_into(&mut self.state.lock().buffers, id, offset, data)
    }

    fn dispatch_extraction(&self, job: &ExtractionJob) -> Result<()> {
        let mut state = self.state.lock();
        let vertices = state
            .buffers
            .get(&job.vertex_buffer.0)
            .ok_or(Error::UnknownBuffer(job.vertex_buffer))?;
        let indices = state
            .buffers
            .get(&job.index_buffer.0)
            .ok_or(Error::UnknownBuffer(job.index_buffer))?;

        let (positions, attributes) = extract_mesh(vertices, indices, job);

        let start = job.output_triangle_start as u64;
        write_into(
            &mut state.buffers,
            job.positions,
            start * 3 * VERTEX_POSITION_STRIDE as u64,
            bytemuck::cast_slice(&positions),
        )?;
        write_into(
            &mut state.buffers,
            job.attributes,
            start * TRIANGLE_ATTRIBUTE_STRIDE as u64,
            bytemuck::cast_slice(&attributes),
        )?;
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn request_readback(&self, id: BufferId, on_complete: ReadbackCallback) -> Result<()> {
        let mut state = self.state.lock();
        let snapshot = state.buffers.get(&id.0).cloned().ok_or(Error::UnknownBuffer(id))?;
        let data = if self.fail_next_readback.swap(false, Ordering::SeqCst) {
            Err(Error::ReadbackFailed(format!("transfer of buffer {} aborted", id.0)))
        } else {
            Ok(snapshot)
        };
        state.pending.push(PendingReadback {
            data,
            polls_left: self.readback_latency,
            callback: on_complete,
        });
        Ok(())
    }

    fn poll(&self) {
        let completed: Vec<PendingReadback> = {
            let mut state = self.state.lock();
            for p in state.pending.iter_mut() {
                p.polls_left = p.polls_left.saturating_sub(1);
            }
            let (done, waiting) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|p| p.polls_left == 0);
            state.pending = waiting;
            done
        };
        // Callbacks run unlocked so they may touch the device
        for p in completed {
            (p.callback)(p.data);
        }
    }
}
