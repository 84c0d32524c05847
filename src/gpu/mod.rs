//! GPU device boundary.
//!
//! The pipeline talks to the GPU only through [`GpuDevice`]: sized buffers
//! addressed by [`BufferId`], byte uploads, one vertex-extraction dispatch per
//! mesh and asynchronous readback with a completion callback.
//!
//! ## Backends
//! - [`HostDevice`] - in-process emulation, used by tests and the CLI
//! - `WgpuDevice` - real GPU backend (feature `wgpu`)

pub mod extract;
pub mod host;
pub mod layout;
#[cfg(feature = "wgpu")]
pub mod wgpu_device;

use std::fmt;
use std::sync::Arc;

use crate::util::Result;

pub use extract::{ExtractionJob, PackedLayout};
pub use host::HostDevice;
pub use layout::*;
#[cfg(feature = "wgpu")]
pub use wgpu_device::WgpuDevice;

/// Opaque buffer handle issued by a [`GpuDevice`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferId(pub u32);

/// Buffer creation parameters. Size in bytes is `count * stride`.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub count: usize,
    pub stride: usize,
}

impl BufferDesc<'_> {
    pub fn size_bytes(&self) -> u64 {
        (self.count * self.stride) as u64
    }
}

/// Completion callback for [`GpuDevice::request_readback`].
///
/// Receives a host-owned copy of the buffer contents, or the transfer error.
pub type ReadbackCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// GPU operations required by the pipeline.
pub trait GpuDevice: Send + Sync {
    /// Allocate a zero-initialized buffer of `count * stride` bytes.
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferId>;

    /// Release a buffer. Unknown ids are ignored.
    fn destroy_buffer(&self, id: BufferId);

    /// Copy `data` into the buffer at `offset` bytes.
    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<()>;

    /// Run the vertex extraction kernel for one mesh.
    fn dispatch_extraction(&self, job: &ExtractionJob) -> Result<()>;

    /// Start a non-blocking copy of the whole buffer into host memory.
    ///
    /// `on_complete` fires exactly once, from a later [`GpuDevice::poll`].
    fn request_readback(&self, id: BufferId, on_complete: ReadbackCallback) -> Result<()>;

    /// Drive pending work and deliver completed readbacks. Never blocks.
    fn poll(&self);
}

/// Owned device buffer. Destroyed when dropped.
pub struct GpuBuffer {
    device: Arc<dyn GpuDevice>,
    id: BufferId,
    count: usize,
    stride: usize,
}

impl GpuBuffer {
    pub fn new(device: &Arc<dyn GpuDevice>, label: &str, count: usize, stride: usize) -> Result<Self> {
        let id = device.create_buffer(&BufferDesc { label, count, stride })?;
        Ok(Self {
            device: Arc::clone(device),
            id,
            count,
            stride,
        })
    }

    /// Create a buffer sized to `data` and upload it.
    pub fn with_data(
        device: &Arc<dyn GpuDevice>,
        label: &str,
        data: &[u8],
        stride: usize,
    ) -> Result<Self> {
        let buffer = Self::new(device, label, data.len().div_ceil(stride.max(1)), stride)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Element count.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Element stride in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size_bytes(&self) -> u64 {
        (self.count * self.stride) as u64
    }

    /// Upload bytes at a byte offset.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.device.write_buffer(self.id, offset, data)
    }

    /// True if this buffer has exactly the given shape.
    pub fn matches(&self, count: usize, stride: usize) -> bool {
        self.count == count && self.stride == stride
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.id);
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("id", &self.id)
            .field("count", &self.count)
            .field("stride", &self.stride)
            .finish()
    }
}

/// Ensure `slot` holds a buffer of exactly `count` elements of `stride` bytes.
///
/// A buffer of any other shape is destroyed and recreated, never resized in
/// place. Returns true if a new buffer was created.
pub fn prepare_buffer(
    device: &Arc<dyn GpuDevice>,
    slot: &mut Option<GpuBuffer>,
    label: &str,
    count: usize,
    stride: usize,
) -> Result<bool> {
    if slot.as_ref().is_some_and(|b| b.matches(count, stride)) {
        return Ok(false);
    }
    // Release the old buffer before allocating its replacement
    *slot = None;
    *slot = Some(GpuBuffer::new(device, label, count, stride)?);
    Ok(true)
}
