//! Renderability gate.
//!
//! The renderer may bind the ray tracing buffers only when all six exist,
//! the last full composition was of the active pass and their shapes agree
//! with it.

use super::composer::GpuBufferComposer;
use crate::gpu::{
    BufferId, GpuBuffer, BLAS_INSTANCE_STRIDE, BLAS_NODE_STRIDE, BLAS_TRI_STRIDE, TLAS_INDEX_STRIDE,
    TLAS_NODE_STRIDE, TRIANGLE_ATTRIBUTE_STRIDE,
};

/// Buffer ids to bind for a ray tracing dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderBindings {
    pub tlas_nodes: BufferId,
    pub tlas_indices: BufferId,
    pub instances: BufferId,
    pub blas_nodes: BufferId,
    pub blas_triangles: BufferId,
    pub triangle_attributes: BufferId,
}

fn sized(buffer: Option<&GpuBuffer>, count: usize, stride: usize) -> Option<&GpuBuffer> {
    buffer.filter(|b| count > 0 && b.matches(count, stride))
}

/// Bindings if every required buffer exists and is consistently sized.
///
/// `pass`, `mesh_count` and `total_triangles` describe the active pass; the
/// composed buffers must belong to it and the instance table and attribute
/// buffer must match it.
pub fn render_bindings(
    composer: &GpuBufferComposer,
    pass: u64,
    attributes: Option<&GpuBuffer>,
    mesh_count: usize,
    total_triangles: usize,
) -> Option<RenderBindings> {
    let layout = composer.layout();
    if composer.composed_pass() != Some(pass) || layout.instances != mesh_count {
        return None;
    }

    let tlas_nodes = sized(composer.tlas_nodes.as_ref(), layout.tlas_nodes, TLAS_NODE_STRIDE)?;
    let tlas_indices = sized(composer.tlas_indices.as_ref(), layout.tlas_indices, TLAS_INDEX_STRIDE)?;
    let instances = sized(composer.instance_table.as_ref(), mesh_count, BLAS_INSTANCE_STRIDE)?;
    let blas_nodes = sized(composer.blas_nodes.as_ref(), layout.blas_nodes, BLAS_NODE_STRIDE)?;
    let blas_triangles = sized(composer.blas_triangles.as_ref(), layout.blas_triangles, BLAS_TRI_STRIDE)?;
    let triangle_attributes = sized(attributes, total_triangles, TRIANGLE_ATTRIBUTE_STRIDE)?;

    Some(RenderBindings {
        tlas_nodes: tlas_nodes.id(),
        tlas_indices: tlas_indices.id(),
        instances: instances.id(),
        blas_nodes: blas_nodes.id(),
        blas_triangles: blas_triangles.id(),
        triangle_attributes: triangle_attributes.id(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gpu::{GpuDevice, HostDevice};

    #[test]
    fn test_empty_composer_is_closed() {
        let composer = GpuBufferComposer::new();
        assert!(render_bindings(&composer, 1, None, 0, 0).is_none());
        assert!(render_bindings(&composer, 1, None, 2, 30).is_none());
    }

    #[test]
    fn test_mis_sized_attribute_buffer_closes_gate() {
        let device: Arc<dyn GpuDevice> = Arc::new(HostDevice::new());
        let attributes = GpuBuffer::new(&device, "attrs", 29, TRIANGLE_ATTRIBUTE_STRIDE).unwrap();
        let composer = GpuBufferComposer::new();
        // Mis-sized attribute buffer is rejected on its own
        assert!(sized(Some(&attributes), 30, TRIANGLE_ATTRIBUTE_STRIDE).is_none());
        assert!(sized(Some(&attributes), 29, TRIANGLE_ATTRIBUTE_STRIDE).is_some());
        assert!(render_bindings(&composer, 1, Some(&attributes), 1, 29).is_none());
    }
}
