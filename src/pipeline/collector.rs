//! Scene geometry collection: enumerate meshes and partition the vertex arena.

use std::sync::Arc;

use tracing::{debug, warn};

use super::record::{MeshRecord, MeshSet};
use crate::gpu::{GpuBuffer, GpuDevice, PackedLayout, TRIANGLE_ATTRIBUTE_STRIDE, VERTEX_POSITION_STRIDE};
use crate::scene::Renderable;
use crate::util::Result;

/// GPU-resident vertex arena and its parallel attribute buffer.
#[derive(Debug)]
pub struct VertexArena {
    /// `3 * total_triangles` positions.
    pub positions: GpuBuffer,
    /// `total_triangles` attribute records.
    pub attributes: GpuBuffer,
}

impl VertexArena {
    pub fn allocate(device: &Arc<dyn GpuDevice>, total_triangles: usize) -> Result<Self> {
        Ok(Self {
            positions: GpuBuffer::new(device, "vertex_arena", total_triangles * 3, VERTEX_POSITION_STRIDE)?,
            attributes: GpuBuffer::new(
                device,
                "triangle_attributes",
                total_triangles,
                TRIANGLE_ATTRIBUTE_STRIDE,
            )?,
        })
    }
}

/// Build the mesh set for `objects`, in enumeration order.
///
/// Objects without geometry, with no triangles, or whose positions the
/// extraction kernel cannot read are skipped. Offsets are running sums of
/// the triangle counts of the kept meshes.
pub fn collect(objects: &[Arc<dyn Renderable>]) -> MeshSet {
    let mut records = Vec::with_capacity(objects.len());
    let mut offset = 0;

    for object in objects {
        let Some(geometry) = object.geometry() else {
            debug!(name = object.name(), "skipping object without geometry");
            continue;
        };
        let layout = match PackedLayout::resolve(&geometry.layout) {
            Ok(layout) => layout,
            Err(e) => {
                warn!(name = object.name(), "skipping mesh: {e}");
                continue;
            }
        };
        let tri_count = geometry.triangle_count();
        if tri_count == 0 {
            debug!(name = object.name(), "skipping mesh with no triangles");
            continue;
        }

        records.push(MeshRecord {
            name: object.name().to_string(),
            source: Arc::clone(object),
            layout,
            tri_offset: offset,
            tri_count,
        });
        offset += tri_count;
    }

    MeshSet::new(records)
}
