//! Vertex packing: one extraction dispatch per mesh into the shared arena.

use std::sync::Arc;

use super::collector::VertexArena;
use super::record::MeshSet;
use crate::gpu::{ExtractionJob, GpuDevice};
use crate::util::{Error, Result};

/// Extraction job for every record, in enumeration order.
pub fn extraction_jobs(set: &MeshSet, arena: &VertexArena) -> Result<Vec<ExtractionJob>> {
    set.records()
        .iter()
        .map(|record| {
            let geometry = record
                .source
                .geometry()
                .ok_or_else(|| Error::other(format!("mesh {} lost its geometry", record.name)))?;
            Ok(ExtractionJob {
                vertex_buffer: geometry.vertex_buffer.id(),
                index_buffer: geometry.index_buffer.id(),
                index_format: geometry.index_format,
                layout: record.layout,
                triangle_count: record.tri_count as u32,
                output_triangle_start: record.tri_offset as u32,
                positions: arena.positions.id(),
                attributes: arena.attributes.id(),
            })
        })
        .collect()
}

/// Dispatch extraction for every mesh. Completion is observed through the
/// readback, not here.
#[tracing::instrument(skip_all, fields(meshes = set.len()))]
pub fn pack(device: &Arc<dyn GpuDevice>, set: &MeshSet, arena: &VertexArena) -> Result<usize> {
    let jobs = extraction_jobs(set, arena)?;
    for job in &jobs {
        device.dispatch_extraction(job)?;
    }
    Ok(jobs.len())
}
