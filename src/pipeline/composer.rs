//! Per-frame buffer composition.
//!
//! Once every mesh of the active pass has a ready BLAS, each frame:
//! 1. sizes every BLAS and assigns prefix-sum offsets into the shared pools
//! 2. copies the compressed geometry into the pools
//! 3. sizes the pools and the instance table exactly, recreating on mismatch
//! 4. pushes each mesh's current transform to its BLAS
//! 5. rebuilds the TLAS and uploads it
//!
//! Nothing is written if any mesh is not ready. Everything is recomputed from
//! scratch each frame.

use std::sync::Arc;

use tracing::{error, warn};

use super::record::MeshSet;
use crate::engine::{AccelerationEngine, BlasHandle};
use crate::gpu::{
    prepare_buffer, BlasInstance, GpuBuffer, GpuDevice, BLAS_INSTANCE_STRIDE, BLAS_NODE_STRIDE, BLAS_TRI_STRIDE,
    TLAS_INDEX_STRIDE, TLAS_NODE_STRIDE,
};
use crate::util::{Error, Result};

/// Result of one composition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeOutcome {
    /// `waiting` meshes are not ready; nothing was composed.
    NotReady { waiting: usize },
    /// All buffers were refreshed and the TLAS rebuilt.
    Composed,
    /// A ready BLAS did not yield its geometry; frame skipped.
    GeometryFetchFailed,
    /// TLAS build or fetch failed; TLAS buffers released.
    TlasFailed,
}

/// Element counts of the last successful composition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComposedLayout {
    pub blas_nodes: usize,
    pub blas_triangles: usize,
    pub instances: usize,
    pub tlas_nodes: usize,
    pub tlas_indices: usize,
}

/// Per-mesh pool sizes in elements.
#[derive(Clone, Copy, Debug)]
struct BlasExtent {
    handle: BlasHandle,
    nodes: usize,
    triangles: usize,
}

/// Owner of the shared pools, the instance table and the TLAS buffers.
#[derive(Default)]
pub struct GpuBufferComposer {
    pub(crate) blas_nodes: Option<GpuBuffer>,
    pub(crate) blas_triangles: Option<GpuBuffer>,
    pub(crate) instance_table: Option<GpuBuffer>,
    pub(crate) tlas_nodes: Option<GpuBuffer>,
    pub(crate) tlas_indices: Option<GpuBuffer>,
    instances: Vec<BlasInstance>,
    layout: ComposedLayout,
    /// Pass the buffers were last fully composed for.
    composed_pass: Option<u64>,
    node_staging: Vec<u8>,
    tri_staging: Vec<u8>,
    tlas_builds: usize,
}

impl GpuBufferComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance table of the last composition.
    pub fn instances(&self) -> &[BlasInstance] {
        &self.instances
    }

    pub fn layout(&self) -> ComposedLayout {
        self.layout
    }

    /// Pass whose geometry, instances and TLAS all sit in the buffers.
    ///
    /// `None` while the buffers are empty or hold a partial composition.
    pub fn composed_pass(&self) -> Option<u64> {
        self.composed_pass
    }

    /// Successful TLAS builds so far.
    pub fn tlas_builds(&self) -> usize {
        self.tlas_builds
    }

    /// Release every buffer and forget the last composition.
    pub fn reset(&mut self) {
        *self = Self {
            tlas_builds: self.tlas_builds,
            ..Self::default()
        };
    }

    fn release_tlas(&mut self, engine: &dyn AccelerationEngine) {
        self.tlas_nodes = None;
        self.tlas_indices = None;
        self.layout.tlas_nodes = 0;
        self.layout.tlas_indices = 0;
        engine.destroy_tlas();
    }

    /// Run one frame of composition for the meshes of `pass`.
    ///
    /// The buffers are left untouched unless every BLAS is ready and yields
    /// its geometry.
    pub fn compose(
        &mut self,
        device: &Arc<dyn GpuDevice>,
        engine: &dyn AccelerationEngine,
        pass: u64,
        set: &MeshSet,
    ) -> Result<ComposeOutcome> {
        // 1. Readiness gate: all or nothing
        let mut extents = Vec::with_capacity(set.len());
        let mut waiting = 0;
        for (_, slot) in set.iter() {
            match slot.handle() {
                Some(handle) if engine.is_ready(handle) => extents.push(BlasExtent {
                    handle,
                    nodes: engine.blas_node_bytes(handle) / BLAS_NODE_STRIDE,
                    triangles: engine.blas_tri_bytes(handle) / BLAS_TRI_STRIDE,
                }),
                _ => waiting += 1,
            }
        }
        if waiting > 0 || set.is_empty() {
            return Ok(ComposeOutcome::NotReady { waiting });
        }

        // 2. Prefix sums and geometry copy
        self.node_staging.clear();
        self.tri_staging.clear();
        let mut instances = Vec::with_capacity(set.len());
        let (mut node_offset, mut tri_offset) = (0usize, 0usize);

        for ((record, _), extent) in set.iter().zip(&extents) {
            let node_bytes = extent.nodes * BLAS_NODE_STRIDE;
            let tri_bytes = extent.triangles * BLAS_TRI_STRIDE;
            let (nodes, tris) = (&mut self.node_staging, &mut self.tri_staging);
            let fetched = engine.read_blas_geometry(extent.handle, &mut |view| {
                if view.nodes.len() >= node_bytes && view.triangles.len() >= tri_bytes {
                    nodes.extend_from_slice(&view.nodes[..node_bytes]);
                    tris.extend_from_slice(&view.triangles[..tri_bytes]);
                }
            });
            let copied = nodes.len() == (node_offset + extent.nodes) * BLAS_NODE_STRIDE
                && tris.len() == (tri_offset + extent.triangles) * BLAS_TRI_STRIDE;
            if extent.nodes == 0 || fetched.is_err() || !copied {
                let e = fetched.err().unwrap_or_else(|| Error::GeometryFetch(record.name.clone()));
                warn!(mesh = %record.name, "skipping frame: {e}");
                return Ok(ComposeOutcome::GeometryFetchFailed);
            }

            instances.push(BlasInstance::new(
                &record.source.local_to_world(),
                node_offset as u32,
                tri_offset as u32,
                record.tri_offset as u32,
            ));
            node_offset += extent.nodes;
            tri_offset += extent.triangles;
        }

        // 3. Exact-size pools and instance table
        self.composed_pass = None;
        prepare_buffer(device, &mut self.blas_nodes, "blas_node_pool", node_offset, BLAS_NODE_STRIDE)?;
        prepare_buffer(device, &mut self.blas_triangles, "blas_tri_pool", tri_offset, BLAS_TRI_STRIDE)?;
        prepare_buffer(device, &mut self.instance_table, "blas_instances", instances.len(), BLAS_INSTANCE_STRIDE)?;
        if let (Some(nodes), Some(tris), Some(table)) =
            (&self.blas_nodes, &self.blas_triangles, &self.instance_table)
        {
            nodes.write(0, &self.node_staging)?;
            tris.write(0, &self.tri_staging)?;
            table.write(0, bytemuck::cast_slice(&instances))?;
        }
        self.layout.blas_nodes = node_offset;
        self.layout.blas_triangles = tri_offset;
        self.layout.instances = instances.len();
        self.instances = instances;

        // 4. Latest placement for BLAS queries
        for ((record, _), extent) in set.iter().zip(&extents) {
            engine.update_transform(extent.handle, &record.source.local_to_world());
        }

        // 5. TLAS
        let handles: Vec<BlasHandle> = extents.iter().map(|e| e.handle).collect();
        if let Err(e) = engine.build_tlas(&handles) {
            error!("{e}");
            self.release_tlas(engine);
            return Ok(ComposeOutcome::TlasFailed);
        }
        self.tlas_builds += 1;

        let node_count = engine.tlas_node_bytes() / TLAS_NODE_STRIDE;
        let index_count = engine.tlas_index_bytes() / TLAS_INDEX_STRIDE;
        let mut node_bytes = Vec::new();
        let mut index_bytes = Vec::new();
        let fetched = engine.read_tlas(&mut |view| {
            node_bytes.extend_from_slice(view.nodes);
            index_bytes.extend_from_slice(view.indices);
        });
        if fetched.is_err()
            || node_count == 0
            || node_bytes.len() != node_count * TLAS_NODE_STRIDE
            || index_bytes.len() != index_count * TLAS_INDEX_STRIDE
        {
            error!("{}", fetched.err().unwrap_or(Error::TlasFetch));
            self.release_tlas(engine);
            return Ok(ComposeOutcome::TlasFailed);
        }

        prepare_buffer(device, &mut self.tlas_nodes, "tlas_nodes", node_count, TLAS_NODE_STRIDE)?;
        prepare_buffer(device, &mut self.tlas_indices, "tlas_indices", index_count, TLAS_INDEX_STRIDE)?;
        if let (Some(nodes), Some(indices)) = (&self.tlas_nodes, &self.tlas_indices) {
            nodes.write(0, &node_bytes)?;
            indices.write(0, &index_bytes)?;
        }
        self.layout.tlas_nodes = node_count;
        self.layout.tlas_indices = index_count;
        self.composed_pass = Some(pass);

        Ok(ComposeOutcome::Composed)
    }
}
