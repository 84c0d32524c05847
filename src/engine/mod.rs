//! Acceleration engine boundary.
//!
//! The engine owns all BVH memory. The pipeline only sequences calls:
//! build a BLAS per mesh, poll readiness, copy compressed geometry out through
//! a scoped view, push transforms, build the TLAS and copy it out.
//!
//! Geometry is never exposed as a raw pointer. [`AccelerationEngine::read_blas_geometry`]
//! and [`AccelerationEngine::read_tlas`] lend a borrowed view to a visitor for
//! the duration of the call; callers copy what they need before returning.

pub mod cpu;

use std::fmt;

use crate::util::{Mat4, Result, Vec3, Vec4};

pub use cpu::CpuEngine;

/// Opaque BLAS handle issued by an engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlasHandle(pub u32);

impl fmt::Display for BlasHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blas#{}", self.0)
    }
}

/// Compressed BLAS data lent to a visitor.
#[derive(Clone, Copy, Debug)]
pub struct BlasGeometryView<'a> {
    /// 80-byte nodes.
    pub nodes: &'a [u8],
    /// 16-byte vertex records, three per triangle.
    pub triangles: &'a [u8],
}

/// TLAS data lent to a visitor.
#[derive(Clone, Copy, Debug)]
pub struct TlasView<'a> {
    /// 64-byte nodes.
    pub nodes: &'a [u8],
    /// 4-byte instance indices.
    pub indices: &'a [u8],
}

/// Hit distance reported when a ray misses.
pub const MISS_DISTANCE: f32 = 1e30;

/// Result of a single ray query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intersection {
    /// Instance index in the last TLAS build.
    pub inst: u32,
    /// Hit distance along the ray, [`MISS_DISTANCE`] on a miss.
    pub t: f32,
    pub u: f32,
    pub v: f32,
    /// Triangle index within the instance's mesh.
    pub prim: u32,
    /// Engine-specific auxiliary handle (the hit BLAS for [`CpuEngine`]).
    pub aux: u64,
    /// Opaque per-hit payload.
    pub payload: [u8; 56],
}

impl Intersection {
    pub fn is_hit(&self) -> bool {
        self.t < MISS_DISTANCE
    }
}

impl Default for Intersection {
    fn default() -> Self {
        Self {
            inst: 0,
            t: MISS_DISTANCE,
            u: 0.0,
            v: 0.0,
            prim: 0,
            aux: 0,
            payload: [0; 56],
        }
    }
}

/// BVH construction, readiness and query primitives.
///
/// Implementations must be callable from the build worker and the frame loop
/// at the same time.
pub trait AccelerationEngine: Send + Sync {
    /// Build a BLAS over `tri_count` triangles starting at triangle
    /// `tri_offset` of `vertices` (three positions per triangle).
    ///
    /// `compressed` requests the GPU-traversable representation.
    fn build_blas(&self, vertices: &[Vec4], tri_offset: usize, tri_count: usize, compressed: bool)
        -> Result<BlasHandle>;

    /// True once the BLAS has finished building.
    fn is_ready(&self, handle: BlasHandle) -> bool;

    /// Compressed node array size in bytes, 0 if unavailable.
    fn blas_node_bytes(&self, handle: BlasHandle) -> usize;

    /// Compressed triangle array size in bytes, 0 if unavailable.
    fn blas_tri_bytes(&self, handle: BlasHandle) -> usize;

    /// Lend the compressed geometry to `visit`.
    fn read_blas_geometry(&self, handle: BlasHandle, visit: &mut dyn FnMut(BlasGeometryView<'_>)) -> Result<()>;

    /// Set the object-to-world transform used by intersection queries.
    fn update_transform(&self, handle: BlasHandle, local_to_world: &Mat4);

    fn destroy_blas(&self, handle: BlasHandle);

    /// Build the TLAS over one instance per handle, in order.
    fn build_tlas(&self, instances: &[BlasHandle]) -> Result<()>;

    fn destroy_tlas(&self);

    fn tlas_node_bytes(&self) -> usize;

    fn tlas_index_bytes(&self) -> usize;

    /// Lend the TLAS arrays to `visit`.
    fn read_tlas(&self, visit: &mut dyn FnMut(TlasView<'_>)) -> Result<()>;

    /// Closest hit against the whole TLAS.
    fn intersect_tlas(&self, origin: Vec3, direction: Vec3) -> Intersection;

    /// Closest hit against one BLAS placed at its current transform.
    fn intersect_blas(&self, handle: BlasHandle, origin: Vec3, direction: Vec3) -> Intersection;
}
