//! Host scene model: renderable objects, their GPU geometry and transforms.
//!
//! The pipeline never owns scene objects. It enumerates [`Renderable`]s handed
//! in by the host, reads their [`MeshGeometry`] once per processing pass and
//! their transform once per frame.

mod layout;
pub mod motion;
pub mod shapes;

use std::fmt;

use parking_lot::RwLock;

use crate::gpu::GpuBuffer;
use crate::util::Mat4;

pub use layout::*;
pub use motion::DemoMotion;

/// GPU-resident source geometry of one mesh.
pub struct MeshGeometry {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub layout: VertexLayout,
    pub index_format: IndexFormat,
    /// Index count of each submesh, drawn back to back from the index buffer.
    pub submesh_index_counts: Vec<u32>,
}

impl MeshGeometry {
    /// Total number of triangles over all submeshes.
    pub fn triangle_count(&self) -> usize {
        self.submesh_index_counts.iter().map(|&c| c as usize / 3).sum()
    }
}

impl fmt::Debug for MeshGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshGeometry")
            .field("vertex_buffer", &self.vertex_buffer.id())
            .field("index_buffer", &self.index_buffer.id())
            .field("index_format", &self.index_format)
            .field("triangles", &self.triangle_count())
            .finish()
    }
}

/// An object the host renderer wants ray traced.
pub trait Renderable: Send + Sync {
    fn name(&self) -> &str;

    /// Source geometry, or `None` if the object has no mesh attached.
    fn geometry(&self) -> Option<&MeshGeometry>;

    /// Current object-to-world transform.
    fn local_to_world(&self) -> Mat4;
}

/// Basic [`Renderable`] with a transform settable from the frame loop.
pub struct SceneNode {
    name: String,
    geometry: Option<MeshGeometry>,
    transform: RwLock<Mat4>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>, geometry: Option<MeshGeometry>, transform: Mat4) -> Self {
        Self {
            name: name.into(),
            geometry,
            transform: RwLock::new(transform),
        }
    }

    pub fn set_transform(&self, transform: Mat4) {
        *self.transform.write() = transform;
    }
}

impl Renderable for SceneNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> Option<&MeshGeometry> {
        self.geometry.as_ref()
    }

    fn local_to_world(&self) -> Mat4 {
        *self.transform.read()
    }
}

impl fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneNode")
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .finish()
    }
}
