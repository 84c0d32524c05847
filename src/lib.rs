//! # bvh-scene
//!
//! Two-level bounding volume hierarchy orchestration for ray tracing a
//! dynamic set of meshes.
//!
//! Each processing pass packs every mesh's vertices into one shared arena on
//! the GPU, reads the arena back asynchronously and builds one bottom-level
//! BVH (BLAS) per mesh on a worker pool. Every frame, once all BLAS are
//! ready, the compressed BLAS data is packed into shared pools, an instance
//! table is written with the latest transforms and the top-level BVH (TLAS)
//! is rebuilt and uploaded.
//!
//! ## Modules
//!
//! - [`util`] - Errors, bounding boxes, rays, math re-exports
//! - [`gpu`] - Device boundary, buffer layouts, host and wgpu backends
//! - [`scene`] - Renderable objects, vertex layouts, demo shapes and motion
//! - [`engine`] - Acceleration engine boundary and the CPU engine
//! - [`pipeline`] - Collection, packing, readback, builds, composition, gate
//! - [`config`] - Persisted pipeline settings
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bvh_scene::prelude::*;
//!
//! let device: Arc<dyn GpuDevice> = Arc::new(HostDevice::new());
//! let engine: Arc<dyn AccelerationEngine> = Arc::new(CpuEngine::new());
//! let mut scene = BvhScene::new(device, engine, PipelineConfig::load())?;
//!
//! scene.process_meshes(&objects)?;
//! loop {
//!     scene.update()?;
//!     if let Some(bindings) = scene.bindings() {
//!         // bind and trace
//!     }
//! }
//! ```

pub mod config;
pub mod engine;
pub mod gpu;
pub mod pipeline;
pub mod scene;
pub mod util;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use pipeline::BvhScene;
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::engine::{AccelerationEngine, BlasHandle, CpuEngine, Intersection};
    pub use crate::gpu::{GpuBuffer, GpuDevice, HostDevice};
    pub use crate::pipeline::{BvhScene, ComposeOutcome, FrameOutcome, PipelineStatus, RenderBindings};
    pub use crate::scene::{IndexFormat, MeshGeometry, Renderable, SceneNode};
    pub use crate::util::{Error, Result};
}
