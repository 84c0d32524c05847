//! Two-level BVH orchestration.
//!
//! Stages, in the order a processing pass runs through them:
//! - [`collector`] - enumerate meshes and partition the shared arena
//! - [`packing`] - extract object-space vertices into the arena on the GPU
//! - [`readback`] - copy the arena to the host and start builds on delivery
//! - [`scheduler`] - background BLAS builds on a worker pool
//! - [`composer`] - per-frame pool packing, instance table and TLAS
//! - [`gate`] - renderability check over the composed buffers
//!
//! [`BvhScene`] drives all of them.

pub mod collector;
pub mod composer;
pub mod gate;
pub mod packing;
pub mod readback;
pub mod record;
pub mod scheduler;
mod scene;

pub use collector::VertexArena;
pub use composer::{ComposeOutcome, ComposedLayout, GpuBufferComposer};
pub use gate::RenderBindings;
pub use record::{BuildSlot, BuildState, MeshRecord, MeshSet};
pub use scene::{BvhScene, FrameOutcome, PassSummary, PipelineStatus};
pub use scheduler::{BuildReport, BuildScheduler, BuildTask};
