//! Scene orchestration: processing passes and the per-frame tick.
//!
//! A processing pass collects meshes, packs them into a fresh arena and
//! requests its readback. Until every mesh of the new pass has a ready BLAS
//! it stays pending, and the previously active pass keeps being composed
//! and rendered. A fully ready pending pass is composed first and promoted
//! only once that composition succeeds; until then the active pass keeps
//! the buffers and the TLAS. Superseded passes are retired: their
//! build task is cancelled and their BLAS are destroyed only once the task
//! has finished.

use std::sync::Arc;

use tracing::{error, info, info_span, warn};

use super::collector::{self, VertexArena};
use super::composer::{ComposeOutcome, GpuBufferComposer};
use super::gate::{render_bindings, RenderBindings};
use super::packing;
use super::readback::{self, ReadbackTicket};
use super::record::{MeshRecord, MeshSet};
use super::scheduler::{BuildScheduler, BuildTask};
use crate::config::PipelineConfig;
use crate::engine::{AccelerationEngine, BlasHandle, Intersection};
use crate::gpu::{BlasInstance, GpuDevice};
use crate::scene::Renderable;
use crate::util::{Result, Vec3};

/// One processing pass.
struct ScenePass {
    id: u64,
    meshes: MeshSet,
    arena: VertexArena,
    readback: ReadbackTicket,
    task: Option<BuildTask>,
    waiting_frames: u32,
    stall_reported: bool,
}

impl ScenePass {
    /// Stop the build task from starting further builds.
    fn cancel(&self) {
        self.readback.abandon();
        if let Some(task) = &self.task {
            task.cancel();
        }
    }

    /// True once nothing can write this pass's build slots anymore.
    fn is_quiescent(&mut self) -> bool {
        if self.task.is_none() {
            self.task = self.readback.take_task();
        }
        match &mut self.task {
            Some(task) => task.is_finished(),
            None => !self.readback.is_waiting(),
        }
    }
}

/// Summary of a processing pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassSummary {
    /// Pass id, 0 when the scene had no usable meshes.
    pub pass: u64,
    pub meshes: usize,
    pub triangles: usize,
}

/// What happened during one [`BvhScene::update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameOutcome {
    pub frame: u64,
    /// Pass promoted to active this frame.
    pub promoted: Option<u64>,
    /// Pending pass dropped because its readback failed.
    pub readback_failed: Option<u64>,
    /// Composition result for the active pass, if there is one.
    pub compose: Option<ComposeOutcome>,
    /// Failed composition of a fully ready pending pass, which stays pending.
    pub pending_compose: Option<ComposeOutcome>,
    pub can_render: bool,
}

/// Diagnostics snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineStatus {
    pub frame: u64,
    pub active_pass: Option<u64>,
    pub pending_pass: Option<u64>,
    pub retired_passes: usize,
    /// Meshes of the most recently processed pass.
    pub meshes: usize,
    /// Of those, meshes with a ready BLAS.
    pub ready_meshes: usize,
    pub total_triangles: usize,
    pub builds_spawned: usize,
    pub tlas_builds: usize,
    pub can_render: bool,
}

/// Two-level BVH over a dynamic set of renderable meshes.
pub struct BvhScene {
    device: Arc<dyn GpuDevice>,
    engine: Arc<dyn AccelerationEngine>,
    config: PipelineConfig,
    scheduler: Arc<BuildScheduler>,
    composer: GpuBufferComposer,
    active: Option<ScenePass>,
    pending: Option<ScenePass>,
    retired: Vec<ScenePass>,
    next_pass: u64,
    frame: u64,
}

impl BvhScene {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        engine: Arc<dyn AccelerationEngine>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let config = config.sanitized();
        let scheduler = Arc::new(BuildScheduler::new(config.build_threads, config.compressed_blas)?);
        Ok(Self {
            device,
            engine,
            config,
            scheduler,
            composer: GpuBufferComposer::new(),
            active: None,
            pending: None,
            retired: Vec::new(),
            next_pass: 1,
            frame: 0,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start a processing pass over `objects`.
    ///
    /// Collects and packs the meshes and requests the arena readback; the
    /// builds start when the readback completes during a later [`update`].
    /// A pass still pending from an earlier call is superseded. An input with
    /// no usable meshes clears the scene.
    ///
    /// [`update`]: Self::update
    pub fn process_meshes(&mut self, objects: &[Arc<dyn Renderable>]) -> Result<PassSummary> {
        let _span = info_span!("process_meshes", objects = objects.len()).entered();
        let meshes = collector::collect(objects);

        if meshes.is_empty() {
            warn!("no renderable meshes, clearing scene");
            self.retire_pending();
            if let Some(active) = self.active.take() {
                active.cancel();
                self.retired.push(active);
            }
            self.composer.reset();
            self.engine.destroy_tlas();
            self.reap_retired();
            return Ok(PassSummary {
                pass: 0,
                meshes: 0,
                triangles: 0,
            });
        }

        let id = self.next_pass;
        self.next_pass += 1;
        let arena = VertexArena::allocate(&self.device, meshes.total_triangles())?;
        packing::pack(&self.device, &meshes, &arena)?;

        let scheduler = Arc::clone(&self.scheduler);
        let engine = Arc::clone(&self.engine);
        let snapshot = meshes.clone();
        let ticket = readback::request(&self.device, id, &arena.positions, move |vertices| {
            scheduler.spawn(id, engine, snapshot, vertices)
        })?;

        self.retire_pending();
        let summary = PassSummary {
            pass: id,
            meshes: meshes.len(),
            triangles: meshes.total_triangles(),
        };
        info!(
            pass = id,
            meshes = summary.meshes,
            triangles = summary.triangles,
            "scene processed"
        );
        self.pending = Some(ScenePass {
            id,
            meshes,
            arena,
            readback: ticket,
            task: None,
            waiting_frames: 0,
            stall_reported: false,
        });
        Ok(summary)
    }

    fn retire_pending(&mut self) {
        if let Some(pass) = self.pending.take() {
            info!(pass = pass.id, "superseding pending pass");
            pass.cancel();
            self.retired.push(pass);
        }
    }

    /// Per-frame tick. Never blocks.
    pub fn update(&mut self) -> Result<FrameOutcome> {
        self.frame += 1;
        let mut outcome = FrameOutcome {
            frame: self.frame,
            promoted: None,
            readback_failed: None,
            compose: None,
            pending_compose: None,
            can_render: false,
        };

        // Delivers readbacks, which start build tasks
        self.device.poll();

        if let Some(pass) = &mut self.pending {
            if let Some(e) = pass.readback.take_failure() {
                error!(pass = pass.id, "processing pass aborted, keeping previous state: {e}");
                outcome.readback_failed = Some(pass.id);
            } else if let Some(task) = pass.readback.take_task() {
                pass.task = Some(task);
            }
        }
        if outcome.readback_failed.is_some() {
            self.pending = None;
        }

        let composed = self.compose_frame(&mut outcome);
        self.reap_retired();
        composed?;

        outcome.can_render = self.can_render();
        Ok(outcome)
    }

    /// Compose the pending pass if it is ready, else the active pass.
    fn compose_frame(&mut self, outcome: &mut FrameOutcome) -> Result<()> {
        self.advance_pending(outcome)?;
        if outcome.promoted.is_some() {
            return Ok(());
        }
        if let Some(active) = &self.active {
            let result = self
                .composer
                .compose(&self.device, self.engine.as_ref(), active.id, &active.meshes)?;
            outcome.compose = Some(result);
        }
        Ok(())
    }

    /// Promote the pending pass once fully ready and composed, otherwise
    /// track its stall.
    fn advance_pending(&mut self, outcome: &mut FrameOutcome) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let Some(pass) = &mut self.pending else {
            return Ok(());
        };
        if let Some(task) = &mut pass.task {
            task.poll();
        }

        if pass.task.is_some() && pass.meshes.all_ready(engine.as_ref()) {
            let result = self
                .composer
                .compose(&self.device, engine.as_ref(), pass.id, &pass.meshes)?;
            if result != ComposeOutcome::Composed {
                warn!(pass = pass.id, ?result, "ready pass failed to compose, keeping active pass");
                outcome.pending_compose = Some(result);
                return Ok(());
            }
            if let Some(pass) = self.pending.take() {
                info!(pass = pass.id, frames = pass.waiting_frames, "pass ready, promoting");
                outcome.promoted = Some(pass.id);
                outcome.compose = Some(result);
                if let Some(old) = self.active.replace(pass) {
                    old.cancel();
                    self.retired.push(old);
                }
            }
            return Ok(());
        }

        pass.waiting_frames += 1;
        if !pass.stall_reported && pass.waiting_frames >= self.config.stall_warning_frames {
            pass.stall_reported = true;
            let waiting_on: Vec<&str> = if pass.task.is_some() {
                pass.meshes.not_ready(engine.as_ref())
            } else {
                vec!["<arena readback>"]
            };
            warn!(
                pass = pass.id,
                frames = pass.waiting_frames,
                "pass stalled, not ready: {}",
                waiting_on.join(", ")
            );
        }
        Ok(())
    }

    /// Destroy BLAS of retired passes whose build task has finished.
    fn reap_retired(&mut self) {
        let engine = self.engine.as_ref();
        self.retired.retain_mut(|pass| {
            if !pass.is_quiescent() {
                return true;
            }
            let destroyed = pass.meshes.destroy_blas(engine);
            info!(pass = pass.id, destroyed, "retired pass released");
            false
        });
    }

    /// True if the renderer may bind the ray tracing buffers this frame.
    pub fn can_render(&self) -> bool {
        self.bindings().is_some()
    }

    /// Buffers to bind, when [`can_render`](Self::can_render) holds.
    pub fn bindings(&self) -> Option<RenderBindings> {
        let active = self.active.as_ref()?;
        render_bindings(
            &self.composer,
            active.id,
            Some(&active.arena.attributes),
            active.meshes.len(),
            active.meshes.total_triangles(),
        )
    }

    /// Instance table of the last composition.
    pub fn instances(&self) -> &[BlasInstance] {
        self.composer.instances()
    }

    /// Closest hit against the current TLAS.
    ///
    /// `inst` of a hit is the mesh index in the active pass.
    pub fn intersect(&self, origin: Vec3, direction: Vec3) -> Intersection {
        if self.active.is_none() {
            return Intersection::default();
        }
        self.engine.intersect_tlas(origin, direction)
    }

    /// Closest hit against one mesh of the active pass.
    pub fn intersect_mesh(&self, index: usize, origin: Vec3, direction: Vec3) -> Option<Intersection> {
        let handle = self.blas_handle(index)?;
        let mut hit = self.engine.intersect_blas(handle, origin, direction);
        hit.inst = index as u32;
        Some(hit)
    }

    fn blas_handle(&self, index: usize) -> Option<BlasHandle> {
        self.active.as_ref()?.meshes.slots().get(index)?.handle()
    }

    /// Most recently processed pass: pending if there is one, else active.
    fn current(&self) -> Option<&ScenePass> {
        self.pending.as_ref().or(self.active.as_ref())
    }

    /// Mesh `index` of the most recently processed pass.
    pub fn mesh(&self, index: usize) -> Option<&MeshRecord> {
        self.current()?.meshes.records().get(index)
    }

    pub fn mesh_count(&self) -> usize {
        self.current().map_or(0, |p| p.meshes.len())
    }

    pub fn total_triangles(&self) -> usize {
        self.current().map_or(0, |p| p.meshes.total_triangles())
    }

    pub fn status(&self) -> PipelineStatus {
        let current = self.current();
        PipelineStatus {
            frame: self.frame,
            active_pass: self.active.as_ref().map(|p| p.id),
            pending_pass: self.pending.as_ref().map(|p| p.id),
            retired_passes: self.retired.len(),
            meshes: self.mesh_count(),
            ready_meshes: current.map_or(0, |p| {
                p.meshes
                    .slots()
                    .iter()
                    .filter(|s| s.is_ready(self.engine.as_ref()))
                    .count()
            }),
            total_triangles: self.total_triangles(),
            builds_spawned: self.scheduler.spawned(),
            tlas_builds: self.composer.tlas_builds(),
            can_render: self.can_render(),
        }
    }
}

impl Drop for BvhScene {
    fn drop(&mut self) {
        let mut passes: Vec<ScenePass> = self.retired.drain(..).collect();
        passes.extend(self.pending.take());
        passes.extend(self.active.take());
        for pass in &passes {
            pass.cancel();
        }
        // Wait for workers before releasing what they build
        for pass in &mut passes {
            if let Some(mut task) = pass.task.take().or_else(|| pass.readback.take_task()) {
                task.wait();
            }
            pass.meshes.destroy_blas(self.engine.as_ref());
        }
        self.engine.destroy_tlas();
        self.composer.reset();
    }
}
