//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use bvh_scene::engine::{BlasGeometryView, TlasView};
use bvh_scene::pipeline::FrameOutcome;
use bvh_scene::prelude::*;
use bvh_scene::scene::shapes;
use bvh_scene::util::{Mat4, Vec3, Vec4};

/// [`CpuEngine`] with controllable readiness and injected failures.
///
/// BLAS built over a held triangle count report not-ready until released.
/// Builds over a refused triangle count fail outright. BLAS over a broken
/// triangle count build fine but refuse to lend their geometry.
#[derive(Default)]
pub struct ScriptedEngine {
    pub inner: CpuEngine,
    held_counts: Mutex<HashSet<usize>>,
    handle_counts: Mutex<HashMap<u32, usize>>,
    refused_counts: Mutex<HashSet<usize>>,
    broken_counts: Mutex<HashSet<usize>>,
    fail_tlas: AtomicBool,
    fail_tlas_fetch: AtomicBool,
    pub blas_builds: AtomicUsize,
    pub tlas_builds: AtomicUsize,
    pub blas_destroyed: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keep BLAS over `tri_count` triangles not-ready.
    pub fn hold(&self, tri_count: usize) {
        self.held_counts.lock().insert(tri_count);
    }

    pub fn release(&self, tri_count: usize) {
        self.held_counts.lock().remove(&tri_count);
    }

    /// Refuse every build over `tri_count` triangles.
    pub fn refuse(&self, tri_count: usize) {
        self.refused_counts.lock().insert(tri_count);
    }

    pub fn fail_tlas(&self, fail: bool) {
        self.fail_tlas.store(fail, Ordering::SeqCst);
    }

    /// Fail geometry fetches of BLAS over `tri_count` triangles.
    pub fn break_geometry(&self, tri_count: usize) {
        self.broken_counts.lock().insert(tri_count);
    }

    pub fn restore_geometry(&self, tri_count: usize) {
        self.broken_counts.lock().remove(&tri_count);
    }

    /// Build the TLAS but fail to lend it.
    pub fn fail_tlas_fetch(&self, fail: bool) {
        self.fail_tlas_fetch.store(fail, Ordering::SeqCst);
    }

    fn is_broken(&self, handle: BlasHandle) -> bool {
        self.handle_counts
            .lock()
            .get(&handle.0)
            .is_some_and(|count| self.broken_counts.lock().contains(count))
    }

    pub fn tlas_builds(&self) -> usize {
        self.tlas_builds.load(Ordering::SeqCst)
    }

    pub fn live_blas(&self) -> usize {
        self.inner.live_blas_count()
    }
}

impl AccelerationEngine for ScriptedEngine {
    fn build_blas(&self, vertices: &[Vec4], tri_offset: usize, tri_count: usize, compressed: bool) -> Result<BlasHandle> {
        self.blas_builds.fetch_add(1, Ordering::SeqCst);
        if self.refused_counts.lock().contains(&tri_count) {
            return Err(Error::BlasBuildFailed(format!("scripted refusal of {tri_count} triangles")));
        }
        let handle = self.inner.build_blas(vertices, tri_offset, tri_count, compressed)?;
        self.handle_counts.lock().insert(handle.0, tri_count);
        Ok(handle)
    }

    fn is_ready(&self, handle: BlasHandle) -> bool {
        let held = self
            .handle_counts
            .lock()
            .get(&handle.0)
            .is_some_and(|count| self.held_counts.lock().contains(count));
        !held && self.inner.is_ready(handle)
    }

    fn blas_node_bytes(&self, handle: BlasHandle) -> usize {
        self.inner.blas_node_bytes(handle)
    }

    fn blas_tri_bytes(&self, handle: BlasHandle) -> usize {
        self.inner.blas_tri_bytes(handle)
    }

    fn read_blas_geometry(&self, handle: BlasHandle, visit: &mut dyn FnMut(BlasGeometryView<'_>)) -> Result<()> {
        if self.is_broken(handle) {
            return Err(Error::GeometryFetch(format!("scripted fetch failure of {handle}")));
        }
        self.inner.read_blas_geometry(handle, visit)
    }

    fn update_transform(&self, handle: BlasHandle, local_to_world: &Mat4) {
        self.inner.update_transform(handle, local_to_world)
    }

    fn destroy_blas(&self, handle: BlasHandle) {
        self.blas_destroyed.fetch_add(1, Ordering::SeqCst);
        self.handle_counts.lock().remove(&handle.0);
        self.inner.destroy_blas(handle)
    }

    fn build_tlas(&self, instances: &[BlasHandle]) -> Result<()> {
        self.tlas_builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_tlas.load(Ordering::SeqCst) {
            return Err(Error::TlasBuildFailed("scripted failure".into()));
        }
        self.inner.build_tlas(instances)
    }

    fn destroy_tlas(&self) {
        self.inner.destroy_tlas()
    }

    fn tlas_node_bytes(&self) -> usize {
        self.inner.tlas_node_bytes()
    }

    fn tlas_index_bytes(&self) -> usize {
        self.inner.tlas_index_bytes()
    }

    fn read_tlas(&self, visit: &mut dyn FnMut(TlasView<'_>)) -> Result<()> {
        if self.fail_tlas_fetch.load(Ordering::SeqCst) {
            return Err(Error::TlasFetch);
        }
        self.inner.read_tlas(visit)
    }

    fn intersect_tlas(&self, origin: Vec3, direction: Vec3) -> Intersection {
        self.inner.intersect_tlas(origin, direction)
    }

    fn intersect_blas(&self, handle: BlasHandle, origin: Vec3, direction: Vec3) -> Intersection {
        self.inner.intersect_blas(handle, origin, direction)
    }
}

/// Device, engine and scene wired together.
pub struct Harness {
    pub host: Arc<HostDevice>,
    pub device: Arc<dyn GpuDevice>,
    pub engine: Arc<ScriptedEngine>,
    pub scene: BvhScene,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let host = Arc::new(HostDevice::new());
        let device: Arc<dyn GpuDevice> = host.clone();
        let engine = ScriptedEngine::new();
        let scene = BvhScene::new(Arc::clone(&device), engine.clone(), config).unwrap();
        Self {
            host,
            device,
            engine,
            scene,
        }
    }

    /// Triangle-row mesh of `count` triangles at `position`.
    pub fn row(&self, name: &str, count: usize, position: Vec3) -> Arc<SceneNode> {
        let geometry = shapes::triangle_row(&self.device, count, IndexFormat::U32).unwrap();
        Arc::new(SceneNode::new(name, Some(geometry), Mat4::from_translation(position)))
    }

    pub fn cube(&self, name: &str) -> Arc<SceneNode> {
        let geometry = shapes::cube(&self.device, 1.0, IndexFormat::U16).unwrap();
        Arc::new(SceneNode::new(name, Some(geometry), Mat4::IDENTITY))
    }

    /// Tick until `done` holds, failing after a generous frame budget.
    pub fn run_until(&mut self, mut done: impl FnMut(&FrameOutcome, &BvhScene) -> bool) -> FrameOutcome {
        for _ in 0..2000 {
            let outcome = self.scene.update().unwrap();
            if done(&outcome, &self.scene) {
                return outcome;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached, status: {:?}", self.scene.status());
    }

    pub fn run_until_renderable(&mut self) -> FrameOutcome {
        self.run_until(|outcome, _| outcome.can_render)
    }

    /// Tick a fixed number of frames.
    pub fn run_frames(&mut self, frames: usize) -> FrameOutcome {
        let mut last = None;
        for _ in 0..frames {
            last = Some(self.scene.update().unwrap());
            std::thread::sleep(Duration::from_millis(1));
        }
        last.unwrap()
    }
}

pub fn renderables(nodes: &[Arc<SceneNode>]) -> Vec<Arc<dyn Renderable>> {
    nodes.iter().map(|n| n.clone() as Arc<dyn Renderable>).collect()
}
