//! Background BLAS builds.
//!
//! One [`BuildTask`] per processing pass runs on the scheduler's rayon pool
//! and requests a BLAS for every mesh, in order. The frame loop never waits
//! on it: it polls the task's channel and each mesh's [`BuildSlot`].
//! Completion of an individual BLAS is observed through the engine's
//! readiness query, not through the task.
//!
//! [`BuildSlot`]: super::record::BuildSlot

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::record::MeshSet;
use crate::engine::AccelerationEngine;
use crate::util::{Error, Result, Vec4};

/// Summary sent by a finished build task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildReport {
    pub pass: u64,
    /// Builds the engine accepted.
    pub requested: usize,
    /// Builds the engine refused.
    pub failed: usize,
    /// True if the task stopped early after being cancelled.
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Runs build tasks on a dedicated thread pool.
pub struct BuildScheduler {
    pool: rayon::ThreadPool,
    compressed: bool,
    spawned: AtomicUsize,
}

impl BuildScheduler {
    pub fn new(threads: usize, compressed: bool) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("bvh-build-{i}"))
            .build()
            .map_err(|e| Error::other(format!("failed to start build pool: {e}")))?;
        Ok(Self {
            pool,
            compressed,
            spawned: AtomicUsize::new(0),
        })
    }

    /// Number of build tasks started so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Start building every mesh of `set` from the host copy of the arena.
    pub fn spawn(
        &self,
        pass: u64,
        engine: Arc<dyn AccelerationEngine>,
        set: MeshSet,
        vertices: Arc<[Vec4]>,
    ) -> BuildTask {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();
        let compressed = self.compressed;
        let flag = Arc::clone(&cancel);

        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.pool.spawn(move || {
            let report = run_builds(pass, engine.as_ref(), &set, &vertices, compressed, &flag);
            // Receiver may be gone if the pass was dropped
            let _ = tx.send(report);
        });

        BuildTask {
            pass,
            cancel,
            rx,
            report: None,
        }
    }
}

fn run_builds(
    pass: u64,
    engine: &dyn AccelerationEngine,
    set: &MeshSet,
    vertices: &[Vec4],
    compressed: bool,
    cancel: &AtomicBool,
) -> BuildReport {
    let _span = tracing::info_span!("build_pass", pass, meshes = set.len()).entered();
    let start = Instant::now();
    let mut report = BuildReport {
        pass,
        requested: 0,
        failed: 0,
        cancelled: false,
        elapsed: Duration::ZERO,
    };

    for (record, slot) in set.iter() {
        if cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
            break;
        }
        match engine.build_blas(vertices, record.tri_offset, record.tri_count, compressed) {
            Ok(handle) => {
                debug!(mesh = %record.name, %handle, "BLAS requested");
                slot.mark_requested(handle);
                report.requested += 1;
            }
            Err(e) => {
                warn!(mesh = %record.name, "BLAS build failed: {e}");
                slot.mark_failed();
                report.failed += 1;
            }
        }
    }

    report.elapsed = start.elapsed();
    info!(
        requested = report.requested,
        failed = report.failed,
        cancelled = report.cancelled,
        "build pass finished in {:.2}ms",
        report.elapsed.as_secs_f64() * 1000.0
    );
    report
}

/// Handle to one in-flight build pass.
///
/// Dropping the task cancels it and waits for the worker to stop, so the
/// memory it reads and the slots it writes outlive every build call.
pub struct BuildTask {
    pass: u64,
    cancel: Arc<AtomicBool>,
    rx: Receiver<BuildReport>,
    report: Option<BuildReport>,
}

impl BuildTask {
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Ask the worker to stop before its next build.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Report of the finished task (non-blocking).
    pub fn poll(&mut self) -> Option<&BuildReport> {
        if self.report.is_none() {
            match self.rx.try_recv() {
                Ok(report) => self.report = Some(report),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    // Worker unwound without reporting
                    self.report = Some(BuildReport {
                        pass: self.pass,
                        requested: 0,
                        failed: 0,
                        cancelled: true,
                        elapsed: Duration::ZERO,
                    });
                }
            }
        }
        self.report.as_ref()
    }

    pub fn is_finished(&mut self) -> bool {
        self.poll().is_some()
    }

    /// Block until the worker has finished.
    pub fn wait(&mut self) -> Option<&BuildReport> {
        if self.report.is_none() {
            self.report = self.rx.recv().ok();
        }
        self.report.as_ref()
    }
}

impl Drop for BuildTask {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use crate::pipeline::record::{BuildState, MeshRecord};
    use crate::gpu::PackedLayout;
    use crate::scene::SceneNode;
    use crate::util::Mat4;

    fn mesh_set(counts: &[usize]) -> MeshSet {
        let node: Arc<dyn crate::scene::Renderable> = Arc::new(SceneNode::new("n", None, Mat4::IDENTITY));
        let layout = PackedLayout {
            stride: 16,
            position_offset: 0,
            normal_offset: None,
            uv_offset: None,
        };
        let mut offset = 0;
        let records = counts
            .iter()
            .enumerate()
            .map(|(i, &tri_count)| {
                let r = MeshRecord {
                    name: format!("mesh{i}"),
                    source: Arc::clone(&node),
                    layout,
                    tri_offset: offset,
                    tri_count,
                };
                offset += tri_count;
                r
            })
            .collect();
        MeshSet::new(records)
    }

    fn arena(triangles: usize) -> Arc<[Vec4]> {
        (0..triangles * 3)
            .map(|i| {
                let t = (i / 3) as f32;
                match i % 3 {
                    0 => Vec4::new(t, 0.0, 0.0, 1.0),
                    1 => Vec4::new(t + 1.0, 0.0, 0.0, 1.0),
                    _ => Vec4::new(t, 1.0, 0.0, 1.0),
                }
            })
            .collect()
    }

    #[test]
    fn test_builds_every_mesh() {
        let scheduler = BuildScheduler::new(1, true).unwrap();
        let engine: Arc<dyn AccelerationEngine> = Arc::new(CpuEngine::new());
        let set = mesh_set(&[10, 20]);

        let mut task = scheduler.spawn(1, Arc::clone(&engine), set.clone(), arena(30));
        let report = *task.wait().unwrap();
        assert_eq!(report.requested, 2);
        assert_eq!(report.failed, 0);
        assert!(!report.cancelled);
        assert_eq!(scheduler.spawned(), 1);

        assert!(set.slots().iter().all(|s| s.state() == BuildState::Requested));
        assert!(set.all_ready(engine.as_ref()));
    }

    #[test]
    fn test_refused_build_marks_slot_failed() {
        let scheduler = BuildScheduler::new(1, true).unwrap();
        let engine: Arc<dyn AccelerationEngine> = Arc::new(CpuEngine::new());
        // Second range runs past the arena
        let set = mesh_set(&[2, 5]);

        let mut task = scheduler.spawn(1, Arc::clone(&engine), set.clone(), arena(4));
        assert_eq!(task.wait().unwrap().failed, 1);
        assert_eq!(set.slots()[1].state(), BuildState::Failed);
        assert!(!set.all_ready(engine.as_ref()));
        assert_eq!(set.not_ready(engine.as_ref()), vec!["mesh1"]);
    }

    #[test]
    fn test_cancel_before_start() {
        let scheduler = BuildScheduler::new(1, true).unwrap();
        let engine: Arc<dyn AccelerationEngine> = Arc::new(CpuEngine::new());
        let set = mesh_set(&[3]);

        // Occupy the single worker so the task cannot start before cancel
        let (gate_tx, gate_rx) = channel::<()>();
        scheduler.pool.spawn(move || {
            let _ = gate_rx.recv();
        });
        let mut task = scheduler.spawn(1, engine, set.clone(), arena(3));
        task.cancel();
        gate_tx.send(()).unwrap();

        let report = *task.wait().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.requested, 0);
        assert_eq!(set.slots()[0].state(), BuildState::Pending);
    }
}
