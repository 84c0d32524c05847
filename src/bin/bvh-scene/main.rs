//! bvh-scene CLI - runs an animated demo scene through the two-level BVH
//! pipeline and reports what each stage did.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bvh_scene::prelude::*;
use bvh_scene::scene::{shapes, DemoMotion};
use bvh_scene::util::Vec3;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const FRAME_DT: f32 = 1.0 / 60.0;
const SPACING: f32 = 4.0;

struct Options {
    frames: u64,
    objects: usize,
    reprocess_at: Option<u64>,
    config: Option<PathBuf>,
    filter: Option<&'static str>,
    realtime: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            frames: 120,
            objects: 4,
            reprocess_at: None,
            config: None,
            filter: None,
            realtime: true,
        }
    }
}

fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut opts = Options::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" | "--verbose" => opts.filter = Some("debug"),
            "-vv" | "--trace" => opts.filter = Some("trace"),
            "-q" | "--quiet" => opts.filter = Some("warn"),
            "--fast" => opts.realtime = false,
            "-f" | "--frames" => opts.frames = value(&mut args, &arg)?,
            "-n" | "--objects" => opts.objects = value(&mut args, &arg)?,
            "-r" | "--reprocess-at" => opts.reprocess_at = Some(value(&mut args, &arg)?),
            "-c" | "--config" => {
                opts.config = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            "-V" | "--version" => {
                println!("bvh-scene {} ({})", env!("CARGO_PKG_VERSION"), env!("BVH_SCENE_BUILD_DATE"));
                return Ok(None);
            }
            "-h" | "--help" | "help" => {
                print_help();
                return Ok(None);
            }
            other => bail!("unknown argument '{other}' (see --help)"),
        }
    }
    Ok(Some(opts))
}

fn value<T: std::str::FromStr>(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<T> {
    let raw = args.next().with_context(|| format!("{flag} needs a value"))?;
    raw.parse()
        .map_err(|_| anyhow::anyhow!("invalid value '{raw}' for {flag}"))
}

fn print_help() {
    println!("bvh-scene - two-level BVH pipeline demo");
    println!();
    println!("USAGE:");
    println!("    bvh-scene [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -f, --frames <N>         Frames to run (default 120)");
    println!("    -n, --objects <N>        Demo objects, cubes and triangle rows (default 4)");
    println!("    -r, --reprocess-at <N>   Re-process the scene at frame N");
    println!("    -c, --config <FILE>      Load settings from FILE");
    println!("        --fast               Do not pace frames at 60 Hz");
    println!("    -v, --verbose            Show debug output");
    println!("    -vv, --trace             Show trace output (very verbose)");
    println!("    -q, --quiet              Only warnings and errors");
    println!("    -V, --version            Print version");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                 Overrides the log filter");
    println!("    BVH_SCENE_CONFIG         Config file used when --config is absent");
    println!("    BVH_SCENE_TRACE=1        Write trace.json (requires --features profiling)");
}

/// Install the fmt subscriber; with `profiling`, also a Chrome trace layer.
#[cfg(feature = "profiling")]
fn init_tracing(filter: EnvFilter) -> Option<tracing_chrome::FlushGuard> {
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    if env::var("BVH_SCENE_TRACE").ok().as_deref() != Some("1") {
        tracing_subscriber::registry().with(filter).with(fmt).init();
        return None;
    }

    let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .file("trace.json")
        .build();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .with(chrome_layer)
        .init();
    Some(guard)
}

#[cfg(not(feature = "profiling"))]
fn init_tracing(filter: EnvFilter) -> Option<()> {
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry().with(filter).with(fmt).init();
    None
}

struct DemoObject {
    node: Arc<SceneNode>,
    motion: DemoMotion,
}

fn build_objects(device: &Arc<dyn GpuDevice>, count: usize) -> anyhow::Result<Vec<DemoObject>> {
    (0..count)
        .map(|i| {
            let x = i as f32 * SPACING;
            let (name, geometry) = if i % 2 == 0 {
                (format!("cube{i}"), shapes::cube(device, 1.0, IndexFormat::U16)?)
            } else {
                (format!("row{i}"), shapes::triangle_row(device, 8 + i, IndexFormat::U32)?)
            };
            let motion = DemoMotion::new(
                vec![Vec3::new(x, 0.0, 0.0), Vec3::new(x, 2.0, 0.0)],
                1.5 + 0.25 * i as f32,
                Vec3::new(0.0, 45.0, 0.0),
            );
            let node = Arc::new(SceneNode::new(name, Some(geometry), motion.transform()));
            Ok(DemoObject { node, motion })
        })
        .collect()
}

fn renderables(objects: &[DemoObject]) -> Vec<Arc<dyn Renderable>> {
    objects
        .iter()
        .map(|o| Arc::clone(&o.node) as Arc<dyn Renderable>)
        .collect()
}

fn main() -> anyhow::Result<()> {
    let Some(opts) = parse_args()? else {
        return Ok(());
    };

    let config = match &opts.config {
        Some(path) => PipelineConfig::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::load(),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(opts.filter.unwrap_or(config.log_filter.as_str())));
    let _trace_guard = init_tracing(filter);

    let device: Arc<dyn GpuDevice> = Arc::new(HostDevice::new());
    let engine: Arc<dyn AccelerationEngine> = Arc::new(CpuEngine::new());
    let mut scene = BvhScene::new(Arc::clone(&device), engine, config)?;

    let mut objects = build_objects(&device, opts.objects)?;
    let summary = scene.process_meshes(&renderables(&objects))?;
    info!(
        pass = summary.pass,
        meshes = summary.meshes,
        triangles = summary.triangles,
        "demo scene ready"
    );

    let start = Instant::now();
    let mut rendered = 0u64;
    let mut first_render = None;
    for frame in 1..=opts.frames {
        let frame_start = Instant::now();
        for object in &mut objects {
            object.node.set_transform(object.motion.advance(FRAME_DT));
        }

        if opts.reprocess_at == Some(frame) {
            // Drop the last object to exercise superseding
            if objects.len() > 1 {
                objects.pop();
            }
            let summary = scene.process_meshes(&renderables(&objects))?;
            info!(pass = summary.pass, meshes = summary.meshes, "scene re-processed");
        }

        let outcome = scene.update()?;
        if let Some(pass) = outcome.readback_failed {
            warn!(pass, "pass dropped after readback failure");
        }
        if let Some(result) = outcome.pending_compose {
            warn!(frame, ?result, "new pass not promoted yet");
        }
        if outcome.can_render {
            rendered += 1;
            first_render.get_or_insert(frame);
        }

        // Probe straight down -Z onto the first object
        if let Some(first) = objects.first() {
            let target = first.node.local_to_world().w_axis.truncate();
            let hit = scene.intersect(target + Vec3::new(0.0, 0.0, 10.0), Vec3::NEG_Z);
            if hit.is_hit() {
                tracing::debug!(frame, inst = hit.inst, prim = hit.prim, t = hit.t, "probe hit");
            } else if outcome.can_render {
                tracing::debug!(frame, "probe missed");
            }
        }

        if opts.realtime {
            let budget = Duration::from_secs_f32(FRAME_DT);
            if let Some(rest) = budget.checked_sub(frame_start.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }

    let status = scene.status();
    println!("frames:          {}", status.frame);
    println!("active pass:     {}", fmt_pass(status.active_pass));
    println!("pending pass:    {}", fmt_pass(status.pending_pass));
    println!("meshes:          {} ({} ready)", status.meshes, status.ready_meshes);
    println!("triangles:       {}", status.total_triangles);
    println!("build tasks:     {}", status.builds_spawned);
    println!("TLAS builds:     {}", status.tlas_builds);
    println!(
        "renderable:      {rendered}/{} frames (first at {})",
        opts.frames,
        first_render.map_or_else(|| "-".to_string(), |f| f.to_string())
    );
    if let Some(bindings) = scene.bindings() {
        tracing::debug!(?bindings, "final bindings");
    }
    println!("elapsed:         {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn fmt_pass(pass: Option<u64>) -> String {
    pass.map_or_else(|| "-".to_string(), |p| format!("#{p}"))
}
