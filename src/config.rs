//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "BVH_SCENE_CONFIG";

/// Tunables for [`BvhScene`](crate::BvhScene), persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Request GPU-traversable (compressed) BLAS from the engine.
    pub compressed_blas: bool,
    /// Worker threads of the build pool.
    pub build_threads: usize,
    /// Extraction dispatch granularity (invocations per workgroup).
    pub workgroup_size: u32,
    /// Frames a pass may wait for BLAS readiness before a stall is reported.
    pub stall_warning_frames: u32,
    /// Default `tracing` filter for the command-line tool.
    pub log_filter: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compressed_blas: true,
            build_threads: 1,
            workgroup_size: 64,
            stall_warning_frames: 600,
            log_filter: "info".into(),
        }
    }
}

impl PipelineConfig {
    /// Default location: `$BVH_SCENE_CONFIG`, else `<config dir>/bvh-scene/config.json`.
    pub fn path() -> Option<PathBuf> {
        if let Some(p) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(p));
        }
        dirs::config_dir().map(|mut p| {
            p.push("bvh-scene");
            p.push("config.json");
            p
        })
    }

    /// Load from the default location, falling back to defaults on any error.
    pub fn load() -> Self {
        let config = Self::path()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| serde_json::from_str::<Self>(&s).ok())
            .unwrap_or_default();
        config.sanitized()
    }

    /// Load from `path`. Missing or malformed files are errors.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.build_threads == 0 {
            return Err(Error::Config("build_threads must be at least 1".into()));
        }
        if !(1..=256).contains(&self.workgroup_size) {
            return Err(Error::Config(format!(
                "workgroup_size {} outside 1..=256",
                self.workgroup_size
            )));
        }
        if self.stall_warning_frames == 0 {
            return Err(Error::Config("stall_warning_frames must be at least 1".into()));
        }
        Ok(())
    }

    /// Clamp out-of-range values instead of rejecting them.
    pub fn sanitized(mut self) -> Self {
        self.build_threads = self.build_threads.max(1);
        self.workgroup_size = self.workgroup_size.clamp(1, 256);
        self.stall_warning_frames = self.stall_warning_frames.max(1);
        if self.log_filter.trim().is_empty() {
            self.log_filter = "info".into();
        }
        self
    }
}
