//! Inference backends and the selection policy between them.
//!
//! Each implementation exposes a side-effect free `is_available()` probe;
//! [`select_backend`] walks [`BackendKind::PREFERENCE`] in `auto` mode and
//! initializes the first one that works.

mod classical;
mod ncnn;
mod onnx;

pub use classical::ClassicalBackend;
pub use ncnn::{NcnnBackend, NCNN_BINARY};
pub use onnx::{ExecutionTarget, OnnxBackend};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::UpscaleError;
use crate::process::run_checked;
use crate::resize::ResizeFilter;
use crate::runtime::{binary_available, command_for};
use crate::tiling::auto_tile_size;
use crate::types::RgbImage;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub available_mb: u64,
    pub device_name: String,
}

pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Load models and acquire devices. Called once before the first `upscale`.
    fn initialize(&mut self) -> Result<()>;

    /// Upscale one tile or frame by [`Backend::scale`].
    fn upscale(&mut self, image: &RgbImage) -> Result<RgbImage>;

    fn memory_info(&self) -> MemoryInfo;

    /// Native scale factor of the loaded model.
    fn scale(&self) -> u32;

    /// Tile edge to use when none is configured. `0` disables tiling.
    fn preferred_tile_size(&self, available_mb: u64) -> usize {
        auto_tile_size(available_mb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ncnn,
    Onnx,
    Classical,
}

impl BackendKind {
    pub const PREFERENCE: [BackendKind; 3] = [Self::Ncnn, Self::Onnx, Self::Classical];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ncnn => "ncnn",
            Self::Onnx => "onnx",
            Self::Classical => "classical",
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            Self::Ncnn => NcnnBackend::is_available(),
            Self::Onnx => OnnxBackend::is_available(),
            Self::Classical => ClassicalBackend::is_available(),
        }
    }

    fn create(self, options: &BackendOptions) -> Box<dyn Backend> {
        match self {
            Self::Ncnn => Box::new(NcnnBackend::new(options.clone())),
            Self::Onnx => Box::new(OnnxBackend::new(options.clone())),
            Self::Classical => Box::new(ClassicalBackend::new(options.scale, options.resize_filter)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ncnn" | "vulkan" => Ok(Self::Ncnn),
            "onnx" | "ort" => Ok(Self::Onnx),
            "classical" | "bilinear" | "basic" => Ok(Self::Classical),
            other => bail!("Unknown backend: {other} (expected auto, ncnn, onnx or classical)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPreference {
    #[default]
    Auto,
    Only(BackendKind),
}

impl FromStr for BackendPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            s.parse().map(Self::Only)
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Only(kind) => kind.fmt(f),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Catalog name or a path to a model file.
    pub model: String,
    /// Requested output scale; also the classical backend's factor.
    pub scale: u32,
    /// Explicit tile size handed to engines that tile internally. `0` = engine default.
    pub tile: usize,
    pub fp16: bool,
    pub execution: ExecutionTarget,
    pub models_dir: PathBuf,
    pub trt_cache_dir: Option<PathBuf>,
    pub resize_filter: ResizeFilter,
    pub ncnn_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            model: "realesr-general-x4v3".to_string(),
            scale: 4,
            tile: 0,
            fp16: false,
            execution: ExecutionTarget::default(),
            models_dir: PathBuf::from("models"),
            trt_cache_dir: None,
            resize_filter: ResizeFilter::Bilinear,
            ncnn_timeout: Duration::from_secs(300),
        }
    }
}

/// Create and initialize a backend according to `preference`.
///
/// `Auto` falls through unavailable or failing backends in preference order.
/// An explicitly requested backend that is unavailable is an error.
pub fn select_backend(
    preference: BackendPreference,
    options: &BackendOptions,
) -> Result<Box<dyn Backend>> {
    match preference {
        BackendPreference::Only(kind) => {
            if !kind.is_available() {
                return Err(UpscaleError::BackendUnavailable(kind.to_string()).into());
            }
            let mut backend = kind.create(options);
            backend.initialize()?;
            info!(backend = kind.as_str(), scale = backend.scale(), "Using requested backend");
            Ok(backend)
        }
        BackendPreference::Auto => {
            for kind in BackendKind::PREFERENCE {
                if !kind.is_available() {
                    debug!(backend = kind.as_str(), "Backend not available, skipping");
                    continue;
                }
                let mut backend = kind.create(options);
                match backend.initialize() {
                    Ok(()) => {
                        if kind == BackendKind::Classical {
                            warn!("No learned backend available, using classical interpolation");
                        } else {
                            info!(backend = kind.as_str(), scale = backend.scale(), "Selected backend");
                        }
                        return Ok(backend);
                    }
                    Err(e) => {
                        warn!(backend = kind.as_str(), "Backend failed to initialize, trying next: {e:#}");
                    }
                }
            }
            bail!("no usable backend found")
        }
    }
}

/// Free memory and name of the first NVIDIA GPU, via `nvidia-smi`.
pub fn query_gpu_memory() -> Option<MemoryInfo> {
    if !binary_available("nvidia-smi") {
        return None;
    }
    let mut cmd = command_for("nvidia-smi");
    cmd.args([
        "--query-gpu=memory.free,name",
        "--format=csv,noheader,nounits",
    ]);
    let output = run_checked(cmd, "nvidia-smi", Duration::from_secs(10)).ok()?;
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Option<MemoryInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let (free, name) = line.split_once(',')?;
    Some(MemoryInfo {
        available_mb: free.trim().parse().ok()?,
        device_name: name.trim().to_string(),
    })
}
