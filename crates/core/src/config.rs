use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendOptions, BackendPreference, ExecutionTarget};
use crate::ffmpeg::EncodeOptions;
use crate::logging::DEFAULT_LOG_RETENTION_FILES;
use crate::pipeline::PipelineOptions;
use crate::tiling::{DEFAULT_TILE_OVERLAP, MIN_TILE_SIZE};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPSCALER_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub processing: ProcessingConfig,
    pub ffmpeg: FfmpegConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessingConfig {
    /// `auto`, `ncnn`, `onnx` or `classical`.
    pub backend: String,
    pub model: String,
    pub scale: u32,
    /// `0` lets the backend pick from available memory.
    pub tile: usize,
    pub tile_overlap: usize,
    pub min_tile: usize,
    pub preserve_tone: bool,
    pub copy_audio: bool,
    pub fp16: bool,
    /// ONNX execution provider: `cuda`, `tensorrt` or `cpu`.
    pub execution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FfmpegConfig {
    pub video_codec: String,
    pub crf: u32,
    pub preset: String,
    pub demux_timeout_secs: u64,
    pub remux_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        let backend = BackendOptions::default();
        Self {
            backend: "auto".to_string(),
            model: backend.model,
            scale: backend.scale,
            tile: 0,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            min_tile: MIN_TILE_SIZE,
            preserve_tone: true,
            copy_audio: true,
            fp16: false,
            execution: ExecutionTarget::default().to_string(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        let encode = EncodeOptions::default();
        Self {
            video_codec: encode.video_codec,
            crf: encode.crf,
            preset: encode.preset,
            demux_timeout_secs: 3600,
            remux_timeout_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn backend_preference(&self) -> Result<BackendPreference> {
        self.processing
            .backend
            .parse()
            .with_context(|| format!("invalid [processing] backend: {}", self.processing.backend))
    }

    /// Backend settings with relative paths anchored at `data_dir`.
    pub fn backend_options(&self, data_dir: &Path) -> BackendOptions {
        let processing = &self.processing;
        BackendOptions {
            model: processing.model.clone(),
            scale: processing.scale,
            tile: processing.tile,
            fp16: processing.fp16,
            execution: ExecutionTarget::from_str_lossy(&processing.execution),
            models_dir: resolve_relative_to(data_dir, &self.paths.models_dir),
            trt_cache_dir: Some(resolve_relative_to(data_dir, &self.paths.trt_cache_dir)),
            ..BackendOptions::default()
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        let processing = &self.processing;
        PipelineOptions {
            scale: processing.scale,
            tile: processing.tile,
            tile_overlap: processing.tile_overlap,
            min_tile: processing.min_tile,
            preserve_tone: processing.preserve_tone,
            encode: EncodeOptions {
                video_codec: self.ffmpeg.video_codec.clone(),
                crf: self.ffmpeg.crf,
                preset: self.ffmpeg.preset.clone(),
                copy_audio: processing.copy_audio,
            },
            demux_timeout: Duration::from_secs(self.ffmpeg.demux_timeout_secs),
            remux_timeout: Duration::from_secs(self.ffmpeg.remux_timeout_secs),
            ..PipelineOptions::default()
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. UPSCALER_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
