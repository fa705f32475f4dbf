//! `realesrgan-ncnn-vulkan` driven one PNG at a time through a private temp dir.

use std::path::Path;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info};

use super::{Backend, BackendOptions, MemoryInfo};
use crate::error::{find_upscale_error, UpscaleError};
use crate::imageio::{load_rgb, save_rgb};
use crate::process::run_checked;
use crate::runtime::{binary_available, command_for};
use crate::types::RgbImage;

pub const NCNN_BINARY: &str = "realesrgan-ncnn-vulkan";
const NCNN_TILE: usize = 400;

pub struct NcnnBackend {
    options: BackendOptions,
    work_dir: Option<TempDir>,
}

impl NcnnBackend {
    pub fn new(options: BackendOptions) -> Self {
        Self {
            options,
            work_dir: None,
        }
    }

    pub fn is_available() -> bool {
        binary_available(NCNN_BINARY)
    }

    /// Name passed to `-n`. Paths use their file stem.
    fn model_name(&self) -> String {
        let model = self.options.model.as_str();
        if model.contains('/') || model.contains('\\') || Path::new(model).extension().is_some() {
            if let Some(stem) = Path::new(model).file_stem().and_then(|s| s.to_str()) {
                return stem.to_string();
            }
        }
        model.to_string()
    }

    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            "-n".to_string(),
            self.model_name(),
            "-s".to_string(),
            self.options.scale.to_string(),
        ];
        if self.options.tile > 0 {
            args.extend(["-t".to_string(), self.options.tile.to_string()]);
        }
        args
    }
}

impl Backend for NcnnBackend {
    fn name(&self) -> &'static str {
        "ncnn"
    }

    fn initialize(&mut self) -> Result<()> {
        if !Self::is_available() {
            return Err(UpscaleError::BackendUnavailable(NCNN_BINARY.to_string()).into());
        }
        let dir = tempfile::Builder::new()
            .prefix("upscaler_ncnn_")
            .tempdir()
            .context("Failed to create ncnn work directory")?;
        info!(model = %self.model_name(), work_dir = %dir.path().display(), "Initialized ncnn backend");
        self.work_dir = Some(dir);
        Ok(())
    }

    fn upscale(&mut self, image: &RgbImage) -> Result<RgbImage> {
        if self.work_dir.is_none() {
            self.initialize()?;
        }
        let dir = self
            .work_dir
            .as_ref()
            .context("ncnn work directory missing")?
            .path()
            .to_path_buf();
        let input = dir.join("input.png");
        let output = dir.join("output.png");
        save_rgb(image, &input)?;

        let mut cmd = command_for(NCNN_BINARY);
        cmd.args(self.build_args(&input, &output));
        debug!(width = image.width, height = image.height, "Running ncnn upscale");
        if let Err(err) = run_checked(cmd, NCNN_BINARY, self.options.ncnn_timeout) {
            // A crashed or OOM-killed engine is an inference failure, not a pipeline one.
            return match find_upscale_error(&err) {
                Some(UpscaleError::ExternalProcess { reason, .. }) => {
                    Err(UpscaleError::inference(format!("{NCNN_BINARY}: {reason}")).into())
                }
                _ => Err(err),
            };
        }

        if !output.is_file() {
            return Err(UpscaleError::inference(format!("{NCNN_BINARY} did not produce an output file")).into());
        }
        let result = load_rgb(&output)?;
        let _ = std::fs::remove_file(&input);
        let _ = std::fs::remove_file(&output);
        Ok(result)
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            available_mb: 2000,
            device_name: "vulkan".to_string(),
        }
    }

    fn scale(&self) -> u32 {
        self.options.scale
    }

    fn preferred_tile_size(&self, _available_mb: u64) -> usize {
        NCNN_TILE
    }
}
