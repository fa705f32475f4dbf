//! Demux → decode → tile-and-infer → encode → remux, for one file or a batch.
//!
//! Frames are processed strictly one at a time: a frame is read, upscaled,
//! written, and dropped before the next one is read.

mod batch;
mod image;
mod progress;
mod video;

pub use batch::{
    discover, output_path_for, wildcard_match, BatchOptions, BatchReport, FileJob, MediaFilter,
    MediaKind, VIDEO_EXTENSIONS,
};
pub use progress::{
    BatchProgressState, NullProgress, ProgressEvent, ProgressSink, ProgressTracker,
};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::UpscaleError;
use crate::ffmpeg::EncodeOptions;
use crate::resize::{resize_rgb, ResizeFilter};
use crate::tiling::{auto_tile_size, upscale_with_retry, TilePolicy, DEFAULT_TILE_OVERLAP, MIN_TILE_SIZE};
use crate::tone::preserve_tone;
use crate::types::RgbImage;
use crate::yuv::{rgb_to_yuv420, yuv420_to_rgb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Idle,
    Demuxing,
    Processing,
    Remuxing,
    Done,
    Failed,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Demuxing => "demuxing",
            Self::Processing => "processing",
            Self::Remuxing => "remuxing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-file state machine. Transitions are only logged; nothing branches on them.
#[derive(Debug)]
pub struct FileRun {
    path: PathBuf,
    state: FileState,
}

impl FileRun {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state: FileState::Idle,
        }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn transition(&mut self, next: FileState) {
        debug!(path = %self.path.display(), from = %self.state, to = %next, "File state change");
        self.state = next;
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Output scale. When it differs from the model's, the result is resized.
    pub scale: u32,
    /// `0` lets the backend choose.
    pub tile: usize,
    pub tile_overlap: usize,
    pub min_tile: usize,
    pub preserve_tone: bool,
    pub resize_filter: ResizeFilter,
    pub encode: EncodeOptions,
    pub demux_timeout: Duration,
    pub remux_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            scale: 4,
            tile: 0,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            min_tile: MIN_TILE_SIZE,
            preserve_tone: true,
            resize_filter: ResizeFilter::Bilinear,
            encode: EncodeOptions::default(),
            demux_timeout: Duration::from_secs(3600),
            remux_timeout: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs frames through a backend with tiling, retry, and rescaling.
pub struct FrameUpscaler {
    backend: Box<dyn Backend>,
    policy: TilePolicy,
    target_scale: u32,
    preserve_tone: bool,
    resize_filter: ResizeFilter,
}

impl FrameUpscaler {
    pub fn new(backend: Box<dyn Backend>, options: &PipelineOptions) -> Self {
        let memory = backend.memory_info();
        let tile_size = if options.tile > 0 {
            options.tile
        } else {
            backend.preferred_tile_size(memory.available_mb)
        };
        let policy = TilePolicy {
            tile_size,
            overlap: options.tile_overlap,
            min_tile: options.min_tile,
            auto_tile: auto_tile_size(memory.available_mb),
        };
        info!(
            backend = backend.name(),
            device = %memory.device_name,
            available_mb = memory.available_mb,
            tile_size,
            overlap = policy.overlap,
            model_scale = backend.scale(),
            target_scale = options.scale,
            "Frame upscaler ready"
        );
        Self {
            backend,
            policy,
            target_scale: options.scale.max(1),
            preserve_tone: options.preserve_tone,
            resize_filter: options.resize_filter,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn policy(&self) -> &TilePolicy {
        &self.policy
    }

    pub fn target_scale(&self) -> u32 {
        self.target_scale
    }

    pub fn output_dims(&self, width: usize, height: usize) -> (usize, usize) {
        let s = self.target_scale as usize;
        (width * s, height * s)
    }

    /// Model pass plus rescale to the target factor. A tile size that had to be
    /// lowered stays lowered for later frames.
    pub fn upscale_rgb(&mut self, image: &RgbImage) -> Result<RgbImage> {
        let model_scale = self.backend.scale().max(1) as usize;
        let backend = &mut self.backend;
        let (output, used_tile) =
            upscale_with_retry(image, model_scale, &self.policy, |tile| backend.upscale(tile))?;
        if used_tile != self.policy.tile_size {
            info!(
                previous = self.policy.tile_size,
                tile_size = used_tile,
                "Keeping reduced tile size for the remaining frames"
            );
            self.policy.tile_size = used_tile;
        }

        let (want_w, want_h) = self.output_dims(image.width, image.height);
        if output.width == want_w && output.height == want_h {
            Ok(output)
        } else {
            Ok(resize_rgb(&output, want_w, want_h, self.resize_filter))
        }
    }

    /// Still-image path, with optional tone matching against the source.
    pub fn upscale_image(&mut self, image: &RgbImage) -> Result<RgbImage> {
        let output = self.upscale_rgb(image)?;
        if self.preserve_tone {
            debug!("Applying histogram tone matching");
            Ok(preserve_tone(image, &output))
        } else {
            Ok(output)
        }
    }

    /// One 4:2:0 planar frame in, one upscaled planar frame out.
    pub fn upscale_planar(&mut self, frame: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
        let rgb = yuv420_to_rgb(frame, width, height)
            .map_err(|e| UpscaleError::format(format!("{e:#}")))?;
        let upscaled = self.upscale_rgb(&rgb)?;
        Ok(rgb_to_yuv420(&upscaled))
    }
}

/// Owns the upscaler and the cancellation token for a run.
pub struct Pipeline {
    upscaler: FrameUpscaler,
    options: PipelineOptions,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(backend: Box<dyn Backend>, options: PipelineOptions, cancel: CancellationToken) -> Self {
        Self {
            upscaler: FrameUpscaler::new(backend, &options),
            options,
            cancel,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn upscaler(&self) -> &FrameUpscaler {
        &self.upscaler
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(UpscaleError::Cancelled.into());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{ClassicalBackend, MemoryInfo};

    /// Nearest-neighbour engine with a configurable native scale that fails
    /// any tile wider than `max_edge`.
    pub(crate) struct FakeBackend {
        pub scale: u32,
        pub max_edge: usize,
        pub calls: usize,
    }

    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }

        fn upscale(&mut self, image: &RgbImage) -> Result<RgbImage> {
            self.calls += 1;
            if image.width.max(image.height) > self.max_edge {
                return Err(UpscaleError::inference("out of memory").into());
            }
            let s = self.scale as usize;
            Ok(resize_rgb(image, image.width * s, image.height * s, ResizeFilter::Nearest))
        }

        fn memory_info(&self) -> MemoryInfo {
            MemoryInfo {
                available_mb: 1000,
                device_name: "fake".into(),
            }
        }

        fn scale(&self) -> u32 {
            self.scale
        }

        fn preferred_tile_size(&self, _available_mb: u64) -> usize {
            0
        }
    }

    pub(crate) fn fake_pipeline(scale: u32, options: PipelineOptions) -> Pipeline {
        let backend = FakeBackend {
            scale,
            max_edge: usize::MAX,
            calls: 0,
        };
        Pipeline::new(Box::new(backend), options, CancellationToken::new())
    }

    #[test]
    fn state_machine_records_last_state() {
        let mut run = FileRun::new(Path::new("clip.mp4"));
        assert_eq!(run.state(), FileState::Idle);
        for next in [FileState::Demuxing, FileState::Processing, FileState::Remuxing, FileState::Done] {
            run.transition(next);
        }
        assert_eq!(run.state(), FileState::Done);
        assert_eq!(FileState::Remuxing.to_string(), "remuxing");
    }

    #[test]
    fn tile_size_drops_after_oom_and_sticks() {
        let backend = FakeBackend {
            scale: 2,
            max_edge: 40,
            calls: 0,
        };
        let options = PipelineOptions {
            tile: 0,
            tile_overlap: 4,
            preserve_tone: false,
            scale: 2,
            ..Default::default()
        };
        let mut upscaler = FrameUpscaler::new(Box::new(backend), &options);
        // available_mb 1000 -> auto tile 64, still too big; halves to 32.
        let image = RgbImage::filled(100, 80, [10, 20, 30]);
        let out = upscaler.upscale_rgb(&image).unwrap();
        assert_eq!((out.width, out.height), (200, 160));
        assert_eq!(upscaler.policy().tile_size, 32);

        let again = upscaler.upscale_rgb(&image).unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn model_scale_is_resized_to_target() {
        let options = PipelineOptions {
            scale: 2,
            preserve_tone: false,
            ..Default::default()
        };
        let mut upscaler = FrameUpscaler::new(
            Box::new(FakeBackend {
                scale: 4,
                max_edge: usize::MAX,
                calls: 0,
            }),
            &options,
        );
        let out = upscaler.upscale_rgb(&RgbImage::filled(8, 6, [1, 2, 3])).unwrap();
        assert_eq!((out.width, out.height), (16, 12));
        assert!(out.data.chunks_exact(3).all(|p| p == [1, 2, 3]));
    }

    #[test]
    fn planar_frame_round_trips_through_classical() {
        let options = PipelineOptions {
            scale: 2,
            ..Default::default()
        };
        let mut upscaler =
            FrameUpscaler::new(Box::new(ClassicalBackend::new(2, ResizeFilter::Bilinear)), &options);
        let frame = rgb_to_yuv420(&RgbImage::filled(4, 4, [90, 90, 90]));
        let out = upscaler.upscale_planar(&frame, 4, 4).unwrap();
        assert_eq!(out.len(), 8 * 8 * 3 / 2);
        assert!(out[..64].iter().all(|&y| y == 90));
    }

    #[test]
    fn cancelled_pipeline_reports_cancel() {
        let pipeline = fake_pipeline(2, PipelineOptions::default());
        assert!(pipeline.check_cancelled().is_ok());
        pipeline.cancel_token().cancel();
        let err = pipeline.check_cancelled().unwrap_err();
        assert!(crate::error::is_cancelled(&err));
    }
}
