//! Tiled streaming super-resolution: checkpoint inspection, tile-based
//! inference with OOM retry, Y4M/4:2:0 planar streaming and the batch
//! pipeline around them.

pub mod arch;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ffmpeg;
pub mod imageio;
pub mod logging;
pub mod model_store;
pub mod pipeline;
pub mod process;
pub mod resize;
pub mod runtime;
pub mod tiling;
pub mod tone;
pub mod types;
pub mod y4m;
pub mod yuv;

pub use error::UpscaleError;
pub use types::RgbImage;
