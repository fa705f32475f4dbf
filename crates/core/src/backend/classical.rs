use anyhow::Result;

use super::{Backend, MemoryInfo};
use crate::resize::{resize_rgb, ResizeFilter};
use crate::types::RgbImage;

/// Plain interpolation. No model, no device, always available.
pub struct ClassicalBackend {
    scale: u32,
    filter: ResizeFilter,
}

impl ClassicalBackend {
    pub fn new(scale: u32, filter: ResizeFilter) -> Self {
        Self {
            scale: scale.max(1),
            filter,
        }
    }

    pub fn is_available() -> bool {
        true
    }
}

impl Backend for ClassicalBackend {
    fn name(&self) -> &'static str {
        "classical"
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn upscale(&mut self, image: &RgbImage) -> Result<RgbImage> {
        let s = self.scale as usize;
        Ok(resize_rgb(image, image.width * s, image.height * s, self.filter))
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            available_mb: 0,
            device_name: "cpu".to_string(),
        }
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn preferred_tile_size(&self, _available_mb: u64) -> usize {
        0
    }
}
