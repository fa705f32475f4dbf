//! Still-image decode/encode on top of the `image` crate.

use std::path::Path;

use anyhow::{Context, Result};
use image::ImageFormat;

use crate::types::RgbImage;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp", "tiff", "tif"];

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode any supported still image to 8-bit RGB (alpha is dropped).
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("Failed to read image: {}", path.display()))?
        .into_rgb8();
    let (w, h) = img.dimensions();
    RgbImage::new(img.into_raw(), w as usize, h as usize)
}

/// Encode with the format implied by the extension, PNG when there is none.
pub fn save_rgb(image: &RgbImage, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    image::save_buffer_with_format(
        path,
        &image.data,
        image.width as u32,
        image.height as u32,
        image::ColorType::Rgb8,
        format,
    )
    .with_context(|| format!("Failed to write image: {}", path.display()))
}
