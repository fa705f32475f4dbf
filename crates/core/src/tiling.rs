//! Overlapping tile grid and stitching.
//!
//! Each tile is inferred on its padded rect (source rect grown by `overlap`
//! on every side, clipped to the image) but only the scaled source rect is
//! copied into the output, so every output pixel comes from exactly one tile.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::{find_upscale_error, UpscaleError};
use crate::types::RgbImage;

pub const DEFAULT_TILE_OVERLAP: usize = 16;
pub const MIN_TILE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn right(&self) -> usize {
        self.x + self.width
    }

    pub fn bottom(&self) -> usize {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    pub source: Rect,
    pub padded: Rect,
}

/// Breakpoints used when a backend has no opinion of its own.
pub fn auto_tile_size(available_mb: u64) -> usize {
    match available_mb {
        mb if mb > 8000 => 512,
        mb if mb > 4000 => 256,
        mb if mb > 2000 => 128,
        _ => 64,
    }
}

pub fn needs_tiling(height: usize, width: usize, tile_size: usize) -> bool {
    tile_size > 0 && (height > tile_size || width > tile_size)
}

/// Row-major `ceil(H/t) x ceil(W/t)` grid over a `width x height` image.
pub fn plan_tiles(height: usize, width: usize, tile_size: usize, overlap: usize) -> Vec<Tile> {
    if tile_size == 0 || height == 0 || width == 0 {
        return Vec::new();
    }
    let rows = height.div_ceil(tile_size);
    let cols = width.div_ceil(tile_size);
    let mut tiles = Vec::with_capacity(rows * cols);

    for row in 0..rows {
        let y0 = row * tile_size;
        let y1 = (y0 + tile_size).min(height);
        let py0 = y0.saturating_sub(overlap);
        let py1 = (y1 + overlap).min(height);
        for col in 0..cols {
            let x0 = col * tile_size;
            let x1 = (x0 + tile_size).min(width);
            let px0 = x0.saturating_sub(overlap);
            let px1 = (x1 + overlap).min(width);
            tiles.push(Tile {
                row,
                col,
                source: Rect {
                    x: x0,
                    y: y0,
                    width: x1 - x0,
                    height: y1 - y0,
                },
                padded: Rect {
                    x: px0,
                    y: py0,
                    width: px1 - px0,
                    height: py1 - py0,
                },
            });
        }
    }
    tiles
}

fn check_output_shape(output: &RgbImage, input: &RgbImage, scale: usize) -> Result<()> {
    let (want_w, want_h) = (input.width * scale, input.height * scale);
    if output.width != want_w || output.height != want_h || output.data.len() != want_w * want_h * 3 {
        return Err(UpscaleError::inference(format!(
            "engine returned {}x{} ({} bytes) for a {}x{} input, expected {want_w}x{want_h}",
            output.width,
            output.height,
            output.data.len(),
            input.width,
            input.height
        ))
        .into());
    }
    Ok(())
}

/// Upscale `image` by `scale`, tiling when it exceeds `tile_size`.
pub fn upscale_tiled<F>(
    image: &RgbImage,
    scale: usize,
    tile_size: usize,
    overlap: usize,
    mut infer: F,
) -> Result<RgbImage>
where
    F: FnMut(&RgbImage) -> Result<RgbImage>,
{
    if !needs_tiling(image.height, image.width, tile_size) {
        let output = infer(image)?;
        check_output_shape(&output, image, scale)?;
        return Ok(output);
    }

    let tiles = plan_tiles(image.height, image.width, tile_size, overlap);
    debug!(
        tile_size,
        overlap,
        tiles = tiles.len(),
        width = image.width,
        height = image.height,
        "Starting tiled inference"
    );

    let mut output = RgbImage::zeros(image.width * scale, image.height * scale);
    let total = tiles.len();
    for (index, tile) in tiles.iter().enumerate() {
        let input = image.crop(tile.padded.x, tile.padded.y, tile.padded.width, tile.padded.height);
        let result = infer(&input)
            .with_context(|| format!("tile {}/{total} at ({}, {})", index + 1, tile.source.x, tile.source.y))?;
        check_output_shape(&result, &input, scale)?;

        output.blit_region(
            &result,
            (tile.source.x - tile.padded.x) * scale,
            (tile.source.y - tile.padded.y) * scale,
            tile.source.width * scale,
            tile.source.height * scale,
            tile.source.x * scale,
            tile.source.y * scale,
        );
    }

    Ok(output)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePolicy {
    pub tile_size: usize,
    pub overlap: usize,
    pub min_tile: usize,
    /// Size to fall to when an untiled attempt fails.
    pub auto_tile: usize,
}

impl Default for TilePolicy {
    fn default() -> Self {
        Self {
            tile_size: 0,
            overlap: DEFAULT_TILE_OVERLAP,
            min_tile: MIN_TILE_SIZE,
            auto_tile: 64,
        }
    }
}

impl TilePolicy {
    /// Next rung of the retry ladder after `current` failed, if any is left.
    pub fn next_tile_size(&self, current: usize, height: usize, width: usize) -> Option<usize> {
        let longest = height.max(width);
        let effective = if current == 0 { longest } else { current.min(longest) };
        let candidate = if current == 0 && self.auto_tile > 0 && self.auto_tile < effective {
            self.auto_tile
        } else {
            effective / 2
        };
        (candidate >= self.min_tile.max(1)).then_some(candidate)
    }
}

/// Run [`upscale_tiled`], retrying the whole frame with smaller tiles while the
/// engine reports recoverable inference failures. Returns the output and the
/// tile size that worked.
pub fn upscale_with_retry<F>(
    image: &RgbImage,
    scale: usize,
    policy: &TilePolicy,
    mut infer: F,
) -> Result<(RgbImage, usize)>
where
    F: FnMut(&RgbImage) -> Result<RgbImage>,
{
    let mut tile_size = policy.tile_size;
    loop {
        match upscale_tiled(image, scale, tile_size, policy.overlap, &mut infer) {
            Ok(output) => return Ok((output, tile_size)),
            Err(err) => {
                let retryable = find_upscale_error(&err)
                    .map(UpscaleError::is_retryable_inference)
                    .unwrap_or(false);
                if !retryable {
                    return Err(err);
                }
                match policy.next_tile_size(tile_size, image.height, image.width) {
                    Some(next) => {
                        warn!(
                            failed_tile = tile_size,
                            next_tile = next,
                            "Inference failed, retrying frame with smaller tiles: {err:#}"
                        );
                        tile_size = next;
                    }
                    None => {
                        return Err(err.context(format!(
                            "inference still failing at the minimum tile size {}",
                            policy.min_tile
                        )))
                    }
                }
            }
        }
    }
}
