//! Histogram matching used to keep an upscaled still close to the source's tones.

use crate::resize::{resize_rgb, ResizeFilter};
use crate::types::RgbImage;

/// Remap each channel of `source` so its CDF follows `reference`'s.
///
/// Both images may differ in size; only their per-channel distributions matter.
pub fn match_histogram(source: &RgbImage, reference: &RgbImage) -> RgbImage {
    let mut out = source.clone();
    if source.data.is_empty() || reference.data.is_empty() {
        return out;
    }

    for channel in 0..3 {
        let cdf_src = cumulative_histogram(&source.data, channel);
        let cdf_ref = cumulative_histogram(&reference.data, channel);
        let total_src = cdf_src[255];
        let total_ref = cdf_ref[255];

        let mut mapping = [0u8; 256];
        for (level, slot) in mapping.iter_mut().enumerate() {
            // First reference level whose normalised CDF reaches the source's,
            // compared by cross-multiplying to stay in integers.
            let target = cdf_src[level] * total_ref;
            let idx = cdf_ref.partition_point(|&c| c * total_src < target);
            *slot = idx.min(255) as u8;
        }

        for px in out.data.chunks_exact_mut(3) {
            px[channel] = mapping[px[channel] as usize];
        }
    }

    out
}

/// Match the upscaled frame against the original brought to the same size.
pub fn preserve_tone(original: &RgbImage, upscaled: &RgbImage) -> RgbImage {
    let reference = resize_rgb(original, upscaled.width, upscaled.height, ResizeFilter::Bilinear);
    match_histogram(upscaled, &reference)
}

fn cumulative_histogram(data: &[u8], channel: usize) -> [u64; 256] {
    let mut hist = [0u64; 256];
    for px in data.chunks_exact(3) {
        hist[px[channel] as usize] += 1;
    }
    let mut running = 0;
    for bin in hist.iter_mut() {
        running += *bin;
        *bin = running;
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_images_are_unchanged() {
        let mut image = RgbImage::zeros(8, 8);
        for (i, byte) in image.data.iter_mut().enumerate() {
            *byte = (i * 7 % 256) as u8;
        }
        assert_eq!(match_histogram(&image, &image), image);
    }

    #[test]
    fn shifts_brightness_toward_reference() {
        let dark = RgbImage::filled(4, 4, [40, 40, 40]);
        let bright = RgbImage::filled(2, 2, [180, 90, 10]);
        let matched = match_histogram(&dark, &bright);
        assert!(matched.data.chunks_exact(3).all(|p| p == [180, 90, 10]));
    }

    #[test]
    fn preserve_tone_keeps_output_size() {
        let original = RgbImage::filled(3, 3, [50, 60, 70]);
        let upscaled = RgbImage::filled(12, 12, [55, 66, 77]);
        let out = preserve_tone(&original, &upscaled);
        assert_eq!((out.width, out.height), (12, 12));
        assert_eq!(out.pixel(5, 5), [50, 60, 70]);
    }
}
