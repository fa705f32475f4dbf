//! 4:2:0 planar <-> interleaved RGB conversion (BT.601, full range).
//!
//! Chroma is resampled with linear interpolation in both directions, so a
//! round trip is lossy by construction: sharp chroma edges blur across the
//! 2x2 subsampling block and every step rounds to 8 bits. Solid colors come
//! back within a couple of code values.

use anyhow::{bail, Result};

use crate::resize::{resize_packed, ResizeFilter};
use crate::types::RgbImage;

pub fn chroma_dims(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(2), height.div_ceil(2))
}

pub fn yuv420_frame_size(width: usize, height: usize) -> usize {
    let (cw, ch) = chroma_dims(width, height);
    width * height + 2 * cw * ch
}

#[inline]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

pub fn yuv420_to_rgb(data: &[u8], width: usize, height: usize) -> Result<RgbImage> {
    let expected = yuv420_frame_size(width, height);
    if data.len() != expected {
        bail!(
            "planar frame length mismatch: expected {expected} bytes for {width}x{height}, got {}",
            data.len()
        );
    }

    let luma_len = width * height;
    let (cw, ch) = chroma_dims(width, height);
    let chroma_len = cw * ch;
    let y_plane = &data[..luma_len];
    let u_small = &data[luma_len..luma_len + chroma_len];
    let v_small = &data[luma_len + chroma_len..];

    let u_plane = resize_packed(u_small, cw, ch, 1, width, height, ResizeFilter::Bilinear);
    let v_plane = resize_packed(v_small, cw, ch, 1, width, height, ResizeFilter::Bilinear);

    let mut rgb = Vec::with_capacity(luma_len * 3);
    for i in 0..luma_len {
        let y = y_plane[i] as f32;
        let u = u_plane[i] as f32 - 128.0;
        let v = v_plane[i] as f32 - 128.0;
        rgb.push(to_u8(y + 1.402 * v));
        rgb.push(to_u8(y - 0.344_136 * u - 0.714_136 * v));
        rgb.push(to_u8(y + 1.772 * u));
    }

    RgbImage::new(rgb, width, height)
}

pub fn rgb_to_yuv420(image: &RgbImage) -> Vec<u8> {
    let (width, height) = (image.width, image.height);
    let luma_len = width * height;
    let mut y_plane = Vec::with_capacity(luma_len);
    let mut u_full = Vec::with_capacity(luma_len);
    let mut v_full = Vec::with_capacity(luma_len);

    for px in image.data.chunks_exact(3) {
        let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);
        y_plane.push(to_u8(0.299 * r + 0.587 * g + 0.114 * b));
        u_full.push(to_u8(-0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0));
        v_full.push(to_u8(0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0));
    }

    let (cw, ch) = chroma_dims(width, height);
    let mut out = y_plane;
    out.reserve(2 * cw * ch);
    out.extend(resize_packed(&u_full, width, height, 1, cw, ch, ResizeFilter::Bilinear));
    out.extend(resize_packed(&v_full, width, height, 1, cw, ch, ResizeFilter::Bilinear));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: [u8; 3], b: [u8; 3], tolerance: i16) {
        for c in 0..3 {
            let diff = (a[c] as i16 - b[c] as i16).abs();
            assert!(diff <= tolerance, "{a:?} vs {b:?} (channel {c} off by {diff})");
        }
    }

    #[test]
    fn solid_colors_survive_round_trip() {
        for color in [
            [0, 0, 0],
            [255, 255, 255],
            [200, 30, 90],
            [12, 180, 240],
            [128, 128, 128],
        ] {
            let image = RgbImage::filled(6, 4, color);
            let planar = rgb_to_yuv420(&image);
            assert_eq!(planar.len(), 6 * 4 * 3 / 2);

            let back = yuv420_to_rgb(&planar, 6, 4).expect("decode");
            for px in back.data.chunks_exact(3) {
                assert_close([px[0], px[1], px[2]], color, 2);
            }
        }
    }

    #[test]
    fn gray_maps_to_neutral_chroma() {
        let planar = rgb_to_yuv420(&RgbImage::filled(2, 2, [100, 100, 100]));
        assert_eq!(planar, vec![100, 100, 100, 100, 128, 128]);
    }

    #[test]
    fn odd_dimensions_round_up_chroma() {
        assert_eq!(chroma_dims(5, 3), (3, 2));
        assert_eq!(yuv420_frame_size(5, 3), 15 + 12);
        let planar = rgb_to_yuv420(&RgbImage::filled(5, 3, [10, 20, 30]));
        assert_eq!(planar.len(), 27);
        let back = yuv420_to_rgb(&planar, 5, 3).expect("decode");
        assert_eq!((back.width, back.height), (5, 3));
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(yuv420_to_rgb(&[0u8; 5], 2, 2).is_err());
    }
}
