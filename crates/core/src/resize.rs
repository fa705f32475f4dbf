//! Pure-Rust bilinear/nearest resampling for packed 8-bit buffers.
//!
//! Works on any channel count so the same code serves RGB frames, single
//! chroma planes and the classical fallback backend.

use crate::types::RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeFilter {
    Bilinear,
    Nearest,
}

impl ResizeFilter {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "neighbor" | "nn" => Self::Nearest,
            _ => Self::Bilinear,
        }
    }
}

pub fn resize_rgb(image: &RgbImage, dst_w: usize, dst_h: usize, filter: ResizeFilter) -> RgbImage {
    let data = resize_packed(&image.data, image.width, image.height, 3, dst_w, dst_h, filter);
    RgbImage {
        data,
        width: dst_w,
        height: dst_h,
    }
}

/// Resize a packed buffer of `channels` interleaved samples per pixel.
pub fn resize_packed(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    channels: usize,
    dst_w: usize,
    dst_h: usize,
    filter: ResizeFilter,
) -> Vec<u8> {
    if src_w == dst_w && src_h == dst_h {
        return src.to_vec();
    }
    if src_w == 0 || src_h == 0 {
        return vec![0u8; dst_w * dst_h * channels];
    }
    match filter {
        ResizeFilter::Bilinear => bilinear(src, src_w, src_h, channels, dst_w, dst_h),
        ResizeFilter::Nearest => nearest(src, src_w, src_h, channels, dst_w, dst_h),
    }
}

fn nearest(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    channels: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * channels];

    for dst_y in 0..dst_h {
        let src_y = (((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize).min(src_h - 1);
        for dst_x in 0..dst_w {
            let src_x =
                (((dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize).min(src_w - 1);
            let si = (src_y * src_w + src_x) * channels;
            let di = (dst_y * dst_w + dst_x) * channels;
            dst[di..di + channels].copy_from_slice(&src[si..si + channels]);
        }
    }

    dst
}

/// Pixel-centre aligned bilinear interpolation with edge clamping.
fn bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    channels: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * channels];

    let x_taps: Vec<(usize, usize, f64)> = (0..dst_w)
        .map(|dst_x| axis_tap(dst_x, src_w, dst_w))
        .collect();

    for dst_y in 0..dst_h {
        let (y0, y1, fy) = axis_tap(dst_y, src_h, dst_h);

        for (dst_x, &(x0, x1, fx)) in x_taps.iter().enumerate() {
            let di = (dst_y * dst_w + dst_x) * channels;
            for c in 0..channels {
                let p00 = src[(y0 * src_w + x0) * channels + c] as f64;
                let p10 = src[(y0 * src_w + x1) * channels + c] as f64;
                let p01 = src[(y1 * src_w + x0) * channels + c] as f64;
                let p11 = src[(y1 * src_w + x1) * channels + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

fn axis_tap(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f64) {
    let pos = (dst as f64 + 0.5) * src_len as f64 / dst_len as f64 - 0.5;
    let i0 = pos.floor().max(0.0) as usize;
    let i0 = i0.min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    let frac = (pos - i0 as f64).clamp(0.0, 1.0);
    (i0, i1, frac)
}
