use anyhow::{bail, Result};

/// Interleaved 8-bit RGB image, row-major, `width * height * 3` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl RgbImage {
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> Result<Self> {
        let expected = width * height * 3;
        if data.len() != expected {
            bail!(
                "RGB buffer length mismatch: expected {expected} bytes for {width}x{height}, got {}",
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            data: vec![0u8; width * height * 3],
            width,
            height,
        }
    }

    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width * height * 3);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Copy the `w x h` region whose top-left corner is `(x, y)`.
    pub fn crop(&self, x: usize, y: usize, w: usize, h: usize) -> Self {
        let mut data = Vec::with_capacity(w * h * 3);
        for row in y..y + h {
            let start = (row * self.width + x) * 3;
            data.extend_from_slice(&self.data[start..start + w * 3]);
        }
        Self {
            data,
            width: w,
            height: h,
        }
    }

    /// Write `src`'s `w x h` region starting at `(src_x, src_y)` into `self` at `(dst_x, dst_y)`.
    pub fn blit_region(
        &mut self,
        src: &RgbImage,
        src_x: usize,
        src_y: usize,
        w: usize,
        h: usize,
        dst_x: usize,
        dst_y: usize,
    ) {
        for row in 0..h {
            let s = ((src_y + row) * src.width + src_x) * 3;
            let d = ((dst_y + row) * self.width + dst_x) * 3;
            self.data[d..d + w * 3].copy_from_slice(&src.data[s..s + w * 3]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_length() {
        let err = RgbImage::new(vec![0; 10], 2, 2).unwrap_err();
        assert!(err.to_string().contains("expected 12 bytes"));
    }

    #[test]
    fn crop_and_blit_move_the_same_pixels() {
        let mut src = RgbImage::zeros(4, 4);
        for (i, byte) in src.data.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let crop = src.crop(1, 2, 2, 2);
        assert_eq!(crop.pixel(0, 0), src.pixel(1, 2));
        assert_eq!(crop.pixel(1, 1), src.pixel(2, 3));

        let mut dst = RgbImage::zeros(4, 4);
        dst.blit_region(&src, 1, 2, 2, 2, 0, 0);
        assert_eq!(dst.pixel(0, 0), src.pixel(1, 2));
        assert_eq!(dst.pixel(1, 1), src.pixel(2, 3));
        assert_eq!(dst.pixel(3, 3), [0, 0, 0]);
    }
}
