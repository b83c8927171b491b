//! RGB565 image operations performed on pool scratch memory.

use frame_ingest::{RGB565_BYTES, pack_rgb565, unpack_rgb565};
use thiserror::Error;

use crate::ocr::data::TextBox;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("source holds {actual} bytes, {expected} expected for {width}x{height}")]
    SourceSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("destination holds {actual} bytes, {expected} required")]
    DestinationSize { expected: usize, actual: usize },
}

pub fn downsampled_dims(width: u32, height: u32) -> (u32, u32) {
    (width / 2, height / 2)
}

pub fn image_bytes(width: u32, height: u32) -> usize {
    width as usize * height as usize * RGB565_BYTES
}

fn read_px(buf: &[u8], index: usize) -> u16 {
    let at = index * RGB565_BYTES;
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn write_px(buf: &mut [u8], index: usize, pixel: u16) {
    let at = index * RGB565_BYTES;
    buf[at..at + RGB565_BYTES].copy_from_slice(&pixel.to_le_bytes());
}

/// Halve both dimensions, averaging each channel over 2x2 blocks.
///
/// Returns the output dimensions. Odd trailing rows and columns are dropped.
pub fn downsample_rgb565(
    src: &[u8],
    width: u32,
    height: u32,
    dst: &mut [u8],
) -> Result<(u32, u32), PreprocessError> {
    let expected = image_bytes(width, height);
    if src.len() < expected {
        return Err(PreprocessError::SourceSize {
            width,
            height,
            expected,
            actual: src.len(),
        });
    }
    let (out_w, out_h) = downsampled_dims(width, height);
    let needed = image_bytes(out_w, out_h);
    if dst.len() < needed {
        return Err(PreprocessError::DestinationSize {
            expected: needed,
            actual: dst.len(),
        });
    }

    let stride = width as usize;
    for oy in 0..out_h as usize {
        for ox in 0..out_w as usize {
            let top = 2 * oy * stride + 2 * ox;
            let bottom = top + stride;
            let (mut r, mut g, mut b) = (0u16, 0u16, 0u16);
            for index in [top, top + 1, bottom, bottom + 1] {
                let (pr, pg, pb) = unpack_rgb565(read_px(src, index));
                r += pr;
                g += pg;
                b += pb;
            }
            write_px(dst, oy * out_w as usize + ox, pack_rgb565(r / 4, g / 4, b / 4));
        }
    }
    Ok((out_w, out_h))
}

/// Intersection of `region` with a `width` x `height` image, as (x, y, w, h).
pub fn clamp_region(region: &TextBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x = u32::from(region.x);
    let y = u32::from(region.y);
    if x >= width || y >= height {
        return None;
    }
    let w = u32::from(region.width).min(width - x);
    let h = u32::from(region.height).min(height - y);
    if w == 0 || h == 0 {
        return None;
    }
    Some((x, y, w, h))
}

/// Copy the `(x, y, w, h)` window of `src` into a tightly packed `dst`.
pub fn crop_rgb565(
    src: &[u8],
    width: u32,
    window: (u32, u32, u32, u32),
    dst: &mut [u8],
) -> Result<(), PreprocessError> {
    let (x, y, w, h) = window;
    let needed = image_bytes(w, h);
    if dst.len() < needed {
        return Err(PreprocessError::DestinationSize {
            expected: needed,
            actual: dst.len(),
        });
    }
    let row_bytes = w as usize * RGB565_BYTES;
    for row in 0..h as usize {
        let from = ((y as usize + row) * width as usize + x as usize) * RGB565_BYTES;
        let Some(line) = src.get(from..from + row_bytes) else {
            return Err(PreprocessError::SourceSize {
                width,
                height: y + h,
                expected: from + row_bytes,
                actual: src.len(),
            });
        };
        dst[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(line);
    }
    Ok(())
}
