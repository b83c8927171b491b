//! Byte layouts the detection and recognition models write into their
//! output buffers. All multi-byte fields are little endian.
//!
//! Detection: `u16` region count followed by 16-byte records
//! `x, y, w, h: u16 | confidence: f32 | orientation: u8 | 3 bytes padding`.
//!
//! Recognition: 64-byte buffer `confidence: f32 | len: u8 | utf-8 text[len]`.

use thiserror::Error;

pub const MAX_REGIONS: usize = 16;
pub const DETECTION_RECORD_LEN: usize = 16;
pub const DETECTION_OUTPUT_LEN: usize = 2 + MAX_REGIONS * DETECTION_RECORD_LEN;
pub const RECOGNITION_OUTPUT_LEN: usize = 64;
pub const MAX_FRAGMENT_BYTES: usize = RECOGNITION_OUTPUT_LEN - 5;

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("buffer of {actual} bytes too short, {needed} required")]
    Truncated { needed: usize, actual: usize },
    #[error("confidence {0} outside [0, 1]")]
    Confidence(f32),
    #[error("text length {0} exceeds {MAX_FRAGMENT_BYTES} bytes")]
    TextLength(usize),
    #[error("text fragment is not valid utf-8")]
    Utf8,
}

/// One candidate text region from the detection model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionRecord {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub confidence: f32,
    /// 0 = horizontal, 1 = vertical.
    pub orientation: u8,
}

/// One recognised fragment from the recognition model.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub confidence: f32,
    pub text: String,
}

fn check_confidence(value: f32) -> Result<f32, WireError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(WireError::Confidence(value))
    }
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Writes at most [`MAX_REGIONS`] records; returns the number of bytes used.
pub fn encode_regions(regions: &[RegionRecord], out: &mut [u8]) -> Result<usize, WireError> {
    let count = regions.len().min(MAX_REGIONS);
    let needed = 2 + count * DETECTION_RECORD_LEN;
    ensure_len(out, needed)?;

    out[..2].copy_from_slice(&(count as u16).to_le_bytes());
    for (region, chunk) in regions
        .iter()
        .take(count)
        .zip(out[2..needed].chunks_exact_mut(DETECTION_RECORD_LEN))
    {
        chunk[0..2].copy_from_slice(&region.x.to_le_bytes());
        chunk[2..4].copy_from_slice(&region.y.to_le_bytes());
        chunk[4..6].copy_from_slice(&region.width.to_le_bytes());
        chunk[6..8].copy_from_slice(&region.height.to_le_bytes());
        chunk[8..12].copy_from_slice(&check_confidence(region.confidence)?.to_le_bytes());
        chunk[12] = region.orientation;
        chunk[13..16].fill(0);
    }
    Ok(needed)
}

/// Decodes a detection buffer. Counts above [`MAX_REGIONS`] are capped.
pub fn decode_regions(buf: &[u8]) -> Result<Vec<RegionRecord>, WireError> {
    ensure_len(buf, 2)?;
    let count = (u16::from_le_bytes([buf[0], buf[1]]) as usize).min(MAX_REGIONS);
    let needed = 2 + count * DETECTION_RECORD_LEN;
    ensure_len(buf, needed)?;

    buf[2..needed]
        .chunks_exact(DETECTION_RECORD_LEN)
        .map(|chunk| {
            let u16_at = |at: usize| u16::from_le_bytes([chunk[at], chunk[at + 1]]);
            let confidence =
                f32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]);
            Ok(RegionRecord {
                x: u16_at(0),
                y: u16_at(2),
                width: u16_at(4),
                height: u16_at(6),
                confidence: check_confidence(confidence)?,
                orientation: chunk[12],
            })
        })
        .collect()
}

/// Writes a fragment, truncating text to [`MAX_FRAGMENT_BYTES`] on a char boundary.
pub fn encode_fragment(confidence: f32, text: &str, out: &mut [u8]) -> Result<usize, WireError> {
    ensure_len(out, RECOGNITION_OUTPUT_LEN)?;
    let mut end = text.len().min(MAX_FRAGMENT_BYTES);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    out[..4].copy_from_slice(&check_confidence(confidence)?.to_le_bytes());
    out[4] = end as u8;
    out[5..5 + end].copy_from_slice(&text.as_bytes()[..end]);
    out[5 + end..RECOGNITION_OUTPUT_LEN].fill(0);
    Ok(RECOGNITION_OUTPUT_LEN)
}

pub fn decode_fragment(buf: &[u8]) -> Result<Fragment, WireError> {
    ensure_len(buf, 5)?;
    let confidence = check_confidence(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))?;
    let len = buf[4] as usize;
    if len > MAX_FRAGMENT_BYTES {
        return Err(WireError::TextLength(len));
    }
    ensure_len(buf, 5 + len)?;
    let text = std::str::from_utf8(&buf[5..5 + len]).map_err(|_| WireError::Utf8)?;
    Ok(Fragment {
        confidence,
        text: text.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: u16, confidence: f32) -> RegionRecord {
        RegionRecord {
            x,
            y: 4,
            width: 32,
            height: 8,
            confidence,
            orientation: 0,
        }
    }

    #[test]
    fn region_count_is_capped() {
        let regions: Vec<_> = (0..20).map(|i| region(i, 0.9)).collect();
        let mut out = [0u8; DETECTION_OUTPUT_LEN];
        assert_eq!(encode_regions(&regions, &mut out).unwrap(), DETECTION_OUTPUT_LEN);

        let decoded = decode_regions(&out).unwrap();
        assert_eq!(decoded.len(), MAX_REGIONS);
        assert_eq!(decoded[15].x, 15);

        // A count larger than the cap still decodes only the capped records.
        out[..2].copy_from_slice(&40u16.to_le_bytes());
        assert_eq!(decode_regions(&out).unwrap().len(), MAX_REGIONS);
    }

    #[test]
    fn truncated_detection_buffer_is_rejected() {
        let mut out = [0u8; 64];
        encode_regions(&[region(1, 0.5), region(2, 0.6)], &mut out).unwrap();
        assert_eq!(
            decode_regions(&out[..20]),
            Err(WireError::Truncated {
                needed: 34,
                actual: 20
            })
        );
    }

    #[test]
    fn nan_confidence_is_rejected() {
        let mut out = [0u8; 18];
        out[..2].copy_from_slice(&1u16.to_le_bytes());
        out[10..14].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(matches!(decode_regions(&out), Err(WireError::Confidence(_))));
    }

    #[test]
    fn long_fragment_truncates_on_char_boundary() {
        let text = "あ".repeat(30);
        let mut out = [0u8; RECOGNITION_OUTPUT_LEN];
        encode_fragment(0.9, &text, &mut out).unwrap();
        let fragment = decode_fragment(&out).unwrap();
        assert_eq!(fragment.text.len(), 57);
        assert!(text.starts_with(&fragment.text));
    }

    #[test]
    fn fragment_length_over_limit_is_malformed() {
        let mut out = [0u8; RECOGNITION_OUTPUT_LEN];
        encode_fragment(0.7, "OK", &mut out).unwrap();
        out[4] = 60;
        assert_eq!(decode_fragment(&out), Err(WireError::TextLength(60)));
        out[4] = 2;
        out[5] = 0xFF;
        assert_eq!(decode_fragment(&out), Err(WireError::Utf8));
    }
}
