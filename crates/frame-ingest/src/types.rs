use thiserror::Error;

/// Bytes per RGB565 pixel.
pub const RGB565_BYTES: usize = 2;

/// Packed-pixel image captured from the sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// 5-6-5 bits per channel, little endian.
    Rgb565,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgb565 => RGB565_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Frame {
    /// Build a frame filled with a single RGB565 value.
    pub fn uniform(width: u32, height: u32, pixel: u16) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * RGB565_BYTES);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        Self {
            data,
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Rgb565,
            ready: true,
        }
    }

    pub fn expected_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Check that the buffer matches the advertised geometry.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.data.len() != self.expected_size() {
            return Err(CaptureError::SizeMismatch {
                expected: self.expected_size(),
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y as usize * self.width as usize + x as usize) * RGB565_BYTES;
        self.data
            .get(at..at + RGB565_BYTES)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }
}

/// Pack 5/6/5-bit channels into one RGB565 value.
pub fn pack_rgb565(r: u16, g: u16, b: u16) -> u16 {
    ((r & 0x1F) << 11) | ((g & 0x3F) << 5) | (b & 0x1F)
}

/// Split an RGB565 value into its 5/6/5-bit channels.
pub fn unpack_rgb565(pixel: u16) -> (u16, u16, u16) {
    (pixel >> 11, (pixel >> 5) & 0x3F, pixel & 0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb565_pack_roundtrips_channel_limits() {
        let pixel = pack_rgb565(31, 63, 31);
        assert_eq!(pixel, 0xFFFF);
        assert_eq!(unpack_rgb565(pack_rgb565(17, 40, 3)), (17, 40, 3));
    }

    #[test]
    fn validate_rejects_short_buffers() {
        let mut frame = Frame::uniform(4, 4, 0x1234);
        assert!(frame.validate().is_ok());
        frame.data.pop();
        assert!(matches!(
            frame.validate(),
            Err(CaptureError::SizeMismatch { expected: 32, actual: 31 })
        ));
    }

    #[test]
    fn pixel_reads_little_endian() {
        let frame = Frame::uniform(2, 2, 0xBEEF);
        assert_eq!(frame.pixel(1, 1), Some(0xBEEF));
        assert_eq!(frame.pixel(2, 0), None);
    }
}
