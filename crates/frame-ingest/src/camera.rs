//! Sensor capture loop feeding the frame exchange.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, warn};

use crate::{
    exchange::{FrameExchange, PublishOutcome},
    types::{CaptureError, Frame, FrameFormat, RGB565_BYTES},
};

/// Native sensor geometry.
pub const SENSOR_WIDTH: u32 = 640;
pub const SENSOR_HEIGHT: u32 = 480;
/// 50 frames per second.
pub const CAPTURE_PERIOD: Duration = Duration::from_millis(20);

/// Anything that can fill an RGB565 buffer with the next image.
pub trait FrameSource: Send {
    fn dimensions(&self) -> (u32, u32);

    /// Fill `buffer` (reused when possible) and return the captured frame.
    fn capture(&mut self, buffer: Vec<u8>) -> Result<Frame, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }

    fn capture(&mut self, buffer: Vec<u8>) -> Result<Frame, CaptureError> {
        (**self).capture(buffer)
    }
}

/// What the synthetic sensor draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorPattern {
    Uniform(u16),
    /// Dark horizontal bands on a light page, scrolling one row per frame.
    TextLines {
        ink: u16,
        paper: u16,
        line_height: u32,
        gap: u32,
    },
}

/// Deterministic stand-in for the camera hardware.
#[derive(Debug, Clone)]
pub struct SyntheticSensor {
    width: u32,
    height: u32,
    pattern: SensorPattern,
    frame_index: u64,
}

impl SyntheticSensor {
    pub fn new(width: u32, height: u32, pattern: SensorPattern) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            pattern,
            frame_index: 0,
        })
    }

    pub fn page() -> Self {
        Self {
            width: SENSOR_WIDTH,
            height: SENSOR_HEIGHT,
            pattern: SensorPattern::TextLines {
                ink: 0x0000,
                paper: 0xFFFF,
                line_height: 12,
                gap: 20,
            },
            frame_index: 0,
        }
    }

    fn pixel_at(&self, row: u32) -> u16 {
        match self.pattern {
            SensorPattern::Uniform(value) => value,
            SensorPattern::TextLines {
                ink,
                paper,
                line_height,
                gap,
            } => {
                let stride = (line_height + gap).max(1);
                let shifted = (row as u64 + self.frame_index) % stride as u64;
                if shifted < line_height as u64 { ink } else { paper }
            }
        }
    }
}

impl FrameSource for SyntheticSensor {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self, mut buffer: Vec<u8>) -> Result<Frame, CaptureError> {
        let row_bytes = self.width as usize * RGB565_BYTES;
        buffer.clear();
        buffer.reserve(row_bytes * self.height as usize);
        for row in 0..self.height {
            let pixel = self.pixel_at(row).to_le_bytes();
            for _ in 0..self.width {
                buffer.extend_from_slice(&pixel);
            }
        }
        self.frame_index += 1;
        Ok(Frame {
            data: buffer,
            width: self.width,
            height: self.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb565,
            ready: true,
        })
    }
}

/// Notification that a new frame sits in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReady {
    pub index: u64,
    pub timestamp_ms: i64,
    /// An unconsumed frame was overwritten by this one.
    pub replaced: bool,
}

/// Periodic capture loop writing into a [`FrameExchange`].
pub struct CameraReader<S> {
    source: S,
    exchange: Arc<FrameExchange>,
    period: Duration,
    frame_limit: Option<u64>,
}

impl<S: FrameSource + 'static> CameraReader<S> {
    pub fn new(source: S, exchange: Arc<FrameExchange>) -> Self {
        Self {
            source,
            exchange,
            period: CAPTURE_PERIOD,
            frame_limit: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Stop on its own after `limit` frames.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Spawns the capture thread.
    ///
    /// `heartbeat` runs once per loop iteration. The returned channel carries
    /// one notice per published frame; notices are dropped when the consumer
    /// lags because the exchange already holds the newest frame.
    pub fn spawn(
        self,
        running: Arc<AtomicBool>,
        heartbeat: impl Fn() + Send + 'static,
    ) -> Result<(thread::JoinHandle<()>, Receiver<Result<FrameReady, CaptureError>>), CaptureError>
    {
        let (tx, rx) = bounded(4);
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    self.capture_loop(&running, &heartbeat, &tx)
                })
            })?;
        Ok((handle, rx))
    }

    fn capture_loop(
        mut self,
        running: &AtomicBool,
        heartbeat: &dyn Fn(),
        tx: &Sender<Result<FrameReady, CaptureError>>,
    ) {
        let mut index = 0u64;
        while running.load(Ordering::Acquire) {
            heartbeat();
            if self.frame_limit.is_some_and(|limit| index >= limit) {
                break;
            }

            let buffer = self.exchange.spare_buffer().unwrap_or_default();
            let notice = self.source.capture(buffer).and_then(|frame| {
                frame.validate()?;
                let timestamp_ms = frame.timestamp_ms;
                let replaced = self.exchange.publish(frame) == PublishOutcome::Replaced;
                Ok(FrameReady {
                    index,
                    timestamp_ms,
                    replaced,
                })
            });
            index += 1;

            match tx.try_send(notice) {
                Ok(()) => {}
                Err(TrySendError::Full(Ok(_))) => {}
                Err(TrySendError::Full(Err(err))) => {
                    warn!("capture error dropped, consumer lagging: {err}");
                }
                Err(TrySendError::Disconnected(_)) => break,
            }

            thread::sleep(self.period);
        }
        debug!(frames = index, "capture loop exited");
    }
}
