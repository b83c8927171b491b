//! Double-buffered hand-off between the capture task and its consumer.
//!
//! The exchange holds at most one pending frame. Publishing while a frame is
//! still pending overwrites it, so a slow consumer always sees the most recent
//! capture rather than a backlog. Buffers handed back through
//! [`FrameExchange::release_frame`] are recycled by the capture side.

use std::{ops::Deref, sync::Mutex};

use serde::Serialize;
use tracing::trace;

use crate::types::Frame;

/// Number of frame buffers cycling between producer and consumer.
pub const FRAME_BUFFER_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub captured: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub released: u64,
}

/// Frame checked out by the consumer; hand it back with `release_frame`.
#[derive(Debug)]
pub struct FrameLease {
    frame: Frame,
    sequence: u64,
}

impl FrameLease {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

/// Whether a publish replaced a frame nobody consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Fresh,
    Replaced,
}

#[derive(Default)]
struct ExchangeState {
    pending: Option<(Frame, u64)>,
    spares: Vec<Vec<u8>>,
    next_sequence: u64,
    stats: CaptureStats,
}

#[derive(Default)]
pub struct FrameExchange {
    state: Mutex<ExchangeState>,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a recycled buffer for the next capture, if one is available.
    pub fn spare_buffer(&self) -> Option<Vec<u8>> {
        self.state.lock().ok()?.spares.pop()
    }

    /// Make `frame` the current frame, overwriting an unconsumed one.
    pub fn publish(&self, frame: Frame) -> PublishOutcome {
        let Ok(mut state) = self.state.lock() else {
            return PublishOutcome::Replaced;
        };
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.stats.captured += 1;
        match state.pending.replace((frame, sequence)) {
            Some((stale, stale_seq)) => {
                state.stats.dropped += 1;
                trace!(frame = stale_seq, "overwriting unconsumed frame");
                recycle(&mut state.spares, stale.data);
                PublishOutcome::Replaced
            }
            None => PublishOutcome::Fresh,
        }
    }

    /// Take the current frame without blocking.
    pub fn get_available_frame(&self) -> Option<FrameLease> {
        let mut state = self.state.lock().ok()?;
        let (frame, sequence) = state.pending.take()?;
        if !frame.ready {
            recycle(&mut state.spares, frame.data);
            return None;
        }
        state.stats.delivered += 1;
        Some(FrameLease { frame, sequence })
    }

    /// Return a leased frame's buffer to the pool.
    pub fn release_frame(&self, lease: FrameLease) {
        if let Ok(mut state) = self.state.lock() {
            state.stats.released += 1;
            recycle(&mut state.spares, lease.frame.data);
        }
    }

    pub fn stats(&self) -> CaptureStats {
        self.state
            .lock()
            .map(|state| state.stats)
            .unwrap_or_default()
    }

    pub fn has_pending(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.pending.is_some())
            .unwrap_or(false)
    }
}

fn recycle(spares: &mut Vec<Vec<u8>>, buffer: Vec<u8>) {
    if spares.len() < FRAME_BUFFER_COUNT {
        spares.push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u16) -> Frame {
        Frame::uniform(2, 2, tag)
    }

    #[test]
    fn slow_consumer_sees_latest_frame_only() {
        let exchange = FrameExchange::new();
        assert_eq!(exchange.publish(frame(1)), PublishOutcome::Fresh);
        assert_eq!(exchange.publish(frame(2)), PublishOutcome::Replaced);

        let lease = exchange.get_available_frame().unwrap();
        assert_eq!(lease.pixel(0, 0), Some(2));
        assert_eq!(lease.sequence(), 1);
        assert!(exchange.get_available_frame().is_none());

        let stats = exchange.stats();
        assert_eq!(stats.captured, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn released_buffers_are_recycled() {
        let exchange = FrameExchange::new();
        exchange.publish(frame(5));
        let lease = exchange.get_available_frame().unwrap();
        exchange.release_frame(lease);
        assert_eq!(exchange.spare_buffer().map(|b| b.len()), Some(8));
        assert_eq!(exchange.stats().released, 1);
    }

    #[test]
    fn frames_not_ready_are_skipped() {
        let exchange = FrameExchange::new();
        let mut pending = frame(9);
        pending.ready = false;
        exchange.publish(pending);
        assert!(exchange.get_available_frame().is_none());
        assert!(!exchange.has_pending());
    }

    #[test]
    fn sequences_follow_capture_order() {
        let exchange = FrameExchange::new();
        let mut seen = Vec::new();
        for tag in 0..4 {
            exchange.publish(frame(tag));
            let lease = exchange.get_available_frame().unwrap();
            seen.push(lease.sequence());
            exchange.release_frame(lease);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
