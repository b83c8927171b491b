//! Bounded FIFO queues carrying results from inference to the consumers.

use std::{
    mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::ocr::data::{MAX_TEXT_BYTES, OcrResult};

/// Results buffered per consumer before new ones are dropped.
pub const RESULT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("result queue closed")]
pub struct QueueClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queue full; the result was discarded and counted.
    Dropped,
    /// Consumer is gone.
    Closed,
}

/// Producer half of a result queue.
#[derive(Clone)]
pub struct ResultQueue {
    name: &'static str,
    tx: Sender<OcrResult>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half of a result queue.
pub struct ResultReceiver {
    name: &'static str,
    rx: Receiver<OcrResult>,
}

impl ResultQueue {
    pub fn bounded(name: &'static str) -> (ResultQueue, ResultReceiver) {
        let (tx, rx) = crossbeam_channel::bounded(RESULT_QUEUE_DEPTH);
        (
            ResultQueue {
                name,
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            ResultReceiver { name, rx },
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, result: OcrResult) -> Enqueue {
        let outcome = match self.tx.try_send(result) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ocr_queue_dropped_total", "queue" => self.name).increment(1);
                Enqueue::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Enqueue::Closed,
        };
        metrics::gauge!("ocr_queue_depth", "queue" => self.name).set(self.tx.len() as f64);
        outcome
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ResultReceiver {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait up to `timeout` for the next result.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<OcrResult>, QueueClosed> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(Some(result)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueClosed),
        }
    }

    pub fn try_recv(&self) -> Option<OcrResult> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Upper bound on memory held by queued results, text included.
    pub fn backlog_bytes(&self) -> usize {
        self.rx.len() * (mem::size_of::<OcrResult>() + MAX_TEXT_BYTES)
    }}
