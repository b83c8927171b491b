//! Inference engine: downsample, detect, recognise, gate.
//!
//! The engine owns the accelerator and borrows every scratch buffer from the
//! shared pool. Buffers are RAII guards, so each exit path (including `?`)
//! hands memory back before the next frame.

use std::{
    fmt::Write as _,
    sync::{Arc, Mutex, MutexGuard},
};

use frame_ingest::{CaptureError, Frame, pack_rgb565};
use npu_runtime::{
    Accelerator, AcceleratorConfig, AcceleratorError, ModelHandle, ModelKind, WireError,
    model_image,
    wire::{self, DETECTION_OUTPUT_LEN, RECOGNITION_OUTPUT_LEN},
};
use pool_alloc::{AllocError, PoolAllocator, PoolStats, ScratchBuffer, SharedClock, SharedPool};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    monitor::{ErrorCode, HealthMonitor, Recoverable, Severity, TaskId},
    ocr::{
        config::{ConfigError, InferenceConfig, MIN_FRAGMENT_CONFIDENCE},
        data::{OcrResult, TextBox, append_fragment},
        language,
        preprocess::{self, PreprocessError},
        stats::{PerformanceStats, TargetReport},
    },
};

/// Arena size handed to the pool allocator.
pub const POOL_CAPACITY_BYTES: usize = 2_621_440;
/// Minimum spacing between performance samples.
pub const PERF_SAMPLE_INTERVAL_MS: u64 = 1_000;
/// Accelerator utilization under this share is reported.
pub const LOW_UTILIZATION_PERCENT: u8 = 50;

const SELF_TEST_BYTES: usize = 64;
const SELF_TEST_PATTERN: u8 = 0xA5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    Loading,
    Ready,
    Inferencing,
    PostProcessing,
    Error,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelfTestError {
    #[error("accelerator is not initialized")]
    NoAccelerator,
    #[error("{0} model is not loaded")]
    ModelNotLoaded(ModelKind),
    #[error("scratch round trip failed: {0}")]
    ScratchAllocation(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("memory pool: {0}")]
    Allocator(#[from] AllocError),
    #[error("accelerator: {0}")]
    Accelerator(#[from] AcceleratorError),
    #[error("failed to load {kind} model: {source}")]
    ModelLoad {
        kind: ModelKind,
        #[source]
        source: AcceleratorError,
    },
    #[error("validation averaged {average_us}us against a {budget_us}us budget")]
    Validation { average_us: u64, budget_us: u64 },
    #[error("malformed model output: {0}")]
    Decode(#[from] WireError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Frame(#[from] CaptureError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("engine is {0:?}, not ready")]
    NotReady(EngineState),
    #[error("self-test: {0}")]
    SelfTest(#[from] SelfTestError),
}

impl InferenceError {
    /// Monitor code this failure is reported under.
    pub fn code(&self) -> ErrorCode {
        match self {
            InferenceError::ModelLoad { .. } => ErrorCode::ModelLoadFailed,
            InferenceError::Validation { .. } => ErrorCode::InferenceTimeout,
            InferenceError::Frame(_) => ErrorCode::CaptureFault,
            _ => ErrorCode::InferenceFailed,
        }
    }

    /// Faults after which the accelerator cannot serve frames until recovered.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            InferenceError::Accelerator(
                AcceleratorError::NotInitialized
                    | AcceleratorError::PoweredOff
                    | AcceleratorError::UnknownModel(_)
            )
        )
    }
}

/// Model images uploaded during `init` and every restart.
#[derive(Clone, Debug)]
pub struct ModelImages {
    pub detection: Vec<u8>,
    pub recognition: Vec<u8>,
    pub preprocessing: Option<Vec<u8>>,
}

impl Default for ModelImages {
    fn default() -> Self {
        Self {
            detection: model_image(ModelKind::TextDetection, &[0x11; 96 * 1024]),
            recognition: model_image(ModelKind::TextRecognition, &[0x22; 64 * 1024]),
            preprocessing: Some(model_image(ModelKind::Preprocessing, &[0x33; 8 * 1024])),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
struct ModelSet {
    detection: Option<ModelHandle>,
    recognition: Option<ModelHandle>,
    preprocessing: Option<ModelHandle>,
}

impl ModelSet {
    fn get(&self, kind: ModelKind) -> Option<ModelHandle> {
        match kind {
            ModelKind::TextDetection => self.detection,
            ModelKind::TextRecognition => self.recognition,
            ModelKind::Preprocessing => self.preprocessing,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub iterations: u32,
    pub average_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub over_budget: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub config: InferenceConfig,
    pub stats: PerformanceStats,
    pub targets: TargetReport,
    pub loaded_models: Vec<String>,
    pub latest_result: Option<OcrResult>,
    pub last_error: Option<String>,
    pub pool: PoolStats,
}

pub struct InferenceEngine<A> {
    accelerator: A,
    pool: SharedPool,
    clock: SharedClock,
    monitor: Arc<HealthMonitor>,
    config: InferenceConfig,
    images: ModelImages,
    models: ModelSet,
    state: EngineState,
    stats: PerformanceStats,
    latest: Option<OcrResult>,
    result_ready: bool,
    last_error: Option<String>,
    last_sample_ms: u64,
    staging: Staging,
}

/// Task-local copies of accelerator input and output.
///
/// The accelerator works on these so the pool lock is never held across a run.
#[derive(Default)]
struct Staging {
    input: Vec<u8>,
    output: Vec<u8>,
}

impl<A: Accelerator> InferenceEngine<A> {
    pub fn new(
        accelerator: A,
        pool: SharedPool,
        clock: SharedClock,
        monitor: Arc<HealthMonitor>,
        config: InferenceConfig,
    ) -> Self {
        Self {
            accelerator,
            pool,
            clock,
            monitor,
            config,
            images: ModelImages::default(),
            models: ModelSet::default(),
            state: EngineState::Idle,
            stats: PerformanceStats::default(),
            latest: None,
            result_ready: false,
            last_error: None,
            last_sample_ms: 0,
            staging: Staging::default(),
        }
    }

    pub fn with_model_images(mut self, images: ModelImages) -> Self {
        self.images = images;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn stats(&self) -> &PerformanceStats {
        &self.stats
    }

    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    pub fn accelerator_mut(&mut self) -> &mut A {
        &mut self.accelerator
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.config.debug = debug;
    }

    pub fn configure(&mut self, config: InferenceConfig) -> Result<(), InferenceError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Bring the pool, accelerator and models up, then prove the latency budget.
    pub fn init(&mut self) -> Result<(), InferenceError> {
        let span = tracing::info_span!(
            "ocr.init",
            width = self.config.camera_width,
            height = self.config.camera_height,
            precision = ?self.config.precision
        );
        let _guard = span.enter();

        let outcome = self
            .config
            .validate()
            .map_err(InferenceError::from)
            .and_then(|()| {
                lock_pool(&self.pool)?.init();
                self.bring_up()
            })
            .and_then(|()| self.validate_latency());
        match outcome {
            Ok(()) => {
                self.stats.reset();
                self.latest = None;
                self.result_ready = false;
                self.last_error = None;
                self.last_sample_ms = self.clock.now_ms();
                info!("inference engine ready");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Accelerator init plus model upload, leaving the engine Ready.
    fn bring_up(&mut self) -> Result<(), InferenceError> {
        self.state = EngineState::Loading;
        self.models = ModelSet::default();
        let accel_config = AcceleratorConfig {
            precision: self.config.precision,
            ..AcceleratorConfig::default()
        };
        self.accelerator.init(&accel_config)?;

        self.models.detection = Some(self.load(ModelKind::TextDetection)?);
        self.models.recognition = Some(self.load(ModelKind::TextRecognition)?);
        if self.images.preprocessing.is_some() {
            match self.load(ModelKind::Preprocessing) {
                Ok(handle) => self.models.preprocessing = Some(handle),
                Err(err) => warn!("continuing without preprocessing model: {err}"),
            }
        }
        self.state = EngineState::Ready;
        Ok(())
    }

    fn load(&mut self, kind: ModelKind) -> Result<ModelHandle, InferenceError> {
        let image = match kind {
            ModelKind::TextDetection => Some(&self.images.detection),
            ModelKind::TextRecognition => Some(&self.images.recognition),
            ModelKind::Preprocessing => self.images.preprocessing.as_ref(),
        };
        let Some(image) = image else {
            return Err(InferenceError::ModelLoad {
                kind,
                source: AcceleratorError::InvalidModel {
                    kind,
                    reason: "no image supplied",
                },
            });
        };
        self.accelerator
            .load_model(kind, image)
            .map_err(|source| InferenceError::ModelLoad { kind, source })
    }

    fn validate_latency(&mut self) -> Result<(), InferenceError> {
        let gray = pack_rgb565(16, 32, 16);
        let frame = Frame::uniform(self.config.camera_width, self.config.camera_height, gray);
        let iterations = self.config.validation_iterations.max(1);
        let mut total_us = 0u64;
        for _ in 0..iterations {
            let (_, elapsed) = self.execute(&frame)?;
            total_us += elapsed;
        }
        let average_us = total_us / u64::from(iterations);
        debug!(average_us, iterations, "validation pass complete");
        if average_us > self.config.max_inference_time_us {
            return Err(InferenceError::Validation {
                average_us,
                budget_us: self.config.max_inference_time_us,
            });
        }
        Ok(())
    }

    fn fail(&mut self, err: InferenceError) -> InferenceError {
        self.state = EngineState::Error;
        self.last_error = Some(err.to_string());
        err
    }

    /// Run one frame and time it, without touching the statistics.
    fn execute(&mut self, frame: &Frame) -> Result<(OcrResult, u64), InferenceError> {
        if self.state != EngineState::Ready {
            return Err(InferenceError::NotReady(self.state));
        }
        frame.validate()?;
        let started = self.clock.now_us();
        self.state = EngineState::Inferencing;
        match self.infer(frame) {
            Ok(mut result) => {
                self.state = EngineState::PostProcessing;
                let elapsed = self.clock.now_us().saturating_sub(started);
                result.processing_time_us = elapsed;
                self.state = EngineState::Ready;
                Ok((result, elapsed))
            }
            Err(err) if err.is_fatal() => Err(self.fail(err)),
            Err(err) => {
                self.state = EngineState::Ready;
                Err(err)
            }
        }
    }

    fn infer(&mut self, frame: &Frame) -> Result<OcrResult, InferenceError> {
        let pool = Arc::clone(&self.pool);
        let detection = self
            .models
            .detection
            .ok_or(SelfTestError::ModelNotLoaded(ModelKind::TextDetection))?;
        let recognition = self
            .models
            .recognition
            .ok_or(SelfTestError::ModelNotLoaded(ModelKind::TextRecognition))?;

        let (width, height) = preprocess::downsampled_dims(frame.width, frame.height);
        let image_len = preprocess::image_bytes(width, height);
        let image = ScratchBuffer::acquire(&pool, image_len)?;
        image.with_mut(|dst| preprocess::downsample_rgb565(&frame.data, frame.width, frame.height, dst))??;

        let enhanced = match self.models.preprocessing {
            Some(handle) => {
                let out = ScratchBuffer::acquire(&pool, image_len)?;
                self.run_model(handle, &image, &out)?;
                Some(out)
            }
            None => None,
        };
        let source = enhanced.as_ref().unwrap_or(&image);

        let detections = ScratchBuffer::acquire(&pool, DETECTION_OUTPUT_LEN)?;
        self.run_model(detection, source, &detections)?;
        let regions = detections.with(wire::decode_regions)??;
        drop(detections);

        let mut text = String::new();
        let mut boxes = Vec::new();
        let mut confidence_sum = 0.0f32;
        for region in regions {
            let text_box = TextBox {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                confidence: region.confidence,
                orientation: region.orientation.into(),
            };
            let Some(window) = preprocess::clamp_region(&text_box, width, height) else {
                continue;
            };

            let crop = ScratchBuffer::acquire(&pool, preprocess::image_bytes(window.2, window.3))?;
            source.with_pair(&crop, |src, dst| preprocess::crop_rgb565(src, width, window, dst))??;
            let answer = ScratchBuffer::acquire(&pool, RECOGNITION_OUTPUT_LEN)?;
            self.run_model(recognition, &crop, &answer)?;
            let fragment = answer.with(wire::decode_fragment)??;

            if fragment.confidence < MIN_FRAGMENT_CONFIDENCE || fragment.text.is_empty() {
                continue;
            }
            let complete = append_fragment(&mut text, &fragment.text);
            confidence_sum += fragment.confidence;
            boxes.push(text_box);
            if !complete {
                break;
            }
        }

        if boxes.is_empty() {
            return Ok(OcrResult::empty(frame.timestamp_ms));
        }
        let confidence = (confidence_sum / boxes.len() as f32).clamp(0.0, 1.0);
        Ok(OcrResult {
            char_count: text.chars().filter(|c| !c.is_whitespace()).count(),
            word_count: text.split_whitespace().count(),
            language: language::classify(&text),
            text,
            confidence,
            boxes,
            frame_timestamp_ms: frame.timestamp_ms,
            processing_time_us: 0,
        })
    }

    fn run_model(
        &mut self,
        handle: ModelHandle,
        src: &ScratchBuffer<'_>,
        dst: &ScratchBuffer<'_>,
    ) -> Result<(), InferenceError> {
        let Staging { input, output } = &mut self.staging;
        src.read_into(input)?;
        output.clear();
        output.resize(dst.len(), 0);
        self.accelerator.run(handle, input, output)?;
        dst.write_from(output)?;
        Ok(())
    }

    /// Run `frame` through the models and update statistics and gating counters.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<OcrResult, InferenceError> {
        let span = tracing::info_span!(
            "ocr.frame",
            timestamp = frame.timestamp_ms,
            latency_us = tracing::field::Empty,
            confidence = tracing::field::Empty
        );
        let _guard = span.enter();

        let (result, elapsed_us) = match self.execute(frame) {
            Ok(done) => done,
            Err(err) => {
                self.stats.total_inferences += 1;
                self.stats.record_failure();
                self.last_error = Some(err.to_string());
                metrics::counter!("ocr_frames_total", "outcome" => "error").increment(1);
                return Err(err);
            }
        };
        span.record("latency_us", elapsed_us);
        span.record("confidence", result.confidence);

        self.stats.record_timing(elapsed_us);
        metrics::histogram!("ocr_inference_latency_seconds").record(elapsed_us as f64 / 1e6);
        if elapsed_us > self.config.max_inference_time_us {
            self.stats.deadline_misses += 1;
            self.monitor.report_overrun(
                TaskId::Inference,
                ErrorCode::InferenceTimeout,
                format!(
                    "inference took {elapsed_us}us, budget {}us",
                    self.config.max_inference_time_us
                ),
                elapsed_us,
            );
        }

        let outcome = if result.is_empty() {
            self.stats.record_failure();
            "empty"
        } else {
            self.stats.record_success(result.confidence);
            if self.should_forward(&result) {
                "forwarded"
            } else {
                self.stats.low_confidence_count += 1;
                "low_confidence"
            }
        };
        metrics::counter!("ocr_frames_total", "outcome" => outcome).increment(1);
        if self.config.debug {
            info!(
                text = %result.text,
                confidence = result.confidence,
                language = ?result.language,
                latency_us = elapsed_us,
                outcome,
                "frame processed"
            );
        }

        self.latest = Some(result.clone());
        self.result_ready = true;
        Ok(result)
    }

    /// Whether `result` clears the confidence gate.
    pub fn should_forward(&self, result: &OcrResult) -> bool {
        !result.is_empty() && result.confidence >= self.config.confidence_threshold
    }

    /// One inference task cycle: process, report to the monitor, recover if needed.
    ///
    /// Returns the result only when it should reach the consumers.
    pub fn run_cycle(&mut self, frame: &Frame) -> Option<OcrResult> {
        let forwarded = match self.process_frame(frame) {
            Ok(result) => {
                self.monitor.report_success(TaskId::Inference);
                self.should_forward(&result).then_some(result)
            }
            Err(err) => {
                let monitor = Arc::clone(&self.monitor);
                if monitor.report_error(TaskId::Inference, err.code(), err.to_string()) {
                    let outcome = monitor.recover(TaskId::Inference, self);
                    debug!(?outcome, "inference recovery finished");
                }
                None
            }
        };
        self.sample_performance();
        forwarded
    }

    /// Refresh utilization and pool figures, at most once per interval.
    pub fn sample_performance(&mut self) {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_sample_ms) < PERF_SAMPLE_INTERVAL_MS {
            return;
        }
        self.last_sample_ms = now;
        self.stats.accelerator_utilization = self.accelerator.utilization();
        if let Ok(pool) = self.pool.lock() {
            self.stats.record_memory(&pool.stats());
        }
        metrics::gauge!("ocr_accelerator_utilization_percent")
            .set(f64::from(self.stats.accelerator_utilization));
        metrics::gauge!("ocr_pool_used_bytes").set(self.stats.current_memory_bytes as f64);

        if self.stats.total_inferences > 0
            && self.stats.accelerator_utilization < LOW_UTILIZATION_PERCENT
        {
            warn!(
                utilization = self.stats.accelerator_utilization,
                "accelerator under-utilised"
            );
            self.monitor.log_error(
                Severity::Info,
                TaskId::Inference,
                ErrorCode::LowUtilization,
                format!(
                    "accelerator utilization {}%",
                    self.stats.accelerator_utilization
                ),
                u64::from(self.stats.accelerator_utilization),
            );
        }
    }

    /// Newest result, clearing the ready flag.
    pub fn latest_result(&mut self) -> Option<OcrResult> {
        self.result_ready = false;
        self.latest.clone()
    }

    pub fn is_result_ready(&self) -> bool {
        self.result_ready
    }

    pub fn check_targets(&self) -> TargetReport {
        self.stats.check_targets(&self.config)
    }

    pub fn self_test(&mut self) -> Result<(), SelfTestError> {
        if !self.accelerator.is_initialized() {
            return Err(SelfTestError::NoAccelerator);
        }
        for kind in [ModelKind::TextDetection, ModelKind::TextRecognition] {
            match self.models.get(kind) {
                Some(handle) if self.accelerator.is_model_ready(handle) => {}
                _ => return Err(SelfTestError::ModelNotLoaded(kind)),
            }
        }

        let scratch = ScratchBuffer::acquire(&self.pool, SELF_TEST_BYTES)
            .map_err(|err| SelfTestError::ScratchAllocation(err.to_string()))?;
        let intact = scratch
            .with_mut(|bytes| {
                bytes.fill(SELF_TEST_PATTERN);
                bytes.iter().all(|&b| b == SELF_TEST_PATTERN)
            })
            .map_err(|err| SelfTestError::ScratchAllocation(err.to_string()))?;
        if !intact {
            return Err(SelfTestError::ScratchAllocation(
                "pattern did not read back".into(),
            ));
        }
        Ok(())
    }

    /// Time `iterations` runs of `frame` without touching the statistics.
    pub fn benchmark(
        &mut self,
        frame: &Frame,
        iterations: u32,
    ) -> Result<BenchmarkReport, InferenceError> {
        let iterations = iterations.max(1);
        let mut total = 0u64;
        let mut min_us = u64::MAX;
        let mut max_us = 0u64;
        let mut over_budget = 0u32;
        for _ in 0..iterations {
            let (_, elapsed) = self.execute(frame)?;
            total += elapsed;
            min_us = min_us.min(elapsed);
            max_us = max_us.max(elapsed);
            if elapsed > self.config.max_inference_time_us {
                over_budget += 1;
            }
        }
        Ok(BenchmarkReport {
            iterations,
            average_us: total / u64::from(iterations),
            min_us,
            max_us,
            over_budget,
        })
    }

    /// Power the accelerator down and return to Idle.
    pub fn shutdown(&mut self) {
        if let Err(err) = self.accelerator.set_power(false) {
            warn!("accelerator power-down failed: {err}");
        }
        self.models = ModelSet::default();
        self.state = EngineState::Idle;
        info!(
            total = self.stats.total_inferences,
            successful = self.stats.successful_inferences,
            "inference engine shut down"
        );
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let pool = match self.pool.lock() {
            Ok(pool) => pool.stats(),
            Err(_) => PoolStats::default(),
        };
        EngineSnapshot {
            state: self.state,
            config: self.config.clone(),
            stats: self.stats.clone(),
            targets: self.check_targets(),
            loaded_models: ModelKind::ALL
                .into_iter()
                .filter(|kind| {
                    self.models
                        .get(*kind)
                        .is_some_and(|handle| self.accelerator.is_model_ready(handle))
                })
                .map(|kind| kind.to_string())
                .collect(),
            latest_result: self.latest.clone(),
            last_error: self.last_error.clone(),
            pool,
        }
    }

    /// Human-readable engine state for the debug console.
    pub fn dump_state(&self) -> String {
        let snapshot = self.snapshot();
        let stats = &snapshot.stats;
        let mut out = String::new();
        let _ = writeln!(out, "engine state: {:?}", snapshot.state);
        let _ = writeln!(
            out,
            "models: {}",
            if snapshot.loaded_models.is_empty() {
                "none".to_string()
            } else {
                snapshot.loaded_models.join(", ")
            }
        );
        let _ = writeln!(
            out,
            "inferences: {} total, {} ok, {} failed, {} low confidence, {} over budget",
            stats.total_inferences,
            stats.successful_inferences,
            stats.failed_inferences,
            stats.low_confidence_count,
            stats.deadline_misses
        );
        let _ = writeln!(
            out,
            "latency: avg {:.0}us min {} max {}us last {}us (budget {}us)",
            stats.avg_inference_time_us,
            stats
                .min_inference_time_us
                .map_or_else(|| "-".to_string(), |us| format!("{us}us")),
            stats.max_inference_time_us,
            stats.last_inference_time_us,
            snapshot.config.max_inference_time_us
        );
        let _ = writeln!(
            out,
            "confidence: avg {:.3} (threshold {:.2}), accuracy {:.1}%",
            stats.avg_confidence, snapshot.config.confidence_threshold, stats.character_accuracy
        );
        let _ = writeln!(
            out,
            "pool: {} / {} bytes (peak {}), {} leaks",
            snapshot.pool.used_bytes(),
            snapshot.pool.capacity,
            snapshot.pool.peak_bytes(),
            snapshot.pool.leak_count
        );
        let _ = writeln!(
            out,
            "targets: latency {} accuracy {} confidence {}",
            snapshot.targets.latency_met,
            snapshot.targets.accuracy_met,
            snapshot.targets.confidence_met
        );
        if let Some(result) = &snapshot.latest_result {
            let _ = writeln!(
                out,
                "latest: {:?} ({:.3}, {:?})",
                result.text, result.confidence, result.language
            );
        }
        if let Some(err) = &snapshot.last_error {
            let _ = writeln!(out, "last error: {err}");
        }
        out
    }

    fn power_cycle(&mut self) -> Result<(), InferenceError> {
        self.accelerator.set_power(false)?;
        self.accelerator.set_power(true)?;
        Ok(())
    }
}

fn lock_pool(pool: &Mutex<PoolAllocator>) -> Result<MutexGuard<'_, PoolAllocator>, AllocError> {
    pool.lock().map_err(|_| AllocError::Poisoned)
}

impl<A: Accelerator> Recoverable for InferenceEngine<A> {
    fn restart(&mut self) -> anyhow::Result<()> {
        info!("restarting inference engine");
        let outcome = self.power_cycle().and_then(|()| self.bring_up());
        match outcome {
            Ok(()) => {
                self.stats.reset();
                self.last_error = None;
                Ok(())
            }
            Err(err) => Err(self.fail(err).into()),
        }
    }

    fn reset_subsystem(&mut self) -> anyhow::Result<()> {
        info!("resetting inference subsystem");
        lock_pool(&self.pool)?.init();
        self.restart()
    }

    fn self_test(&mut self) -> anyhow::Result<()> {
        InferenceEngine::self_test(self).map_err(|err| {
            self.state = EngineState::Error;
            self.last_error = Some(err.to_string());
            err.into()
        })
    }

    fn emergency_stop(&mut self) {
        warn!("emergency stop: powering accelerator down");
        if let Err(err) = self.accelerator.set_power(false) {
            warn!("accelerator power-down failed: {err}");
        }
        self.models = ModelSet::default();
        self.state = EngineState::Error;
    }
}

#[cfg(test)]
mod tests {
    use npu_runtime::{Script, SimulatedAccelerator};
    use pool_alloc::ManualClock;

    use super::*;

    fn engine() -> InferenceEngine<SimulatedAccelerator> {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let pool = PoolAllocator::shared(POOL_CAPACITY_BYTES, clock.clone()).unwrap();
        let monitor = HealthMonitor::shared(clock.clone());
        let accelerator = SimulatedAccelerator::new(Script::sample_page(), clock.clone());
        let config = InferenceConfig {
            camera_width: 320,
            camera_height: 240,
            validation_iterations: 2,
            ..InferenceConfig::default()
        };
        InferenceEngine::new(accelerator, pool, clock, monitor, config)
    }

    #[test]
    fn init_reaches_ready_with_clean_stats() {
        let mut engine = engine();
        engine.init().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.stats().total_inferences, 0);
        assert!(engine.self_test().is_ok());
    }

    #[test]
    fn sample_page_is_read_and_forwarded() {
        let mut engine = engine();
        engine.init().unwrap();
        let frame = Frame::uniform(320, 240, 0xFFFF);
        let result = engine.run_cycle(&frame).expect("forwarded");
        assert_eq!(result.text, "EXIT GATE 12");
        assert_eq!(result.word_count, 3);
        assert_eq!(result.boxes.len(), 2);
        assert!(engine.is_result_ready());
        assert_eq!(engine.pool().lock().unwrap().live_blocks(), 0);
    }

    #[test]
    fn self_test_reports_missing_accelerator() {
        let mut engine = engine();
        assert_eq!(engine.self_test(), Err(SelfTestError::NoAccelerator));
    }

    #[test]
    fn process_before_init_is_rejected() {
        let mut engine = engine();
        let frame = Frame::uniform(320, 240, 0);
        assert!(matches!(
            engine.process_frame(&frame),
            Err(InferenceError::NotReady(EngineState::Idle))
        ));
    }

    #[test]
    fn dump_state_mentions_models() {
        let mut engine = engine();
        engine.init().unwrap();
        let dump = engine.dump_state();
        assert!(dump.contains("text-detection"));
        assert!(dump.contains("engine state: Ready"));
        assert!(dump.contains("min -"));

        engine.run_cycle(&Frame::uniform(320, 240, 0xFFFF));
        let timed = engine.snapshot().stats.min_inference_time_us;
        assert!(timed.is_some());
        assert!(!engine.dump_state().contains("min -"));
    }
}
