//! Configuration for the inference engine and the pipeline around it.
//!
//! CLI arguments are parsed by clap into `*Args` structs and converted into
//! validated configs so downstream stages never re-check flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use frame_ingest::{CAPTURE_PERIOD, SENSOR_HEIGHT, SENSOR_WIDTH};
use npu_runtime::Precision;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.95;
pub const DEFAULT_MAX_INFERENCE_US: u64 = 8_000;
pub const DEFAULT_VALIDATION_ITERATIONS: u32 = 10;
/// Fragments below this recognition confidence are discarded.
pub const MIN_FRAGMENT_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("confidence threshold {0} outside [0, 1]")]
    Threshold(f32),
    #[error("maximum inference time must be positive")]
    ZeroBudget,
    #[error("camera dimensions {width}x{height} must be even and non-zero")]
    Dimensions { width: u32, height: u32 },
    #[error("validation needs at least one iteration")]
    ZeroValidation,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
/// Tunables owned by the inference engine.
pub struct InferenceConfig {
    /// Results below this confidence are not forwarded to the consumers.
    pub confidence_threshold: f32,
    /// Per-frame latency budget in microseconds.
    pub max_inference_time_us: u64,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Gray frames pushed through the models during `init`.
    pub validation_iterations: u32,
    pub precision: Precision,
    pub debug: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_inference_time_us: DEFAULT_MAX_INFERENCE_US,
            camera_width: SENSOR_WIDTH,
            camera_height: SENSOR_HEIGHT,
            validation_iterations: DEFAULT_VALIDATION_ITERATIONS,
            precision: Precision::Int8,
            debug: false,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Threshold(self.confidence_threshold));
        }
        if self.max_inference_time_us == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        if self.camera_width < 2
            || self.camera_height < 2
            || self.camera_width % 2 != 0
            || self.camera_height % 2 != 0
        {
            return Err(ConfigError::Dimensions {
                width: self.camera_width,
                height: self.camera_height,
            });
        }
        if self.validation_iterations == 0 {
            return Err(ConfigError::ZeroValidation);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and metrics export.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Print the Prometheus snapshot when the pipeline stops.
    pub print_metrics: bool,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every pipeline task.
pub struct PipelineConfig {
    pub inference: InferenceConfig,
    /// Simulated time the accelerator spends per model run.
    pub accelerator_latency: Duration,
    pub capture_period: Duration,
    /// Stop on its own after this long; runs until Ctrl+C otherwise.
    pub run_for: Option<Duration>,
    /// Stop capturing after this many frames.
    pub frame_limit: Option<u64>,
    /// Supervisor restarts allowed before giving up.
    pub max_restarts: u32,
    /// Sleep through Morse pulses as the solenoid would.
    pub realtime_actuation: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PrecisionArg {
    Int8,
    Int16,
    Float32,
}

impl From<PrecisionArg> for Precision {
    fn from(arg: PrecisionArg) -> Self {
        match arg {
            PrecisionArg::Int8 => Precision::Int8,
            PrecisionArg::Int16 => Precision::Int16,
            PrecisionArg::Float32 => Precision::Float32,
        }
    }
}

/// Engine flags shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Minimum confidence for a result to be spoken and tapped out.
    #[arg(long = "threshold", value_name = "0..1", default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
    pub threshold: f32,
    /// Per-frame latency budget in microseconds.
    #[arg(long = "max-latency-us", value_name = "US", default_value_t = DEFAULT_MAX_INFERENCE_US)]
    pub max_latency_us: u64,
    /// Simulated accelerator time per model run, in microseconds.
    #[arg(long = "accelerator-latency-us", value_name = "US", default_value_t = 1_500)]
    pub accelerator_latency_us: u64,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = SENSOR_WIDTH)]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = SENSOR_HEIGHT)]
    pub height: u32,
    /// Accelerator arithmetic precision.
    #[arg(long = "precision", value_enum, default_value = "int8")]
    pub precision: PrecisionArg,
    /// Log every frame's result.
    #[arg(long = "debug", action = clap::ArgAction::SetTrue)]
    pub debug: bool,
}

impl TryFrom<&EngineArgs> for InferenceConfig {
    type Error = anyhow::Error;

    fn try_from(args: &EngineArgs) -> Result<Self> {
        let config = InferenceConfig {
            confidence_threshold: args.threshold,
            max_inference_time_us: args.max_latency_us,
            camera_width: args.width,
            camera_height: args.height,
            validation_iterations: DEFAULT_VALIDATION_ITERATIONS,
            precision: args.precision.into(),
            debug: args.debug,
        };
        config.validate()?;
        Ok(config)
    }
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub engine: EngineArgs,
    /// Stop after this many milliseconds.
    #[arg(long = "duration-ms", value_name = "MS")]
    pub duration_ms: Option<u64>,
    /// Capture period in milliseconds.
    #[arg(long = "capture-period-ms", value_name = "MS")]
    pub capture_period_ms: Option<u64>,
    /// Stop after capturing this many frames.
    #[arg(long = "frames", value_name = "N")]
    pub frames: Option<u64>,
    /// Play Morse output in real time instead of accounting it.
    #[arg(long = "realtime-actuation", action = clap::ArgAction::SetTrue)]
    pub realtime_actuation: bool,
    /// Supervisor restarts allowed before giving up.
    #[arg(long = "max-restarts", value_name = "N", default_value_t = 5)]
    pub max_restarts: u32,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Print Prometheus metrics on exit.
    #[arg(long = "metrics", action = clap::ArgAction::SetTrue)]
    pub metrics: bool,
}

impl TryFrom<RunArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        let inference = InferenceConfig::try_from(&args.engine)?;

        let capture_period = match args.capture_period_ms {
            Some(0) => bail!("--capture-period-ms must be at least 1"),
            Some(ms) => Duration::from_millis(ms),
            None => CAPTURE_PERIOD,
        };
        if args.duration_ms == Some(0) {
            bail!("--duration-ms must be at least 1");
        }
        if args.frames == Some(0) {
            bail!("--frames must be at least 1");
        }

        Ok(Self {
            inference,
            accelerator_latency: Duration::from_micros(args.engine.accelerator_latency_us),
            capture_period,
            run_for: args.duration_ms.map(Duration::from_millis),
            frame_limit: args.frames,
            max_restarts: args.max_restarts,
            realtime_actuation: args.realtime_actuation,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                print_metrics: args.metrics,
            },
        })
    }
}
