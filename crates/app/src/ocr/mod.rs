//! Real-time OCR inference pipeline.
//!
//! The module is split into focused submodules:
//! - `config`: CLI arguments and the validated configs built from them.
//! - `data`: results and text boxes passed between stages.
//! - `preprocess`: RGB565 to normalized model input.
//! - `language`: script classification of recognized text.
//! - `stats`: latency and accuracy bookkeeping.
//! - `processing`: the inference engine driving the accelerator.
//! - `channels`: bounded result queues towards the consumers.
//! - `pipeline`: task wiring and the restart supervisor.
//! - `telemetry`: tracing subscribers and Prometheus export.

pub use config::{EngineArgs, InferenceConfig, PipelineConfig, RunArgs, TelemetryOptions};
pub use data::{Language, OcrResult, Orientation, TextBox};
pub use pipeline::{PipelineContext, RunReport, Stages, run, supervise};
pub use processing::{
    BenchmarkReport, EngineSnapshot, EngineState, InferenceEngine, InferenceError, ModelImages,
    SelfTestError,
};

pub mod channels;
pub mod config;
pub mod data;
pub mod language;
pub mod pipeline;
pub mod preprocess;
pub mod processing;
pub mod stats;
pub mod telemetry;
