//! Accelerator contract for the OCR stage: model capabilities, the
//! `Accelerator` trait, model output wire layouts, and a scripted backend.

pub mod model;
pub mod simulated;
pub mod wire;

pub use model::{
    Accelerator, AcceleratorConfig, AcceleratorError, DEFAULT_MEMORY_BYTES, ModelHandle,
    ModelKind, Precision, model_image, validate_image,
};
pub use simulated::{Script, SimulatedAccelerator};
pub use wire::{Fragment, RegionRecord, WireError};
