use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::wire::WireError;

/// Default accelerator core clock.
pub const DEFAULT_FREQUENCY_HZ: u32 = 1_000_000_000;
/// On-chip memory reserved for model weights and activations.
pub const DEFAULT_MEMORY_BYTES: usize = 2_621_440;
/// Model slots the accelerator can hold at once.
pub const MAX_MODELS: usize = 4;

const MODEL_MAGIC: &[u8; 4] = b"NPUM";
const MODEL_HEADER_LEN: usize = 8;

/// Capability a loaded model provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModelKind {
    TextDetection,
    TextRecognition,
    Preprocessing,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::TextDetection,
        ModelKind::TextRecognition,
        ModelKind::Preprocessing,
    ];

    fn tag(self) -> u8 {
        match self {
            ModelKind::TextDetection => 1,
            ModelKind::TextRecognition => 2,
            ModelKind::Preprocessing => 3,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::TextDetection => "text-detection",
            ModelKind::TextRecognition => "text-recognition",
            ModelKind::Preprocessing => "preprocessing",
        };
        f.write_str(name)
    }
}

/// Opaque reference to a model resident on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelHandle {
    pub kind: ModelKind,
    pub slot: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Precision {
    #[default]
    Int8,
    Int16,
    Float32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcceleratorConfig {
    pub frequency_hz: u32,
    pub memory_bytes: usize,
    pub precision: Precision,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            precision: Precision::Int8,
        }
    }
}

#[derive(Debug, Error)]
pub enum AcceleratorError {
    #[error("accelerator not initialized")]
    NotInitialized,
    #[error("accelerator powered off")]
    PoweredOff,
    #[error("invalid {kind} model image: {reason}")]
    InvalidModel { kind: ModelKind, reason: &'static str },
    #[error("no free model slot")]
    SlotsExhausted,
    #[error("model of {requested} bytes exceeds remaining accelerator memory ({available} bytes)")]
    OutOfMemory { requested: usize, available: usize },
    #[error("model handle {0:?} is not loaded")]
    UnknownModel(ModelHandle),
    #[error("empty input tensor")]
    EmptyInput,
    #[error("output buffer holds {available} bytes, {needed} required")]
    OutputTooSmall { needed: usize, available: usize },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("accelerator fault: {0}")]
    Fault(String),
}

/// Contract every accelerator backend fulfils.
///
/// Calls are serialized by the owner; implementations need not be `Sync`.
pub trait Accelerator: Send {
    fn init(&mut self, config: &AcceleratorConfig) -> Result<(), AcceleratorError>;

    fn is_initialized(&self) -> bool;

    /// Upload a model image and return a handle to it.
    fn load_model(&mut self, kind: ModelKind, data: &[u8])
    -> Result<ModelHandle, AcceleratorError>;

    fn is_model_ready(&self, handle: ModelHandle) -> bool;

    /// Execute `handle` on `input`, writing the model's wire output to `output`.
    fn run(
        &mut self,
        handle: ModelHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), AcceleratorError>;

    /// Busy share of the accelerator, 0..=100.
    fn utilization(&self) -> u8;

    /// Switch the accelerator supply. Powering off discards loaded models.
    fn set_power(&mut self, on: bool) -> Result<(), AcceleratorError>;
}

impl<A: Accelerator + ?Sized> Accelerator for Box<A> {
    fn init(&mut self, config: &AcceleratorConfig) -> Result<(), AcceleratorError> {
        (**self).init(config)
    }

    fn is_initialized(&self) -> bool {
        (**self).is_initialized()
    }

    fn load_model(
        &mut self,
        kind: ModelKind,
        data: &[u8],
    ) -> Result<ModelHandle, AcceleratorError> {
        (**self).load_model(kind, data)
    }

    fn is_model_ready(&self, handle: ModelHandle) -> bool {
        (**self).is_model_ready(handle)
    }

    fn run(
        &mut self,
        handle: ModelHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), AcceleratorError> {
        (**self).run(handle, input, output)
    }

    fn utilization(&self) -> u8 {
        (**self).utilization()
    }

    fn set_power(&mut self, on: bool) -> Result<(), AcceleratorError> {
        (**self).set_power(on)
    }
}

/// Build a minimal model image: magic, kind tag, version, then `weights`.
pub fn model_image(kind: ModelKind, weights: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(MODEL_HEADER_LEN + weights.len());
    image.extend_from_slice(MODEL_MAGIC);
    image.extend_from_slice(&[kind.tag(), 1, 0, 0]);
    image.extend_from_slice(weights);
    image
}

/// Check that `data` is a model image for `kind`.
pub fn validate_image(kind: ModelKind, data: &[u8]) -> Result<(), AcceleratorError> {
    if data.len() < MODEL_HEADER_LEN {
        return Err(AcceleratorError::InvalidModel {
            kind,
            reason: "image shorter than header",
        });
    }
    if &data[..4] != MODEL_MAGIC {
        return Err(AcceleratorError::InvalidModel {
            kind,
            reason: "bad magic",
        });
    }
    if data[4] != kind.tag() {
        return Err(AcceleratorError::InvalidModel {
            kind,
            reason: "image built for a different model kind",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_validation_checks_kind_tag() {
        let image = model_image(ModelKind::TextDetection, &[0; 16]);
        assert!(validate_image(ModelKind::TextDetection, &image).is_ok());
        assert!(matches!(
            validate_image(ModelKind::TextRecognition, &image),
            Err(AcceleratorError::InvalidModel { .. })
        ));
        assert!(validate_image(ModelKind::Preprocessing, b"NPU").is_err());
    }
}
