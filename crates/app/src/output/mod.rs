//! Consumers of accepted OCR results.
//!
//! - `speech`: synthesizer re-gating results before handing them to a sink.
//! - `tactile`: Morse encoder, solenoid driver contract and the actuator
//!   with its priority override.

pub mod speech;
pub mod tactile;

pub use speech::{LogSink, SpeechError, SpeechOutcome, SpeechSink, Synthesizer};
pub use tactile::{
    Actuator, ActuatorError, MorseTiming, PlayOutcome, PriorityHandle, SimulatedSolenoid,
    TactileDriver,
};
