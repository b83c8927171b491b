//! Scripted accelerator used when no hardware is attached.

use std::{thread, time::Duration};

use pool_alloc::SharedClock;
use tracing::{debug, trace};

use crate::{
    model::{
        Accelerator, AcceleratorConfig, AcceleratorError, MAX_MODELS, ModelHandle, ModelKind,
        validate_image,
    },
    wire::{self, Fragment, RegionRecord},
};

/// What the simulated models "see" in every frame.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub regions: Vec<RegionRecord>,
    /// Recognition answers, handed out round-robin per region.
    pub fragments: Vec<Fragment>,
}

impl Script {
    /// Two lines of high-confidence English text.
    pub fn sample_page() -> Self {
        let line = |y: u16| RegionRecord {
            x: 24,
            y,
            width: 96,
            height: 16,
            confidence: 0.97,
            orientation: 0,
        };
        Self {
            regions: vec![line(40), line(80)],
            fragments: vec![
                Fragment {
                    confidence: 0.98,
                    text: "EXIT".into(),
                },
                Fragment {
                    confidence: 0.97,
                    text: "GATE 12".into(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadedModel {
    kind: ModelKind,
    bytes: usize,
}

pub struct SimulatedAccelerator {
    script: Script,
    clock: SharedClock,
    latency: Duration,
    config: Option<AcceleratorConfig>,
    powered: bool,
    slots: [Option<LoadedModel>; MAX_MODELS],
    next_fragment: usize,
    busy_us: u64,
    started_us: u64,
    failures_pending: u32,
    runs: u64,
}

impl SimulatedAccelerator {
    pub fn new(script: Script, clock: SharedClock) -> Self {
        let started_us = clock.now_us();
        Self {
            script,
            clock,
            latency: Duration::ZERO,
            config: None,
            powered: true,
            slots: [None; MAX_MODELS],
            next_fragment: 0,
            busy_us: 0,
            started_us,
            failures_pending: 0,
            runs: 0,
        }
    }

    /// Sleep this long inside every `run`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` runs fail with a fault.
    pub fn fail_next_runs(&mut self, count: u32) {
        self.failures_pending = count;
    }

    pub fn set_script(&mut self, script: Script) {
        self.script = script;
        self.next_fragment = 0;
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    fn loaded(&self, handle: ModelHandle) -> Option<LoadedModel> {
        self.slots
            .get(handle.slot as usize)
            .copied()
            .flatten()
            .filter(|model| model.kind == handle.kind)
    }

    fn resident_bytes(&self) -> usize {
        self.slots.iter().flatten().map(|model| model.bytes).sum()
    }

    fn ensure_live(&self) -> Result<&AcceleratorConfig, AcceleratorError> {
        if !self.powered {
            return Err(AcceleratorError::PoweredOff);
        }
        self.config.as_ref().ok_or(AcceleratorError::NotInitialized)
    }
}

impl Accelerator for SimulatedAccelerator {
    fn init(&mut self, config: &AcceleratorConfig) -> Result<(), AcceleratorError> {
        if !self.powered {
            return Err(AcceleratorError::PoweredOff);
        }
        debug!(
            frequency_hz = config.frequency_hz,
            memory_bytes = config.memory_bytes,
            precision = ?config.precision,
            "simulated accelerator up"
        );
        self.config = Some(*config);
        self.busy_us = 0;
        self.started_us = self.clock.now_us();
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.powered && self.config.is_some()
    }

    fn load_model(
        &mut self,
        kind: ModelKind,
        data: &[u8],
    ) -> Result<ModelHandle, AcceleratorError> {
        let memory = self.ensure_live()?.memory_bytes;
        validate_image(kind, data)?;

        // Reloading a kind replaces its slot.
        if let Some(slot) = self.slots.iter().position(|s| s.is_some_and(|m| m.kind == kind)) {
            self.slots[slot] = None;
        }
        let available = memory.saturating_sub(self.resident_bytes());
        if data.len() > available {
            return Err(AcceleratorError::OutOfMemory {
                requested: data.len(),
                available,
            });
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(AcceleratorError::SlotsExhausted)?;
        self.slots[slot] = Some(LoadedModel {
            kind,
            bytes: data.len(),
        });
        debug!(%kind, slot, bytes = data.len(), "model loaded");
        Ok(ModelHandle {
            kind,
            slot: slot as u8,
        })
    }

    fn is_model_ready(&self, handle: ModelHandle) -> bool {
        self.is_initialized() && self.loaded(handle).is_some()
    }

    fn run(
        &mut self,
        handle: ModelHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), AcceleratorError> {
        self.ensure_live()?;
        let model = self
            .loaded(handle)
            .ok_or(AcceleratorError::UnknownModel(handle))?;
        if input.is_empty() {
            return Err(AcceleratorError::EmptyInput);
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.runs += 1;
        self.busy_us += self.latency.as_micros() as u64;

        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(AcceleratorError::Fault(format!(
                "injected failure on {}",
                model.kind
            )));
        }

        match model.kind {
            ModelKind::TextDetection => {
                wire::encode_regions(&self.script.regions, output)?;
            }
            ModelKind::TextRecognition => {
                let fragment = if self.script.fragments.is_empty() {
                    None
                } else {
                    let at = self.next_fragment % self.script.fragments.len();
                    self.next_fragment += 1;
                    self.script.fragments.get(at)
                };
                match fragment {
                    Some(f) => wire::encode_fragment(f.confidence, &f.text, output)?,
                    None => wire::encode_fragment(0.0, "", output)?,
                };
            }
            ModelKind::Preprocessing => {
                if output.len() < input.len() {
                    return Err(AcceleratorError::OutputTooSmall {
                        needed: input.len(),
                        available: output.len(),
                    });
                }
                output[..input.len()].copy_from_slice(input);
            }
        }
        trace!(kind = %model.kind, "run complete");
        Ok(())
    }

    fn utilization(&self) -> u8 {
        let elapsed = self.clock.now_us().saturating_sub(self.started_us);
        if elapsed == 0 {
            return 0;
        }
        (self.busy_us.saturating_mul(100) / elapsed).min(100) as u8
    }

    fn set_power(&mut self, on: bool) -> Result<(), AcceleratorError> {
        if !on {
            self.config = None;
            self.slots = [None; MAX_MODELS];
            self.next_fragment = 0;
        }
        self.powered = on;
        debug!(on, "accelerator power switched");
        Ok(())
    }
}
