#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use edge_ocr::{
    monitor::{HealthMonitor, SensorProbe},
    ocr::{InferenceConfig, InferenceEngine, processing::POOL_CAPACITY_BYTES},
    output::{ActuatorError, TactileDriver},
};
use npu_runtime::{
    Accelerator, AcceleratorConfig, AcceleratorError, Fragment, ModelHandle, ModelKind,
    RegionRecord, Script, SimulatedAccelerator,
};
use pool_alloc::{ManualClock, PoolAllocator, SharedClock};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

/// Knobs a test turns while the engine owns the accelerator.
#[derive(Debug)]
pub struct MockControl {
    /// Simulated time one detection run takes.
    pub detection_us: u64,
    /// Runs that fail with a fault before normal service resumes.
    pub fail_runs: u32,
    /// Report every model as missing, failing the self-test.
    pub models_missing: bool,
    pub script: Option<Script>,
}

impl Default for MockControl {
    fn default() -> Self {
        Self {
            detection_us: 2_000,
            fail_runs: 0,
            models_missing: false,
            script: None,
        }
    }
}

/// Scripted accelerator that advances a manual clock while it runs.
pub struct MockAccelerator {
    inner: SimulatedAccelerator,
    clock: Arc<ManualClock>,
    control: Arc<Mutex<MockControl>>,
}

impl MockAccelerator {
    pub fn new(clock: Arc<ManualClock>) -> (Self, Arc<Mutex<MockControl>>) {
        let control = Arc::new(Mutex::new(MockControl::default()));
        let accelerator = Self {
            inner: SimulatedAccelerator::new(Script::sample_page(), clock.clone()),
            clock,
            control: control.clone(),
        };
        (accelerator, control)
    }
}

impl Accelerator for MockAccelerator {
    fn init(&mut self, config: &AcceleratorConfig) -> Result<(), AcceleratorError> {
        self.inner.init(config)
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    fn load_model(
        &mut self,
        kind: ModelKind,
        data: &[u8],
    ) -> Result<ModelHandle, AcceleratorError> {
        self.inner.load_model(kind, data)
    }

    fn is_model_ready(&self, handle: ModelHandle) -> bool {
        !self.control.lock().unwrap().models_missing && self.inner.is_model_ready(handle)
    }

    fn run(
        &mut self,
        handle: ModelHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), AcceleratorError> {
        {
            let mut control = self.control.lock().unwrap();
            if let Some(script) = control.script.take() {
                self.inner.set_script(script);
            }
            if handle.kind == ModelKind::TextDetection {
                self.clock.advance_us(control.detection_us);
            }
            if control.fail_runs > 0 {
                control.fail_runs -= 1;
                return Err(AcceleratorError::Fault("injected".into()));
            }
        }
        self.inner.run(handle, input, output)
    }

    fn utilization(&self) -> u8 {
        self.inner.utilization()
    }

    fn set_power(&mut self, on: bool) -> Result<(), AcceleratorError> {
        self.inner.set_power(on)
    }
}

pub struct Rig {
    pub engine: InferenceEngine<MockAccelerator>,
    pub control: Arc<Mutex<MockControl>>,
    pub monitor: Arc<HealthMonitor>,
    pub clock: Arc<ManualClock>,
}

/// Engine on the mock accelerator, initialised at a 0.95 threshold and 8 ms budget.
pub fn rig() -> Rig {
    let clock = Arc::new(ManualClock::new());
    let shared: SharedClock = clock.clone();
    let (accelerator, control) = MockAccelerator::new(clock.clone());
    let pool = PoolAllocator::shared(POOL_CAPACITY_BYTES, shared.clone()).unwrap();
    let monitor = HealthMonitor::shared(shared.clone());
    let config = InferenceConfig {
        camera_width: WIDTH,
        camera_height: HEIGHT,
        validation_iterations: 3,
        ..InferenceConfig::default()
    };
    let mut engine = InferenceEngine::new(accelerator, pool, shared, monitor.clone(), config);
    engine.init().unwrap();
    Rig {
        engine,
        control,
        monitor,
        clock,
    }
}

/// Two text lines whose fragments all carry `confidence`.
pub fn page_at(confidence: f32) -> Script {
    let mut script = Script::sample_page();
    for fragment in &mut script.fragments {
        fragment.confidence = confidence;
    }
    script
}

pub fn single_line(text: &str, confidence: f32) -> Script {
    Script {
        regions: vec![RegionRecord {
            x: 24,
            y: 40,
            width: 96,
            height: 16,
            confidence: 0.99,
            orientation: 0,
        }],
        fragments: vec![Fragment {
            confidence,
            text: text.into(),
        }],
    }
}

/// Sensors with a settable temperature.
#[derive(Clone)]
pub struct Thermometer {
    pub millidegrees: Arc<AtomicU64>,
}

impl Thermometer {
    pub fn at(celsius: f32) -> Self {
        Self {
            millidegrees: Arc::new(AtomicU64::new((celsius * 1000.0) as u64)),
        }
    }
}

impl SensorProbe for Thermometer {
    fn temperature_c(&mut self) -> f32 {
        self.millidegrees.load(Ordering::SeqCst) as f32 / 1000.0
    }

    fn supply_mv(&mut self) -> u32 {
        3_300
    }
}

/// Solenoid that records whether it was stopped.
#[derive(Clone, Default)]
pub struct ProbeSolenoid {
    pub pulses: Arc<AtomicU64>,
    pub stopped: Arc<AtomicBool>,
}

impl TactileDriver for ProbeSolenoid {
    fn pulse(&mut self, _on_ms: u32) -> Result<(), ActuatorError> {
        self.pulses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn gap(&mut self, _ms: u32) {}

    fn emergency_stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
