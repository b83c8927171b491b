use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use edge_ocr::{
    monitor::{HealthMonitor, MonitorSnapshot},
    ocr::{
        self, EngineArgs, EngineSnapshot, InferenceConfig, InferenceEngine, PipelineConfig,
        RunArgs, processing::POOL_CAPACITY_BYTES,
    },
};
use frame_ingest::{FrameSource, SyntheticSensor};
use npu_runtime::{Script, SimulatedAccelerator};
use pool_alloc::{MonotonicClock, PoolAllocator, SharedClock};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "edge-ocr", version, about = "Real-time OCR with speech and Morse output")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full pipeline against simulated hardware.
    Run(RunArgs),
    /// Time repeated inference on a synthetic page.
    Benchmark(BenchmarkArgs),
    /// Process a few frames and print engine and monitor state.
    DumpState(DumpStateArgs),
    /// Bring the engine up and run its self-test.
    SelfTest(EngineOnlyArgs),
}

#[derive(Debug, Args)]
struct BenchmarkArgs {
    #[command(flatten)]
    engine: EngineArgs,
    /// Inference runs to average over.
    #[arg(long = "iterations", value_name = "N", default_value_t = 100)]
    iterations: u32,
}

#[derive(Debug, Args)]
struct DumpStateArgs {
    #[command(flatten)]
    engine: EngineArgs,
    /// Frames to process before dumping.
    #[arg(long = "frames", value_name = "N", default_value_t = 10)]
    frames: u32,
    /// Emit JSON instead of text.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Args)]
struct EngineOnlyArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Serialize)]
struct StateDump {
    generated_at: String,
    engine: EngineSnapshot,
    monitor: MonitorSnapshot,
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = PipelineConfig::try_from(args)?;
            let report = ocr::run(config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.emergency_shutdown {
                bail!("pipeline stopped by emergency shutdown");
            }
            Ok(())
        }
        Command::Benchmark(args) => {
            let mut bench = Bench::new(&args.engine)?;
            let frame = bench.frame()?;
            let report = bench
                .engine
                .benchmark(&frame, args.iterations)
                .context("benchmark run failed")?;
            println!(
                "{} iterations: average {} us (min {}, max {}), {} over the {} us budget",
                report.iterations,
                report.average_us,
                report.min_us,
                report.max_us,
                report.over_budget,
                bench.engine.config().max_inference_time_us
            );
            bench.engine.shutdown();
            Ok(())
        }
        Command::DumpState(args) => {
            let mut bench = Bench::new(&args.engine)?;
            for _ in 0..args.frames {
                let frame = bench.frame()?;
                bench.engine.run_cycle(&frame);
            }
            if args.json {
                let dump = StateDump {
                    generated_at: Utc::now().to_rfc3339(),
                    engine: bench.engine.snapshot(),
                    monitor: bench.monitor.snapshot(),
                };
                println!("{}", serde_json::to_string_pretty(&dump)?);
            } else {
                print!("{}", bench.engine.dump_state());
                print!("{}", bench.monitor.status_report());
            }
            Ok(())
        }
        Command::SelfTest(args) => {
            let mut bench = Bench::new(&args.engine)?;
            bench.engine.self_test().context("self-test failed")?;
            println!("self-test passed");
            bench.engine.shutdown();
            Ok(())
        }
    }
}

/// Engine on simulated hardware for the one-shot subcommands.
struct Bench {
    engine: InferenceEngine<SimulatedAccelerator>,
    monitor: Arc<HealthMonitor>,
    sensor: SyntheticSensor,
}

impl Bench {
    fn new(args: &EngineArgs) -> Result<Self> {
        let config = InferenceConfig::try_from(args)?;
        let clock: SharedClock = Arc::new(MonotonicClock::new());
        let pool = PoolAllocator::shared(POOL_CAPACITY_BYTES, clock.clone())
            .context("failed to create inference memory pool")?;
        let monitor = HealthMonitor::shared(clock.clone());
        let accelerator = SimulatedAccelerator::new(Script::sample_page(), clock.clone())
            .with_latency(std::time::Duration::from_micros(args.accelerator_latency_us));
        let sensor = SyntheticSensor::new(
            config.camera_width,
            config.camera_height,
            frame_ingest::SensorPattern::TextLines {
                ink: 0x0000,
                paper: 0xFFFF,
                line_height: 12,
                gap: 20,
            },
        )?;
        let mut engine = InferenceEngine::new(accelerator, pool, clock, monitor.clone(), config);
        engine
            .init()
            .context("inference engine failed to initialise")?;
        info!("engine ready on simulated accelerator");
        Ok(Self {
            engine,
            monitor,
            sensor,
        })
    }

    fn frame(&mut self) -> Result<frame_ingest::Frame> {
        Ok(self.sensor.capture(Vec::new())?)
    }
}
