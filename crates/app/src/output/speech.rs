//! Speech synthesis consumer.
//!
//! The synthesizer re-checks the confidence gate on every dequeued result and
//! hands accepted text to a [`SpeechSink`]. Audio hardware stays behind the
//! trait; the default sink only logs.

use pool_alloc::SharedClock;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    monitor::Recoverable,
    ocr::data::{Language, OcrResult},
};

pub const SPEED_MIN: u8 = 1;
pub const SPEED_MAX: u8 = 10;
pub const SPEED_DEFAULT: u8 = 5;
/// Synthesis slower than this is reported.
pub const SYNTHESIS_TIMEOUT_US: u64 = 50_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpeechError {
    #[error("speech speed {0} outside {SPEED_MIN}..={SPEED_MAX}")]
    Speed(u8),
    #[error("speech sink unavailable")]
    Unavailable,
    #[error("synthesis failed: {0}")]
    Sink(String),
}

/// Audio back end.
pub trait SpeechSink: Send {
    fn speak(&mut self, text: &str, language: Language, speed: u8) -> Result<(), SpeechError>;

    /// Cut any utterance in progress.
    fn stop(&mut self) {}

    fn is_ready(&self) -> bool {
        true
    }
}

impl<S: SpeechSink + ?Sized> SpeechSink for Box<S> {
    fn speak(&mut self, text: &str, language: Language, speed: u8) -> Result<(), SpeechError> {
        (**self).speak(text, language, speed)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Sink that writes utterances to the log.
#[derive(Debug, Default)]
pub struct LogSink {
    spoken: u64,
}

impl SpeechSink for LogSink {
    fn speak(&mut self, text: &str, language: Language, speed: u8) -> Result<(), SpeechError> {
        self.spoken += 1;
        info!(target: "speech", ?language, speed, utterance = self.spoken, "{text}");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SynthesisState {
    Idle,
    Synthesizing,
    Muted,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SpeechOutcome {
    Spoken,
    /// Below the confidence gate or empty.
    Skipped,
    Muted,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SynthesisStats {
    pub total_requests: u64,
    pub spoken: u64,
    pub failed: u64,
    pub skipped: u64,
    pub characters: u64,
    pub words: u64,
    pub language_switches: u64,
    pub slow_syntheses: u64,
    pub max_synthesis_us: u64,
    pub last_synthesis_us: u64,
}

pub struct Synthesizer<S> {
    sink: S,
    clock: SharedClock,
    threshold: f32,
    speed: u8,
    muted: bool,
    state: SynthesisState,
    last_language: Option<Language>,
    stats: SynthesisStats,
}

impl<S: SpeechSink> Synthesizer<S> {
    pub fn new(sink: S, threshold: f32, clock: SharedClock) -> Self {
        Self {
            sink,
            clock,
            threshold,
            speed: SPEED_DEFAULT,
            muted: false,
            state: SynthesisState::Idle,
            last_language: None,
            stats: SynthesisStats::default(),
        }
    }

    pub fn set_speed(&mut self, speed: u8) -> Result<(), SpeechError> {
        if !(SPEED_MIN..=SPEED_MAX).contains(&speed) {
            return Err(SpeechError::Speed(speed));
        }
        self.speed = speed;
        Ok(())
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.state = if muted {
            SynthesisState::Muted
        } else {
            SynthesisState::Idle
        };
    }

    pub fn state(&self) -> SynthesisState {
        self.state
    }

    pub fn stats(&self) -> &SynthesisStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Speak `result` if it still clears the confidence gate.
    pub fn handle(&mut self, result: &OcrResult) -> Result<SpeechOutcome, SpeechError> {
        self.stats.total_requests += 1;
        if result.is_empty() || result.confidence < self.threshold {
            self.stats.skipped += 1;
            return Ok(SpeechOutcome::Skipped);
        }
        if self.muted {
            return Ok(SpeechOutcome::Muted);
        }
        if !self.sink.is_ready() {
            self.state = SynthesisState::Error;
            self.stats.failed += 1;
            return Err(SpeechError::Unavailable);
        }

        if self
            .last_language
            .is_some_and(|previous| previous != result.language)
        {
            self.stats.language_switches += 1;
        }
        self.last_language = Some(result.language);

        self.state = SynthesisState::Synthesizing;
        let started = self.clock.now_us();
        let spoken = self.sink.speak(&result.text, result.language, self.speed);
        let elapsed = self.clock.now_us().saturating_sub(started);
        self.stats.last_synthesis_us = elapsed;
        self.stats.max_synthesis_us = self.stats.max_synthesis_us.max(elapsed);
        metrics::histogram!("ocr_stage_latency_seconds", "stage" => "synthesis")
            .record(elapsed as f64 / 1e6);

        match spoken {
            Ok(()) => {
                self.state = SynthesisState::Idle;
                self.stats.spoken += 1;
                self.stats.characters += result.char_count as u64;
                self.stats.words += result.word_count as u64;
                if elapsed > SYNTHESIS_TIMEOUT_US {
                    self.stats.slow_syntheses += 1;
                    warn!(elapsed_us = elapsed, "speech synthesis over budget");
                }
                Ok(SpeechOutcome::Spoken)
            }
            Err(err) => {
                self.state = SynthesisState::Error;
                self.stats.failed += 1;
                Err(err)
            }
        }
    }
}

impl<S: SpeechSink> Recoverable for Synthesizer<S> {
    fn restart(&mut self) -> anyhow::Result<()> {
        self.sink.stop();
        self.state = if self.muted {
            SynthesisState::Muted
        } else {
            SynthesisState::Idle
        };
        self.last_language = None;
        Ok(())
    }

    fn reset_subsystem(&mut self) -> anyhow::Result<()> {
        self.stats = SynthesisStats::default();
        self.speed = SPEED_DEFAULT;
        self.restart()
    }

    fn self_test(&mut self) -> anyhow::Result<()> {
        if !self.sink.is_ready() {
            anyhow::bail!(SpeechError::Unavailable);
        }
        Ok(())
    }

    fn emergency_stop(&mut self) {
        self.sink.stop();
        self.set_muted(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pool_alloc::ManualClock;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        said: Vec<(String, Language, u8)>,
        broken: bool,
    }

    impl SpeechSink for Recorder {
        fn speak(&mut self, text: &str, language: Language, speed: u8) -> Result<(), SpeechError> {
            if self.broken {
                return Err(SpeechError::Sink("codec offline".into()));
            }
            self.said.push((text.to_string(), language, speed));
            Ok(())
        }
    }

    fn result(text: &str, confidence: f32, language: Language) -> OcrResult {
        OcrResult {
            text: text.into(),
            confidence,
            language,
            word_count: text.split_whitespace().count(),
            char_count: text.chars().count(),
            ..OcrResult::default()
        }
    }

    fn synthesizer() -> Synthesizer<Recorder> {
        Synthesizer::new(Recorder::default(), 0.95, Arc::new(ManualClock::new()))
    }

    #[test]
    fn low_confidence_is_not_spoken() {
        let mut synth = synthesizer();
        let outcome = synth.handle(&result("EXIT", 0.80, Language::English)).unwrap();
        assert_eq!(outcome, SpeechOutcome::Skipped);
        assert!(synth.sink().said.is_empty());
    }

    #[test]
    fn accepted_text_reaches_the_sink_with_speed() {
        let mut synth = synthesizer();
        synth.set_speed(7).unwrap();
        synth.handle(&result("EXIT", 0.99, Language::English)).unwrap();
        synth.handle(&result("出口", 0.99, Language::Japanese)).unwrap();
        assert_eq!(synth.sink().said.len(), 2);
        assert_eq!(synth.sink().said[0].2, 7);
        assert_eq!(synth.stats().language_switches, 1);
    }

    #[test]
    fn speed_is_bounded() {
        let mut synth = synthesizer();
        assert_eq!(synth.set_speed(0), Err(SpeechError::Speed(0)));
        assert_eq!(synth.set_speed(11), Err(SpeechError::Speed(11)));
        assert_eq!(synth.speed(), SPEED_DEFAULT);
    }

    #[test]
    fn sink_failure_enters_error_and_restart_clears_it() {
        let mut synth = Synthesizer::new(
            Recorder {
                broken: true,
                ..Recorder::default()
            },
            0.5,
            Arc::new(ManualClock::new()),
        );
        assert!(synth.handle(&result("STOP", 0.9, Language::English)).is_err());
        assert_eq!(synth.state(), SynthesisState::Error);
        synth.restart().unwrap();
        assert_eq!(synth.state(), SynthesisState::Idle);
    }

    #[test]
    fn emergency_stop_mutes() {
        let mut synth = synthesizer();
        synth.emergency_stop();
        let outcome = synth.handle(&result("EXIT", 0.99, Language::English)).unwrap();
        assert_eq!(outcome, SpeechOutcome::Muted);
    }
}
