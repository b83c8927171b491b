//! Tactile Morse output.
//!
//! Text is encoded to ITU Morse and played as solenoid pulses and gaps. An
//! urgent message posted through [`PriorityHandle::priority_message`] cuts
//! the message in progress at the next element boundary.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::monitor::Recoverable;

pub const DOT_MS: u32 = 200;
pub const DASH_MS: u32 = 600;
pub const SYMBOL_GAP_MS: u32 = 200;
pub const LETTER_GAP_MS: u32 = 600;
pub const WORD_GAP_MS: u32 = 1_400;
/// Longest single solenoid activation.
pub const MAX_PULSE_MS: u32 = 2_000;
pub const DEFAULT_WPM: u32 = 6;
pub const MIN_WPM: u32 = 5;
pub const MAX_WPM: u32 = 40;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("pulse of {0}ms exceeds the {MAX_PULSE_MS}ms limit")]
    PulseTooLong(u32),
    #[error("actuator stopped")]
    Stopped,
    #[error("driver fault: {0}")]
    Driver(String),
}

/// International Morse pattern for `c`, if it has one.
pub fn morse_pattern(c: char) -> Option<&'static str> {
    let pattern = match c.to_ascii_uppercase() {
        'A' => ".-",
        'B' => "-...",
        'C' => "-.-.",
        'D' => "-..",
        'E' => ".",
        'F' => "..-.",
        'G' => "--.",
        'H' => "....",
        'I' => "..",
        'J' => ".---",
        'K' => "-.-",
        'L' => ".-..",
        'M' => "--",
        'N' => "-.",
        'O' => "---",
        'P' => ".--.",
        'Q' => "--.-",
        'R' => ".-.",
        'S' => "...",
        'T' => "-",
        'U' => "..-",
        'V' => "...-",
        'W' => ".--",
        'X' => "-..-",
        'Y' => "-.--",
        'Z' => "--..",
        '0' => "-----",
        '1' => ".----",
        '2' => "..---",
        '3' => "...--",
        '4' => "....-",
        '5' => ".....",
        '6' => "-....",
        '7' => "--...",
        '8' => "---..",
        '9' => "----.",
        '.' => ".-.-.-",
        ',' => "--..--",
        '?' => "..--..",
        '\'' => ".----.",
        '!' => "-.-.--",
        '/' => "-..-.",
        '(' => "-.--.",
        ')' => "-.--.-",
        '&' => ".-...",
        ':' => "---...",
        ';' => "-.-.-.",
        '=' => "-...-",
        '+' => ".-.-.",
        '-' => "-....-",
        '_' => "..--.-",
        '"' => ".-..-.",
        '$' => "...-..-",
        '@' => ".--.-.",
        _ => return None,
    };
    Some(pattern)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MorseTiming {
    pub dot_ms: u32,
    pub dash_ms: u32,
    pub symbol_gap_ms: u32,
    pub letter_gap_ms: u32,
    pub word_gap_ms: u32,
}

impl Default for MorseTiming {
    fn default() -> Self {
        Self {
            dot_ms: DOT_MS,
            dash_ms: DASH_MS,
            symbol_gap_ms: SYMBOL_GAP_MS,
            letter_gap_ms: LETTER_GAP_MS,
            word_gap_ms: WORD_GAP_MS,
        }
    }
}

impl MorseTiming {
    /// PARIS timing: one dot lasts 1200 / wpm milliseconds.
    pub fn from_wpm(wpm: u32) -> Self {
        let dot = 1_200 / wpm.clamp(MIN_WPM, MAX_WPM);
        Self {
            dot_ms: dot,
            dash_ms: dot * 3,
            symbol_gap_ms: dot,
            letter_gap_ms: dot * 3,
            word_gap_ms: dot * 7,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MorseElement {
    Pulse(u32),
    Gap(u32),
}

/// Encode `text` as alternating pulses and gaps. Characters without a
/// pattern are skipped; runs of whitespace collapse into one word gap.
pub fn encode(text: &str, timing: &MorseTiming) -> Vec<MorseElement> {
    let mut elements = Vec::new();
    for word in text.split_whitespace() {
        let letters: Vec<&str> = word.chars().filter_map(morse_pattern).collect();
        if letters.is_empty() {
            continue;
        }
        if !elements.is_empty() {
            elements.push(MorseElement::Gap(timing.word_gap_ms));
        }
        for (n, letter) in letters.iter().enumerate() {
            if n > 0 {
                elements.push(MorseElement::Gap(timing.letter_gap_ms));
            }
            for (k, symbol) in letter.chars().enumerate() {
                if k > 0 {
                    elements.push(MorseElement::Gap(timing.symbol_gap_ms));
                }
                elements.push(MorseElement::Pulse(if symbol == '.' {
                    timing.dot_ms
                } else {
                    timing.dash_ms
                }));
            }
        }
    }
    elements
}

/// Solenoid hardware.
pub trait TactileDriver: Send {
    fn pulse(&mut self, on_ms: u32) -> Result<(), ActuatorError>;

    fn gap(&mut self, ms: u32);

    /// De-energise immediately.
    fn emergency_stop(&mut self);

    fn self_test(&mut self) -> Result<(), ActuatorError> {
        Ok(())
    }
}

impl<D: TactileDriver + ?Sized> TactileDriver for Box<D> {
    fn pulse(&mut self, on_ms: u32) -> Result<(), ActuatorError> {
        (**self).pulse(on_ms)
    }

    fn gap(&mut self, ms: u32) {
        (**self).gap(ms)
    }

    fn emergency_stop(&mut self) {
        (**self).emergency_stop()
    }

    fn self_test(&mut self) -> Result<(), ActuatorError> {
        (**self).self_test()
    }
}

/// Driver that accounts pulses and optionally sleeps through them.
#[derive(Debug, Default)]
pub struct SimulatedSolenoid {
    realtime: bool,
    pub activations: u64,
    pub on_time_ms: u64,
    pub stopped: bool,
}

impl SimulatedSolenoid {
    /// Sleep for every pulse and gap, as real hardware would take.
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            ..Self::default()
        }
    }

    fn wait(&self, ms: u32) {
        if self.realtime {
            thread::sleep(Duration::from_millis(u64::from(ms)));
        }
    }
}

impl TactileDriver for SimulatedSolenoid {
    fn pulse(&mut self, on_ms: u32) -> Result<(), ActuatorError> {
        if on_ms > MAX_PULSE_MS {
            return Err(ActuatorError::PulseTooLong(on_ms));
        }
        self.stopped = false;
        self.activations += 1;
        self.on_time_ms += u64::from(on_ms);
        trace!(on_ms, "solenoid pulse");
        self.wait(on_ms);
        Ok(())
    }

    fn gap(&mut self, ms: u32) {
        self.wait(ms);
    }

    fn emergency_stop(&mut self) {
        self.stopped = true;
    }
}

/// Message waiting in the override slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriorityMessage {
    pub text: String,
    pub priority: u8,
}

/// Cloneable handle used by other tasks to post urgent messages.
#[derive(Clone, Default)]
pub struct PriorityHandle {
    slot: Arc<Mutex<Option<PriorityMessage>>>,
    interrupt: Arc<AtomicBool>,
}

impl PriorityHandle {
    /// Post `text`, interrupting output in progress. A pending message of
    /// higher priority is kept; returns whether `text` took the slot.
    pub fn priority_message(&self, text: impl Into<String>, priority: u8) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|pending| pending.priority > priority) {
            return false;
        }
        *slot = Some(PriorityMessage {
            text: text.into(),
            priority,
        });
        self.interrupt.store(true, Ordering::SeqCst);
        true
    }

    pub fn take(&self) -> Option<PriorityMessage> {
        let message = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.interrupt.store(false, Ordering::SeqCst);
        message
    }

    pub fn is_pending(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PlayOutcome {
    Completed,
    Interrupted,
    /// Nothing in the text maps to Morse.
    Empty,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorStats {
    pub messages: u64,
    pub interrupted: u64,
    pub priority_messages: u64,
    pub pulses: u64,
    pub faults: u64,
}

pub struct Actuator<D> {
    driver: D,
    timing: MorseTiming,
    priority: PriorityHandle,
    stopped: bool,
    stats: ActuatorStats,
}

impl<D: TactileDriver> Actuator<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            timing: MorseTiming::from_wpm(DEFAULT_WPM),
            priority: PriorityHandle::default(),
            stopped: false,
            stats: ActuatorStats::default(),
        }
    }

    pub fn priority_handle(&self) -> PriorityHandle {
        self.priority.clone()
    }

    pub fn set_speed(&mut self, wpm: u32) {
        self.timing = MorseTiming::from_wpm(wpm);
        debug!(wpm, dot_ms = self.timing.dot_ms, "morse speed changed");
    }

    pub fn timing(&self) -> &MorseTiming {
        &self.timing
    }

    pub fn stats(&self) -> &ActuatorStats {
        &self.stats
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Tap out `text`, yielding to a posted priority message.
    pub fn play(&mut self, text: &str) -> Result<PlayOutcome, ActuatorError> {
        if self.stopped {
            return Err(ActuatorError::Stopped);
        }
        let elements = encode(text, &self.timing);
        if elements.is_empty() {
            return Ok(PlayOutcome::Empty);
        }
        for element in elements {
            if self.priority.is_pending() {
                self.stats.interrupted += 1;
                return Ok(PlayOutcome::Interrupted);
            }
            self.render(element)?;
        }
        self.stats.messages += 1;
        Ok(PlayOutcome::Completed)
    }

    /// Play a pending priority message, if any, to completion.
    pub fn service_priority(&mut self) -> Result<Option<PlayOutcome>, ActuatorError> {
        let Some(message) = self.priority.take() else {
            return Ok(None);
        };
        if self.stopped {
            return Err(ActuatorError::Stopped);
        }
        self.stats.priority_messages += 1;
        debug!(priority = message.priority, "servicing priority message");
        for element in encode(&message.text, &self.timing) {
            self.render(element)?;
        }
        Ok(Some(PlayOutcome::Completed))
    }

    fn render(&mut self, element: MorseElement) -> Result<(), ActuatorError> {
        match element {
            MorseElement::Pulse(ms) => {
                self.stats.pulses += 1;
                self.driver.pulse(ms).inspect_err(|_| {
                    self.stats.faults += 1;
                })
            }
            MorseElement::Gap(ms) => {
                self.driver.gap(ms);
                Ok(())
            }
        }
    }
}

impl<D: TactileDriver> Recoverable for Actuator<D> {
    fn restart(&mut self) -> anyhow::Result<()> {
        self.stopped = false;
        self.priority.take();
        Ok(())
    }

    fn reset_subsystem(&mut self) -> anyhow::Result<()> {
        self.timing = MorseTiming::from_wpm(DEFAULT_WPM);
        self.stats = ActuatorStats::default();
        self.restart()
    }

    fn self_test(&mut self) -> anyhow::Result<()> {
        self.driver.self_test()?;
        Ok(())
    }

    fn emergency_stop(&mut self) {
        warn!("tactile emergency stop");
        self.driver.emergency_stop();
        self.stopped = true;
    }
}
