use pool_alloc::PoolStats;
use serde::Serialize;

use crate::ocr::config::InferenceConfig;

/// Character accuracy the engine is expected to sustain, in percent.
pub const TARGET_ACCURACY_PERCENT: f32 = 95.0;

/// Running counters for the inference engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_inferences: u64,
    pub successful_inferences: u64,
    pub failed_inferences: u64,
    pub low_confidence_count: u64,
    pub deadline_misses: u64,
    pub avg_inference_time_us: f64,
    /// Fastest frame so far; `None` until one is timed.
    pub min_inference_time_us: Option<u64>,
    pub max_inference_time_us: u64,
    pub last_inference_time_us: u64,
    pub avg_confidence: f32,
    /// Share of frames whose text was recognised, in percent.
    pub character_accuracy: f32,
    pub current_memory_bytes: usize,
    pub peak_memory_bytes: usize,
    pub memory_leaks_detected: u64,
    pub accelerator_utilization: u8,
}

impl PerformanceStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record_timing(&mut self, latency_us: u64) {
        self.total_inferences += 1;
        self.last_inference_time_us = latency_us;
        self.min_inference_time_us = Some(
            self.min_inference_time_us
                .map_or(latency_us, |fastest| fastest.min(latency_us)),
        );
        self.max_inference_time_us = self.max_inference_time_us.max(latency_us);
        let n = self.total_inferences as f64;
        self.avg_inference_time_us += (latency_us as f64 - self.avg_inference_time_us) / n;
    }

    /// A frame produced text with `confidence`.
    pub fn record_success(&mut self, confidence: f32) {
        self.successful_inferences += 1;
        let n = self.successful_inferences as f32;
        self.avg_confidence += (confidence - self.avg_confidence) / n;
        self.update_accuracy(true);
    }

    /// A frame produced no text or failed outright.
    pub fn record_failure(&mut self) {
        self.failed_inferences += 1;
        self.update_accuracy(false);
    }

    fn update_accuracy(&mut self, recognised: bool) {
        let attempts = (self.successful_inferences + self.failed_inferences) as f32;
        let hit = if recognised { 100.0 } else { 0.0 };
        self.character_accuracy += (hit - self.character_accuracy) / attempts;
    }

    pub fn record_memory(&mut self, pool: &PoolStats) {
        self.current_memory_bytes = pool.used_bytes();
        self.peak_memory_bytes = self.peak_memory_bytes.max(pool.peak_bytes());
        self.memory_leaks_detected = pool.leak_count;
    }

    pub fn success_rate(&self) -> f32 {
        if self.total_inferences == 0 {
            return 0.0;
        }
        self.successful_inferences as f32 * 100.0 / self.total_inferences as f32
    }

    pub fn check_targets(&self, config: &InferenceConfig) -> TargetReport {
        TargetReport {
            latency_met: self.avg_inference_time_us <= config.max_inference_time_us as f64,
            accuracy_met: self.character_accuracy >= TARGET_ACCURACY_PERCENT,
            confidence_met: self.avg_confidence >= config.confidence_threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub latency_met: bool,
    pub accuracy_met: bool,
    pub confidence_met: bool,
}

impl TargetReport {
    pub fn all_met(&self) -> bool {
        self.latency_met && self.accuracy_met && self.confidence_met
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_track_recorded_values() {
        let mut stats = PerformanceStats::default();
        stats.record_timing(4_000);
        stats.record_timing(6_000);
        stats.record_success(0.9);
        stats.record_success(1.0);
        assert_eq!(stats.avg_inference_time_us, 5_000.0);
        assert_eq!(stats.min_inference_time_us, Some(4_000));
        assert_eq!(stats.max_inference_time_us, 6_000);
        assert_eq!(stats.last_inference_time_us, 6_000);
        assert!((stats.avg_confidence - 0.95).abs() < 1e-6);
        assert_eq!(stats.character_accuracy, 100.0);
    }

    #[test]
    fn minimum_latency_starts_unset_and_clears_on_reset() {
        let mut stats = PerformanceStats::default();
        assert_eq!(stats.min_inference_time_us, None);
        stats.record_timing(7_500);
        stats.record_timing(9_000);
        stats.record_timing(3_200);
        assert_eq!(stats.min_inference_time_us, Some(3_200));
        stats.reset();
        assert_eq!(stats.min_inference_time_us, None);
    }

    #[test]
    fn failures_pull_accuracy_down() {
        let mut stats = PerformanceStats::default();
        stats.record_success(0.99);
        stats.record_failure();
        assert_eq!(stats.character_accuracy, 50.0);
        let report = stats.check_targets(&InferenceConfig::default());
        assert!(!report.accuracy_met);
        assert!(!report.all_met());
    }
}
