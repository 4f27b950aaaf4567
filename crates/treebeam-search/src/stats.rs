//! Per-segment search statistics.

/// Running mean/max accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator {
    sum: f64,
    max: f64,
    n: u64,
}

impl Accumulator {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        if value > self.max || self.n == 0 {
            self.max = value;
        }
        self.n += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 { 0.0 } else { self.sum / self.n as f64 }
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn clear(&mut self) {
        *self = Accumulator::default();
    }
}

/// Counters accumulated over the steps of one segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStatistics {
    pub label_hyps: Accumulator,
    pub label_saturation: Accumulator,
    pub word_end_hyps: Accumulator,
    pub word_end_saturation: Accumulator,
    pub word_ends_after_recombination: Accumulator,
    pub end_traces: Accumulator,
    pub trace_saturation: Accumulator,
}

impl SearchStatistics {
    pub fn clear(&mut self) {
        *self = SearchStatistics::default();
    }

    pub fn log_summary(&self) {
        tracing::info!(
            label_hyps_mean = self.label_hyps.mean(),
            label_hyps_max = self.label_hyps.max(),
            label_saturation = self.label_saturation.mean(),
            word_end_hyps_mean = self.word_end_hyps.mean(),
            word_end_saturation = self.word_end_saturation.mean(),
            word_ends_after_recombination = self.word_ends_after_recombination.mean(),
            end_traces_mean = self.end_traces.mean(),
            "search space statistics"
        );
    }
}
