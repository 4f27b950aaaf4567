//! Fixed-bin score histogram for quantile pruning.

use treebeam_core::{INVALID_SCORE, Score};

/// Distributes prospect scores over equal-width bins between the current
/// best and the pruning threshold; `quantile(n)` returns a tightened
/// threshold that keeps roughly the best `n` entries.
#[derive(Debug, Clone)]
pub struct Histogram {
    bins: Vec<u32>,
    lower: Score,
    upper: Score,
}

impl Histogram {
    pub fn new(bins: u32) -> Self {
        Self {
            bins: vec![0; bins.max(2) as usize],
            lower: 0.0,
            upper: 0.0,
        }
    }

    pub fn set_bins(&mut self, bins: u32) {
        self.bins = vec![0; bins.max(2) as usize];
    }

    pub fn clear(&mut self) {
        self.bins.fill(0);
    }

    pub fn set_limits(&mut self, lower: Score, upper: Score) {
        self.lower = lower;
        self.upper = if upper > lower { upper } else { lower + 1.0 };
    }

    fn width(&self) -> Score {
        (self.upper - self.lower) / self.bins.len() as Score
    }

    pub fn accumulate(&mut self, score: Score) {
        if score >= INVALID_SCORE {
            return;
        }
        let last = self.bins.len() - 1;
        let bin = if score <= self.lower {
            0
        } else if score >= self.upper {
            last
        } else {
            (((score - self.lower) / self.width()) as usize).min(last)
        };
        self.bins[bin] += 1;
    }

    /// Smallest bin boundary whose cumulative count reaches `n`; `upper`
    /// when every entry fits anyway.
    pub fn quantile(&self, n: u32) -> Score {
        let mut cumulative = 0u32;
        for (bin, &count) in self.bins.iter().enumerate() {
            cumulative += count;
            if cumulative > n {
                return self.lower + self.width() * bin as Score;
            }
        }
        self.upper
    }
}
