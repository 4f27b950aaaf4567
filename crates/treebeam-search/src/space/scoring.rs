//! Prospect computations: plain, length-normalised, word-length-balanced
//! and step-renormalised variants.

use treebeam_core::{INVALID_SCORE, Score};

use super::SearchSpace;
use crate::hyp::{EarlyWordEndHypothesis, LabelHypothesis, WordEndHypothesis};
use crate::trace::TraceRef;

impl SearchSpace {
    /// Normalise by label and/or word sequence length.
    pub(crate) fn compute_length_normalized_score(
        &self,
        acoustic: Score,
        lm: Score,
        n_labels: u32,
        n_words: u32,
    ) -> Score {
        let n_labels = n_labels.max(1) as Score;
        let n_words = n_words.max(1) as Score;
        if self.norm_label_only {
            (acoustic + lm) / n_labels
        } else if self.norm_word_only {
            acoustic + lm / n_words
        } else {
            acoustic / n_labels + lm / n_words
        }
    }

    pub(crate) fn compute_label_prospect(&self, hyp: &LabelHypothesis, lmla: Score) -> Score {
        if lmla >= INVALID_SCORE || hyp.score.total() >= INVALID_SCORE {
            return INVALID_SCORE;
        }
        if self.length_norm {
            // an in-flight word counts once the lookahead sees it
            let n_words = if lmla != 0.0 { hyp.n_words + 1 } else { hyp.n_words };
            self.compute_length_normalized_score(
                hyp.score.acoustic,
                hyp.score.lm + lmla,
                hyp.n_labels,
                n_words,
            )
        } else {
            hyp.score.total() + lmla
        }
    }

    pub(crate) fn compute_early_word_end_prospect(
        &self,
        eweh: &EarlyWordEndHypothesis,
    ) -> Score {
        if self.length_norm {
            self.compute_length_normalized_score(
                eweh.score.acoustic,
                eweh.score.lm,
                eweh.n_labels,
                eweh.n_words,
            )
        } else {
            eweh.score.total()
        }
    }

    pub(crate) fn compute_word_end_prospect(&self, weh: &WordEndHypothesis) -> Score {
        if self.length_norm {
            self.compute_length_normalized_score(
                weh.score.acoustic,
                weh.score.lm,
                weh.n_labels,
                weh.n_words,
            )
        } else {
            weh.score.total()
        }
    }

    /// Prospect of a fallback end trace built from a label hypothesis
    /// that cannot expand further.
    pub(crate) fn compute_label_trace_prospect(&self, hyp: &LabelHypothesis) -> Score {
        let offset = self.global_score_offset as Score;
        if self.length_norm {
            self.compute_length_normalized_score(
                hyp.score.acoustic + offset,
                hyp.score.lm,
                hyp.n_labels,
                hyp.n_words,
            )
        } else {
            let mut prospect = hyp.score.total() + offset;
            if self.word_len_balance {
                prospect += self.word_len_weight(hyp.n_words);
            }
            if self.step_re_norm {
                prospect -= self.step_sum_score;
            }
            prospect
        }
    }

    /// Balance weight of a word length; lengths the current step never saw
    /// carry no weight.
    pub(crate) fn word_len_weight(&self, n_words: u32) -> Score {
        self.word_len_score
            .get(n_words as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Prospect of a trace; end traces additionally fold in the word-length
    /// weights and the derived length model.
    pub(crate) fn compute_trace_prospect(&self, trace: &TraceRef, is_end: bool) -> Score {
        let t = trace.borrow();
        if self.length_norm {
            return self.compute_length_normalized_score(
                t.score.acoustic,
                t.score.lm,
                t.n_labels,
                t.n_words,
            );
        }
        let mut prospect = t.score.total();
        if is_end {
            if self.word_len_balance {
                let bucket = if self.position_dependent {
                    t.n_words.saturating_sub(1)
                } else {
                    t.n_words
                };
                prospect += self.word_len_weight(bucket);
            }
            if self.step_re_norm {
                // reformulated final probability with the explicit length
                // model; the sequence posterior renormalisation is optional
                prospect += self.step_length_scale
                    * (self.step_end_score - self.step_sum_score + self.step_accu_len_score);
                if !self.step_length_only {
                    prospect -= self.step_end_score;
                }
            }
        }
        prospect
    }
}
