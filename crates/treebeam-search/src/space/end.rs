//! End-trace management for asynchronously finishing topologies
//! (label-sync end labels, segmental positions, vertical transitions).

use tracing::info;

use treebeam_core::{
    INVALID_SCORE, Score, neg_log_one_minus_exp_neg, score_sum,
};

use super::SearchSpace;
use crate::hyp::LabelHypothesis;
use crate::trace::{Trace, TraceRef};

impl SearchSpace {
    /// Detect newly ended traces, prune the end-trace pool, evaluate the
    /// stopping criteria and keep a fallback candidate alive.
    pub fn process_end(&mut self) {
        if !self.need_end_processing {
            return;
        }
        if self.end_traces.is_empty() {
            self.best_end_trace_prospect = INVALID_SCORE;
        }

        self.detect_end_traces(self.step_re_norm, self.step_re_norm && self.word_len_balance);

        if self.prune_trace && !self.end_traces.is_empty() {
            let threshold = if self.trace_pruning == INVALID_SCORE {
                INVALID_SCORE
            } else {
                self.best_end_trace_prospect + self.trace_pruning
            };
            self.prune_end_traces(threshold);
            if self.end_traces.len() > self.trace_pruning_limit as usize {
                let tightened = self.quantile_score(
                    self.best_end_trace_prospect,
                    threshold,
                    self.trace_pruning_limit,
                    false,
                    false,
                    true,
                );
                self.prune_end_traces(tightened);
                self.stats.trace_saturation.add(1.0);
            } else {
                self.stats.trace_saturation.add(0.0);
            }
            self.stats.end_traces.add(self.end_traces.len() as f64);
        }

        self.check_stopping_criteria();

        // a fallback must exist before the search is about to stop
        let last_step = if self.restrict_with_input_length {
            if self.vertical_transition {
                self.decode_step == 2 * self.input_length.saturating_sub(1)
            } else {
                self.decode_step == self.input_length
            }
        } else {
            false
        };
        let need_fallback = self.end_traces.is_empty() && (self.stop_search || last_step);
        if need_fallback && self.best_label_end_trace.is_none() {
            if let Some(index) = self.best_prospect_word_end() {
                let weh = &self.word_ends[index];
                let trace = Trace::extended(
                    weh.trace.clone(),
                    None,
                    None,
                    self.decode_step + 1,
                    weh.trace.borrow().score,
                    weh.n_labels,
                    weh.n_words,
                    weh.position,
                );
                trace.borrow_mut().score_history = Some(weh.score_history.clone());
                trace.borrow_mut().prospect = weh.trace.borrow().prospect;
                self.best_label_end_trace = Some(trace);
            } else if let Some(index) = self.best_prospect_label() {
                if let Some(instance) = self.best_prospect_label_tree(index) {
                    let hyp = self.label_hyps[index].clone();
                    self.record_best_label_end_trace(instance, &hyp);
                }
            }
        }
    }

    /// A hypothesis ends when its word end consumed the end exit, a
    /// segmental word end reached the input length, or a blank root
    /// reached the input length (vertical transitions).
    fn detect_end_traces(&mut self, step_re_norm: bool, word_len: bool) {
        let mut step_end_traces: Vec<TraceRef> = Vec::new();

        // tailing blank segments end in label space, not at word ends
        if self.vertical_transition || (self.position_dependent && self.allow_blank) {
            self.detect_end_traces_from_states(step_re_norm, word_len, &mut step_end_traces);
        }

        if !self.vertical_transition || step_re_norm {
            let mut out = 0usize;
            for i in 0..self.word_ends.len() {
                let mut is_end = false;
                if !self.vertical_transition {
                    // input length reached counts the implicit end label
                    is_end = self.position_dependent
                        && self.word_ends[i].position + 1 >= self.input_length;
                    if is_end {
                        let weh = &self.word_ends[i];
                        let trace = Trace::extended(
                            weh.trace.clone(),
                            None,
                            None,
                            self.decode_step + 1,
                            weh.trace.borrow().score,
                            weh.n_labels,
                            weh.n_words + 1,
                            weh.position,
                        );
                        if self.use_lm_score {
                            let lm = self.lm.as_ref().expect("lm present");
                            trace.borrow_mut().score.lm +=
                                lm.sentence_end_score(&weh.score_history);
                        }
                        self.word_ends[i].trace = trace;
                    } else {
                        is_end = self.word_ends[i].exit == self.end_exit;
                    }
                }

                let mass = if step_re_norm {
                    let mut score = self.word_ends[i].trace.borrow().score.total();
                    if word_len {
                        score += self.word_len_weight(self.word_ends[i].n_words);
                    }
                    self.step_sum_score = score_sum(self.step_sum_score, score);
                    score
                } else {
                    0.0
                };

                if is_end {
                    // the end exit never appears in the transcription
                    let trace = self.word_ends[i].trace.clone();
                    {
                        let mut t = trace.borrow_mut();
                        t.pronunciation = None;
                        t.lemma = None;
                        if self.full_sum {
                            // sentence-end merging needs the histories
                            t.recombination_history =
                                Some(self.word_ends[i].recombination_history.clone());
                            t.label_history = Some(self.word_ends[i].label_history.clone());
                        }
                    }
                    step_end_traces.push(trace);
                    if step_re_norm {
                        self.step_end_score = score_sum(self.step_end_score, mass);
                    }
                } else {
                    if out != i {
                        self.word_ends[out] = self.word_ends[i].clone();
                    }
                    out += 1;
                }
            }
            self.word_ends.truncate(out);
        }

        // only ending traces need a prospect, for pruning and decision
        for trace in &step_end_traces {
            let prospect = self.compute_trace_prospect(trace, true);
            trace.borrow_mut().prospect = prospect;
            if prospect < self.best_end_trace_prospect {
                self.best_end_trace_prospect = prospect;
            }
        }
        self.end_traces.extend(step_end_traces.iter().cloned());

        if step_re_norm && !step_end_traces.is_empty() {
            // accumulate the non-ending probability for the next step
            debug_assert!(self.step_end_score >= self.step_sum_score);
            let end_score = self.step_end_score - self.step_sum_score;
            if end_score == 0.0 {
                self.step_accu_len_score = INVALID_SCORE; // everything ended
            } else {
                self.step_accu_len_score += neg_log_one_minus_exp_neg(end_score);
            }
        }
    }

    /// Blank roots whose position consumed the input are valid ends;
    /// anything else at the input boundary stops expanding.
    fn detect_end_traces_from_states(
        &mut self,
        step_re_norm: bool,
        word_len: bool,
        step_end_traces: &mut Vec<TraceRef>,
    ) {
        if self.label_hyps.is_empty() {
            return;
        }

        let mut out = 0usize;
        for index in 0..self.instances.len() {
            let range = self.instances[index].labels;
            self.instances[index].labels.begin = out;

            for i in range.begin..range.end {
                let hyp = &self.label_hyps[i];
                let valid_end = hyp.is_blank
                    && self.tree.is_root(hyp.node)
                    && hyp.position + 1 >= self.input_length;
                if valid_end {
                    let trace = Trace::extended(
                        self.instances[index].entry_traces[hyp.trace_id as usize].clone(),
                        None,
                        None,
                        self.decode_step + 1,
                        hyp.score,
                        hyp.n_labels,
                        hyp.n_words + 1,
                        hyp.position,
                    );
                    trace.borrow_mut().score.acoustic += self.global_score_offset as Score;
                    if self.use_lm_score {
                        let lm = self.lm.as_ref().expect("lm present");
                        trace.borrow_mut().score.lm +=
                            lm.sentence_end_score(&self.instances[index].score_history);
                    }
                    if self.full_sum {
                        let mut t = trace.borrow_mut();
                        t.recombination_history = Some(self.instances[index].key.clone());
                        t.label_history = Some(hyp.history.clone());
                    }
                    if step_re_norm {
                        // already inside the step mass; add the end share
                        let mut score = trace.borrow().score.total();
                        if word_len {
                            score += self.word_len_weight(hyp.n_words);
                        }
                        self.step_end_score = score_sum(self.step_end_score, score);
                    }
                    step_end_traces.push(trace);
                } else if hyp.position + 1 < self.input_length {
                    if out != i {
                        self.label_hyps[out] = self.label_hyps[i].clone();
                    }
                    out += 1;
                }
            }
            // empty instances are collected on the next step
            self.instances[index].labels.end = out;
        }
        self.label_hyps.truncate(out);
    }

    pub(crate) fn prune_end_traces(&mut self, threshold: Score) {
        if threshold == INVALID_SCORE {
            return;
        }
        self.end_traces
            .retain(|trace| trace.borrow().prospect <= threshold);
    }

    fn check_stopping_criteria(&mut self) {
        if self.word_ends.is_empty() && self.label_hyps.is_empty() {
            self.stop_search = true; // beam starved
        }

        // step-renormalised early stop: no future path can win anymore
        if !self.end_traces.is_empty()
            && self.step_early_stop
            && self.step_length_scale * self.step_accu_len_score >= self.best_end_trace_prospect
        {
            self.stop_search = true;
        }

        if self.stop_search {
            info!(
                step = self.decode_step,
                input_length = self.input_length,
                labels = self.label_hyps.len(),
                word_ends = self.word_ends.len(),
                end_traces = self.end_traces.len(),
                "stopping search"
            );
        }
    }

    /// Deterministic early stop before running the next step: nothing in
    /// the beam can beat the best ended trace anymore.
    pub fn may_stop_early(&mut self) -> bool {
        if !self.need_end_processing || self.vertical_transition {
            return false;
        }
        let mut stop =
            self.restrict_with_input_length && self.decode_step > self.input_length;
        if !stop
            && !self.end_traces.is_empty()
            && !self.length_norm
            && !self.step_re_norm
            && !self.word_len_balance
        {
            let offset = self.global_score_offset as Score;
            stop = self.best_end_trace_prospect < self.best_label_prospect + offset
                && self.best_end_trace_prospect < self.best_word_end_prospect + offset;
        }
        if stop {
            // everything live would be pruned against the ended traces
            self.label_hyps.clear();
            self.word_ends.clear();
            for instance in &mut self.instances {
                instance.labels.clear();
                instance.early_word_ends.clear();
            }
            return true;
        }
        false
    }

    /// Remember the best non-expandable hypothesis as the fallback end
    /// trace; recovery from pruning starvation cannot fail.
    pub(crate) fn record_best_label_end_trace(&mut self, instance: usize, hyp: &LabelHypothesis) {
        let prospect = self.compute_label_trace_prospect(hyp);
        let better = match &self.best_label_end_trace {
            Some(best) => prospect < best.borrow().prospect,
            None => true,
        };
        if !better {
            return;
        }
        let predecessor = self.instances[instance].entry_traces[hyp.trace_id as usize].clone();
        let trace = Trace::extended(
            predecessor,
            None,
            None,
            self.decode_step + 1,
            hyp.score,
            hyp.n_labels,
            hyp.n_words,
            hyp.position,
        );
        {
            let mut t = trace.borrow_mut();
            t.score_history = Some(self.instances[instance].score_history.clone());
            t.score.acoustic += self.global_score_offset as Score;
            t.prospect = prospect;
        }
        self.best_label_end_trace = Some(trace);
    }
}
