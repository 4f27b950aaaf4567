//! Sentence-end decision and lattice root selection.

use std::collections::HashMap;

use tracing::{info, warn};

use treebeam_core::{INVALID_ID, INVALID_SCORE, Score, score_sum, update_hash_key};

use super::SearchSpace;
use crate::trace::{Trace, TraceRef};

impl SearchSpace {
    /// Pick the final trace; with `create_lattice` the alternatives stay
    /// reachable through sibling links on the returned trace.
    pub fn get_sentence_end(&mut self, create_lattice: bool) -> Option<TraceRef> {
        if self.need_end_processing {
            self.get_sentence_end_from_end_traces(create_lattice)
        } else {
            self.get_sentence_end_from_hypotheses(create_lattice)
        }
    }

    /// Asynchronous ending: decide among the collected end traces.
    fn get_sentence_end_from_end_traces(&mut self, create_lattice: bool) -> Option<TraceRef> {
        if self.end_traces.is_empty() {
            // possible when the audio is cut off and pruning is tight
            warn!("no end traces found");
            return None;
        }

        if self.full_sum {
            // merge traces supporting the same word sequence
            let mut by_history: HashMap<u64, TraceRef> = HashMap::new();
            let traces: Vec<TraceRef> = self.end_traces.clone();
            for trace in traces {
                let mut hash = trace
                    .borrow()
                    .recombination_history
                    .as_ref()
                    .map_or(0, |h| h.hash_key());
                if self.label_full_sum {
                    let label_hash = trace
                        .borrow()
                        .label_history
                        .as_ref()
                        .map_or(0, |h| h.hash_key());
                    hash = update_hash_key(hash, label_hash);
                }
                self.fullsum_merge_traces(&mut by_history, hash, trace);
            }
            return Some(self.get_best_trace(&by_history, create_lattice));
        }

        let mut best = self.end_traces[0].clone();
        let mut best_parent: Option<TraceRef> = None;
        let mut last: Option<TraceRef> = None;
        for trace in &self.end_traces {
            if create_lattice
                && let Some(previous) = &last
            {
                previous.borrow_mut().sibling = Some(trace.clone());
            }
            if !TraceRef::ptr_eq(trace, &best) && trace.borrow().prospect < best.borrow().prospect
            {
                best = trace.clone();
                best_parent = last.clone();
            }
            last = Some(trace.clone());
        }
        if create_lattice && !TraceRef::ptr_eq(&best, &self.end_traces[0]) {
            if let Some(parent) = best_parent {
                let sibling = best.borrow().sibling.clone();
                parent.borrow_mut().sibling = sibling;
            }
            best.borrow_mut().sibling = Some(self.end_traces[0].clone());
        }
        Some(best)
    }

    /// Synchronous ending: only boundary hypotheses qualify, i.e. word
    /// ends (uncoarticulated where the tree records them) and blank roots.
    fn get_sentence_end_from_hypotheses(&mut self, create_lattice: bool) -> Option<TraceRef> {
        let mut best: Option<TraceRef> = None;
        let mut by_history: HashMap<u64, TraceRef> = HashMap::new();

        let force_end = !self.tree.force_end_nodes().is_empty();

        let word_ends = std::mem::take(&mut self.word_ends);
        for weh in &word_ends {
            if weh.score.is_infeasible() {
                continue;
            }
            if force_end {
                if weh.exit == INVALID_ID {
                    continue;
                }
                let transit_root = self.tree.exit(weh.exit).transit_root;
                if !self.tree.force_end_nodes().contains(&transit_root) {
                    continue;
                }
            }
            // scored as "+ sentence end", without extending the history
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
                trace.borrow_mut().score.lm += lm.sentence_end_score(&weh.score_history);
            }
            let prospect = self.compute_trace_prospect(&trace, true);
            trace.borrow_mut().prospect = prospect;

            if self.full_sum {
                let mut hash = weh.recombination_history.hash_key();
                if self.label_full_sum {
                    hash = update_hash_key(hash, weh.label_history.hash_key());
                }
                self.fullsum_merge_traces(&mut by_history, hash, trace);
                continue;
            }
            self.insert_candidate(&mut best, trace, create_lattice);
        }
        self.word_ends = word_ends;

        // label-level endings: blank roots (CTC, transducer) and
        // uncoarticulated word ends (HMM trees)
        if self.allow_blank || force_end {
            for index in 0..self.instances.len() {
                let range = self.instances[index].labels;
                if range.is_empty() {
                    continue;
                }
                let tree_hash = self.instances[index].key.hash_key();

                for i in range.begin..range.end {
                    let hyp = &self.label_hyps[i];
                    let valid_end = (self.allow_blank && self.tree.is_root(hyp.node))
                        || (force_end && self.tree.force_end_nodes().contains(&hyp.node));
                    if !valid_end || hyp.score.is_infeasible() {
                        continue;
                    }

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
                    let prospect = self.compute_trace_prospect(&trace, true);
                    trace.borrow_mut().prospect = prospect;

                    if self.full_sum {
                        let mut hash = tree_hash;
                        if self.label_full_sum {
                            hash = update_hash_key(hash, hyp.history.hash_key());
                        }
                        self.fullsum_merge_traces(&mut by_history, hash, trace);
                        continue;
                    }
                    self.insert_candidate(&mut best, trace, create_lattice);
                }
            }
        }

        if self.full_sum && !by_history.is_empty() {
            best = Some(self.get_best_trace(&by_history, create_lattice));
        }

        if let Some(best) = &best
            && self.prune_trace
        {
            // relaxed pruning of the remaining alternatives
            let threshold = best.borrow().prospect + self.label_pruning + self.word_end_pruning;
            if threshold < INVALID_SCORE {
                let mut trace = best.clone();
                loop {
                    let sibling = trace.borrow().sibling.clone();
                    let Some(sibling) = sibling else { break };
                    if sibling.borrow().prospect > threshold {
                        let next = sibling.borrow().sibling.clone();
                        trace.borrow_mut().sibling = next;
                    } else {
                        trace = sibling;
                    }
                }
            }
        }

        best
    }

    fn insert_candidate(&self, best: &mut Option<TraceRef>, trace: TraceRef, create_lattice: bool) {
        let replace = match best {
            None => true,
            Some(current) => {
                let current = current.borrow();
                let candidate = trace.borrow();
                candidate.prospect < current.prospect
                    || (!self.use_lm_score
                        && candidate.prospect == current.prospect
                        && candidate.n_labels < current.n_labels)
            }
        };
        if replace {
            if create_lattice {
                trace.borrow_mut().sibling = best.clone();
            }
            *best = Some(trace);
        } else if create_lattice {
            let current = best.as_ref().expect("candidate exists");
            trace.borrow_mut().sibling = current.borrow().sibling.clone();
            current.borrow_mut().sibling = Some(trace);
        }
    }

    /// Merge traces sharing the same full history: acoustic scores sum in
    /// probability space, the representative keeps the best properties.
    fn fullsum_merge_traces(
        &self,
        by_history: &mut HashMap<u64, TraceRef>,
        hash: u64,
        trace: TraceRef,
    ) {
        let Some(existing) = by_history.get(&hash) else {
            by_history.insert(hash, trace);
            return;
        };
        let existing = existing.clone();
        let acoustic = score_sum(existing.borrow().score.acoustic, trace.borrow().score.acoustic);
        let merged_prospect = score_sum(existing.borrow().prospect, trace.borrow().prospect);

        let representative = if trace.borrow().prospect < existing.borrow().prospect {
            by_history.insert(hash, trace.clone());
            trace
        } else {
            existing
        };
        representative.borrow_mut().score.acoustic = acoustic;
        let prospect = if self.length_norm {
            self.compute_trace_prospect(&representative, true)
        } else {
            merged_prospect
        };
        representative.borrow_mut().prospect = prospect;
    }

    /// Best merged trace; with lattices the others chain as siblings.
    fn get_best_trace(
        &self,
        by_history: &HashMap<u64, TraceRef>,
        create_lattice: bool,
    ) -> TraceRef {
        debug_assert!(!by_history.is_empty());
        let mut traces: Vec<TraceRef> = by_history.values().cloned().collect();
        // deterministic visit order
        traces.sort_by(|a, b| a.borrow().prospect.total_cmp(&b.borrow().prospect));

        let best = traces[0].clone();
        if create_lattice {
            for pair in traces.windows(2) {
                pair[0].borrow_mut().sibling = Some(pair[1].clone());
            }
        }
        best
    }

    /// No boundary hypothesis survived (truncated recording, tight
    /// pruning): promote the recorded fallback or the best live label.
    pub fn get_sentence_end_fallback(&mut self) -> Option<TraceRef> {
        info!("using fallback sentence end");

        if self.need_end_processing {
            let trace = self.best_label_end_trace.clone()?;
            let lm_score = match (&self.lm, self.use_lm_score) {
                (Some(lm), true) => {
                    let history = trace.borrow().score_history.clone();
                    match history {
                        Some(history) => lm.sentence_end_score(&history),
                        None => 0.0,
                    }
                }
                _ => 0.0,
            };
            {
                let mut t = trace.borrow_mut();
                t.score.lm += lm_score;
                t.n_words += 1;
            }
            let prospect = if self.length_norm {
                self.compute_trace_prospect(&trace, true)
            } else {
                // the sentence-end score doubles as the length penalty
                trace.borrow().prospect + lm_score
            };
            trace.borrow_mut().prospect = prospect;
            return Some(trace);
        }

        // best in-beam label hypothesis
        let index = self.best_prospect_label()?;
        let instance = self.best_prospect_label_tree(index)?;
        let hyp = self.label_hyps[index].clone();
        let trace = Trace::extended(
            self.instances[instance].entry_traces[hyp.trace_id as usize].clone(),
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
                lm.sentence_end_score(&self.instances[instance].score_history);
        }
        let prospect = self.compute_trace_prospect(&trace, true);
        trace.borrow_mut().prospect = prospect;
        Some(trace)
    }
}
