//! Word-end detection, global pruning policies and word-end recombination.

use std::collections::{BinaryHeap, HashMap};

use treebeam_core::{INVALID_ID, INVALID_SCORE, Score, score_sum, score_sum_all, update_hash_key};

use super::SearchSpace;
use super::prune::PruneFlags;
use crate::hyp::{EarlyWordEndHypothesis, WordEndHypothesis};
use crate::trace::Trace;

impl SearchSpace {
    /// Word-boundary expansion with the configured pruning policy.
    pub fn find_word_ends_and_prune(&mut self) {
        debug_assert!(self.word_ends.is_empty() && self.early_word_ends.is_empty());
        self.best_word_end_prospect = INVALID_SCORE;

        // reuse the per-length tracking of the label stage
        let size = self.word_len_best_prospect.len();
        self.word_len_best_prospect.clear();
        self.word_len_best_prospect.resize(size + 1, INVALID_SCORE);
        self.word_len_score.clear();
        self.word_len_score.resize(size + 1, INVALID_SCORE);

        self.step_sum_score = INVALID_SCORE;
        self.step_end_score = INVALID_SCORE;

        let exit_penalty = self.tree.use_transition_penalty();
        if self.word_len_balance {
            self.find_early_word_ends(exit_penalty, false, true, false);
        } else if self.prune_words_with_labels {
            self.find_early_word_ends(exit_penalty, false, false, true);
        } else {
            // no further global label pruning: extend histories up front
            self.extend_label_histories();
            self.find_early_word_ends(exit_penalty, self.step_re_norm, false, false);
        }

        if self.word_len_balance || self.prune_words_with_labels {
            self.prune_labels_and_word_ends();
            return;
        }

        let threshold = if self.word_end_pruning == INVALID_SCORE {
            INVALID_SCORE
        } else {
            self.best_word_end_prospect + self.word_end_pruning
        };
        self.prune_and_expand_early_word_ends(threshold, false, false);

        if self.word_ends.len() > self.word_end_pruning_limit as usize {
            let tightened = self.quantile_score(
                self.best_word_end_prospect,
                threshold,
                self.word_end_pruning_limit,
                false,
                true,
                false,
            );
            self.prune_word_ends(tightened);
            self.stats.word_end_saturation.add(1.0);
        } else {
            self.stats.word_end_saturation.add(0.0);
        }
        self.stats.word_end_hyps.add(self.word_ends.len() as f64);
    }

    /// Collect early word ends from exiting labels; the heavy history
    /// extension is deferred until after pruning.
    fn find_early_word_ends(
        &mut self,
        exit_penalty: bool,
        step_re_norm: bool,
        word_len: bool,
        prune_global: bool,
    ) {
        for index in 0..self.instances.len() {
            let range = self.instances[index].labels;
            self.instances[index].early_word_ends.begin = self.early_word_ends.len();
            self.instances[index].early_word_ends.end = self.early_word_ends.len();
            if range.is_empty() {
                continue;
            }

            for i in range.begin..range.end {
                if word_len || prune_global || step_re_norm {
                    // expandable labels stay individual beam members;
                    // non-expandable ones always carry exits instead
                    let expandable = self.tree.has_successors(self.label_hyps[i].node);
                    if expandable {
                        let total = self.label_hyps[i].score.total();
                        if word_len {
                            let n_words = self.label_hyps[i].n_words as usize;
                            if total < self.word_len_best_prospect[n_words] {
                                self.word_len_best_prospect[n_words] = total;
                            }
                            self.word_len_score[n_words] = score_sum(
                                self.word_len_score[n_words],
                                total + self.global_score_offset as Score,
                            );
                        } else if prune_global {
                            // no lookahead on this side of the beam
                            let prospect =
                                self.compute_label_prospect(&self.label_hyps[i], 0.0);
                            self.label_hyps[i].prospect = prospect;
                            if prospect < self.best_word_end_prospect {
                                self.best_word_end_prospect = prospect;
                            }
                        } else if step_re_norm {
                            self.step_sum_score = score_sum(
                                self.step_sum_score,
                                total + self.global_score_offset as Score,
                            );
                        }
                    }
                }

                // blank labels never exit; exits ride the label expansion
                if !self.tree.has_exit(self.label_hyps[i].node) || self.label_hyps[i].is_blank
                {
                    continue;
                }
                if self.restrict_with_input_length
                    && self.label_hyps[i].n_labels > self.input_length
                {
                    continue;
                }
                if self.label_hyps[i].n_loop < self.min_loop_occur {
                    continue;
                }

                let exit_count = self.tree.exits(self.label_hyps[i].node).len();
                for exit_index in 0..exit_count {
                    let node = self.label_hyps[i].node;
                    let exit_id = self.tree.exits(node)[exit_index];
                    let exit = *self.tree.exit(exit_id);

                    let mut n_words = self.label_hyps[i].n_words;
                    if let Some(lemma) = exit.lemma
                        && self.lexicon.lemma(lemma).has_synt()
                    {
                        n_words += 1;
                    }

                    let mut eweh = EarlyWordEndHypothesis {
                        history: self.label_hyps[i].history.clone(),
                        node,
                        trace_id: self.label_hyps[i].trace_id,
                        exit: exit_id,
                        is_loop: self.label_hyps[i].is_loop,
                        score: self.label_hyps[i].score,
                        prospect: 0.0,
                        n_labels: self.label_hyps[i].n_labels,
                        n_words,
                        position: self.label_hyps[i].position,
                    };

                    // pronunciation score counts as acoustic so variant
                    // normalisation can happen after merging
                    if let Some(pron) = exit.pronunciation {
                        eweh.score.acoustic += self.pronunciation_scale
                            * self.lexicon.pronunciation(pron).score;
                    }
                    if exit_penalty {
                        eweh.score.acoustic += self.tree.exit_penalty(node);
                    }
                    if self.use_lm_score {
                        let lm = self.lm.as_ref().expect("lm present").clone();
                        eweh.score.lm += self.instances[index].lm_score(
                            &*lm,
                            &self.lexicon,
                            exit.lemma,
                        );
                    }

                    if word_len {
                        let bucket = eweh.n_words as usize;
                        let total = eweh.score.total();
                        if total < self.word_len_best_prospect[bucket] {
                            self.word_len_best_prospect[bucket] = total;
                        }
                        self.word_len_score[bucket] = score_sum(
                            self.word_len_score[bucket],
                            total + self.global_score_offset as Score,
                        );
                    } else {
                        eweh.prospect = self.compute_early_word_end_prospect(&eweh);
                        if eweh.prospect < self.best_word_end_prospect {
                            self.best_word_end_prospect = eweh.prospect;
                        }
                    }
                    self.early_word_ends.push(eweh);
                }
            }
            self.instances[index].early_word_ends.end = self.early_word_ends.len();
        }
    }

    /// Prune early word ends and expand survivors into full word ends,
    /// extending label histories on the way when still pending.
    fn prune_and_expand_early_word_ends(
        &mut self,
        threshold: Score,
        extend_label_history: bool,
        word_len: bool,
    ) {
        if extend_label_history {
            self.extend_label_histories();
        }

        for index in 0..self.instances.len() {
            let range = self.instances[index].early_word_ends;
            for i in range.begin..range.end {
                if word_len {
                    let bucket = self.early_word_ends[i].n_words as usize;
                    self.early_word_ends[i].prospect =
                        self.early_word_ends[i].score.total() + self.word_len_score[bucket];
                }
                if self.early_word_ends[i].prospect > threshold {
                    continue;
                }

                let mut eweh = self.early_word_ends[i].clone();
                if extend_label_history {
                    // only non-blank labels can exit
                    let class = self.tree.label(eweh.node);
                    eweh.history = self.scorer.extend_history(
                        &eweh.history,
                        class,
                        eweh.position,
                        eweh.is_loop,
                    );
                }

                let instance = &self.instances[index];
                self.word_ends.push(WordEndHypothesis {
                    label_history: eweh.history,
                    trace: instance.entry_traces[eweh.trace_id as usize].clone(),
                    recombination_history: instance.key.clone(),
                    score_history: instance.score_history.clone(),
                    lookahead_history: instance.lookahead_history.clone(),
                    score: eweh.score,
                    prospect: eweh.prospect,
                    node: eweh.node,
                    exit: eweh.exit,
                    n_labels: eweh.n_labels,
                    n_words: eweh.n_words,
                    position: eweh.position,
                });
            }
        }
        self.early_word_ends.clear();
    }

    pub(crate) fn prune_word_ends(&mut self, threshold: Score) {
        if threshold == INVALID_SCORE {
            return;
        }
        self.word_ends.retain(|weh| weh.prospect <= threshold);
    }

    /// Joint pruning across labels and word ends, optionally balanced
    /// over word lengths.
    fn prune_labels_and_word_ends(&mut self) {
        if self.word_len_balance {
            // renormalised per-length weights at the current position
            let sum = score_sum_all(self.word_len_score.iter().copied());
            for score in &mut self.word_len_score {
                if *score < INVALID_SCORE {
                    *score = (*score - sum) * self.word_len_scale;
                }
            }
            for bucket in 0..self.word_len_best_prospect.len() {
                if self.word_len_best_prospect[bucket] == INVALID_SCORE {
                    continue;
                }
                self.word_len_best_prospect[bucket] += self.word_len_score[bucket];
                if self.word_len_best_prospect[bucket] < self.best_word_end_prospect {
                    self.best_word_end_prospect = self.word_len_best_prospect[bucket];
                }
            }
        }

        // word-end pruning doubles as the global threshold here
        let threshold = if self.word_end_pruning == INVALID_SCORE {
            INVALID_SCORE
        } else {
            self.best_word_end_prospect + self.word_end_pruning
        };
        self.prune_labels(
            threshold,
            PruneFlags {
                remove_non_expandable: true,
                word_len: self.word_len_balance,
                ..PruneFlags::default()
            },
        );
        self.prune_and_expand_early_word_ends(threshold, true, self.word_len_balance);

        if self.label_hyps.len() + self.word_ends.len()
            > self.word_end_pruning_limit as usize
        {
            let tightened = self.quantile_score(
                self.best_word_end_prospect,
                threshold,
                self.word_end_pruning_limit,
                true,
                true,
                false,
            );
            self.prune_labels(
                tightened,
                PruneFlags {
                    delete_tree: true,
                    ..PruneFlags::default()
                },
            );
            self.prune_word_ends(tightened);
            self.stats.word_end_saturation.add(1.0);
        } else {
            self.stats.word_end_saturation.add(0.0);
        }
        self.stats.word_end_hyps.add(self.word_ends.len() as f64);

        if self.step_re_norm && !self.label_hyps.is_empty() {
            // probability mass of the surviving label hypotheses
            debug_assert!(self.step_sum_score == INVALID_SCORE);
            self.step_sum_score = score_sum_all(
                self.label_hyps
                    .iter()
                    .map(|hyp| hyp.prospect + self.global_score_offset as Score),
            );
        }
    }

    /// Simple beam search: one global beam across labels, word ends and
    /// end traces.
    pub fn find_word_ends_and_prune_global(&mut self) {
        debug_assert!(self.global_score_offset == 0.0);
        debug_assert!(self.word_ends.is_empty() && self.early_word_ends.is_empty());
        self.best_word_end_prospect = INVALID_SCORE;
        self.step_sum_score = INVALID_SCORE;
        self.step_end_score = INVALID_SCORE;

        let exit_penalty = self.tree.use_transition_penalty();

        // safe score pruning first unless the beam is fixed-size anyway
        let threshold = if self.fixed_beam_search || self.word_end_pruning == INVALID_SCORE {
            INVALID_SCORE
        } else {
            self.best_label_prospect + self.word_end_pruning
        };
        if !self.fixed_beam_search || self.eos_threshold != INVALID_SCORE {
            self.prune_labels(
                threshold,
                PruneFlags {
                    max_input_length_stop: self.restrict_with_input_length
                        && self.decode_step > self.input_length,
                    delete_tree: true,
                    ..PruneFlags::default()
                },
            );
            if !self.fixed_beam_search
                && self.label_hyps.len() > self.word_end_pruning_limit as usize
            {
                let tightened = self.quantile_score(
                    self.best_label_prospect,
                    threshold,
                    self.word_end_pruning_limit,
                    true,
                    false,
                    false,
                );
                self.prune_labels(
                    tightened,
                    PruneFlags {
                        delete_tree: true,
                        ..PruneFlags::default()
                    },
                );
            }
        }

        if self.fixed_beam_search {
            // joint pruning over word ends only pays off when the LM makes
            // their scores differ from the labels they came from
            if !self.use_lm_score || self.lookahead.is_some() {
                self.prune_global_with_fixed_beam(self.word_end_pruning_limit, false);
                self.recombine_labels();
                self.find_early_word_ends(exit_penalty, false, false, false);
            } else {
                self.find_early_word_ends(exit_penalty, false, false, false);
                self.prune_global_with_fixed_beam(self.word_end_pruning_limit, true);
                self.recombine_labels();
            }
            self.prune_and_expand_early_word_ends(INVALID_SCORE, true, false);
            return;
        }

        self.find_early_word_ends(exit_penalty, false, false, false);

        let mut best = self.best_word_end_prospect;
        if self.best_label_prospect < best {
            best = self.best_label_prospect;
        }
        if !self.end_traces.is_empty() && self.best_end_trace_prospect < best {
            best = self.best_end_trace_prospect;
        }
        let threshold = if self.word_end_pruning == INVALID_SCORE {
            INVALID_SCORE
        } else {
            best + self.word_end_pruning
        };

        self.prune_labels(
            threshold,
            PruneFlags {
                remove_non_expandable: true,
                ..PruneFlags::default()
            },
        );
        self.recombine_labels();
        self.prune_and_expand_early_word_ends(threshold, true, false);
        self.prune_end_traces(threshold);

        let size = self.label_hyps.len() + self.word_ends.len() + self.end_traces.len();
        if size > self.word_end_pruning_limit as usize {
            let tightened = self.quantile_score(
                best,
                threshold,
                self.word_end_pruning_limit,
                true,
                true,
                true,
            );
            self.prune_labels(
                tightened,
                PruneFlags {
                    delete_tree: true,
                    ..PruneFlags::default()
                },
            );
            self.prune_word_ends(tightened);
            self.prune_end_traces(tightened);
            self.stats.word_end_saturation.add(1.0);
        } else {
            self.stats.word_end_saturation.add(0.0);
        }
        self.stats.word_end_hyps.add(self.word_ends.len() as f64);
    }

    /// Keep the `beam_size` best entries across (expandable) labels,
    /// early word ends and end traces.
    fn prune_global_with_fixed_beam(&mut self, beam_size: u32, expandable_only: bool) {
        let beam_size = beam_size as usize;
        let size = self.label_hyps.len() + self.early_word_ends.len() + self.end_traces.len();
        if size <= beam_size {
            return;
        }

        // bounded max-heap: the worst surviving entry sits on top
        let mut beam: BinaryHeap<BeamEntry> = BinaryHeap::with_capacity(beam_size + 1);
        for (i, hyp) in self.label_hyps.iter().enumerate() {
            if expandable_only && !self.tree.has_successors(hyp.node) {
                continue;
            }
            if self.restrict_with_input_length && hyp.n_labels > self.input_length {
                continue;
            }
            insert_beam(&mut beam, beam_size, hyp.prospect, 0, i);
        }
        for (i, eweh) in self.early_word_ends.iter().enumerate() {
            insert_beam(&mut beam, beam_size, eweh.prospect, 1, i);
        }
        for (i, trace) in self.end_traces.iter().enumerate() {
            insert_beam(&mut beam, beam_size, trace.borrow().prospect, 2, i);
        }

        let mut kept_labels = Vec::new();
        let mut kept_words = Vec::new();
        let mut kept_traces = Vec::new();
        for entry in beam.into_vec() {
            match entry.category {
                0 => kept_labels.push(entry.index),
                1 => kept_words.push(entry.index),
                _ => kept_traces.push(self.end_traces[entry.index].clone()),
            }
        }
        self.end_traces = kept_traces;

        // both beams are instance-ordered, so one sorted sweep restores
        // the per-instance ranges
        kept_labels.sort_unstable();
        kept_words.sort_unstable();
        let mut label_cursor = 0usize;
        let mut word_cursor = 0usize;
        let mut new_labels = Vec::with_capacity(kept_labels.len());
        let mut new_words = Vec::with_capacity(kept_words.len());
        for instance in &mut self.instances {
            let label_start = new_labels.len();
            let word_start = new_words.len();
            while label_cursor < kept_labels.len()
                && instance.labels.contains(kept_labels[label_cursor])
            {
                new_labels.push(self.label_hyps[kept_labels[label_cursor]].clone());
                label_cursor += 1;
            }
            while word_cursor < kept_words.len()
                && instance.early_word_ends.contains(kept_words[word_cursor])
            {
                new_words.push(self.early_word_ends[kept_words[word_cursor]].clone());
                word_cursor += 1;
            }
            instance.labels.begin = label_start;
            instance.labels.end = new_labels.len();
            instance.early_word_ends.begin = word_start;
            instance.early_word_ends.end = new_words.len();
        }
        debug_assert!(label_cursor == kept_labels.len() && word_cursor == kept_words.len());
        self.label_hyps = new_labels;
        self.early_word_ends = new_words;
    }

    /// Extend the LM histories of the surviving word ends over the exit
    /// lemma's syntactic tokens.
    pub fn extend_word_histories(&mut self) {
        for i in 0..self.word_ends.len() {
            if self.word_ends[i].exit == INVALID_ID {
                continue;
            }
            let Some(lemma) = self.tree.exit(self.word_ends[i].exit).lemma else {
                continue;
            };
            let Some(lm) = self.lm.as_ref() else {
                continue;
            };
            let tokens = self.lexicon.lemma(lemma).synt.clone();
            for token in tokens {
                let weh = &mut self.word_ends[i];
                weh.recombination_history = lm.extended_history(&weh.recombination_history, token);
                weh.score_history = lm.extended_history(&weh.score_history, token);
                if let Some(lookahead) = &self.lookahead {
                    weh.lookahead_history = lookahead
                        .reduced_history(&lm.extended_history(&weh.lookahead_history, token));
                }
            }
        }
    }

    /// Allocate the word-end traces of this step.
    pub fn create_traces(&mut self) {
        for i in 0..self.word_ends.len() {
            let exit = *self.tree.exit(self.word_ends[i].exit);
            debug_assert!(
                exit.lemma.is_some()
                    || exit.pronunciation.is_some()
                    || self.word_ends[i].exit == self.end_exit
            );
            let weh = &self.word_ends[i];
            let trace = Trace::extended(
                weh.trace.clone(),
                exit.pronunciation,
                exit.lemma,
                self.decode_step,
                weh.score,
                weh.n_labels,
                weh.n_words,
                weh.position,
            );
            trace.borrow_mut().score.acoustic += self.global_score_offset as Score;
            let prospect = self.compute_trace_prospect(&trace, false);
            trace.borrow_mut().prospect = prospect;
            self.word_ends[i].trace = trace;
        }
    }

    /// Word-end recombination over `(reduced word history, reduced label
    /// history, transit root, position)`.
    pub fn recombine_word_ends(&mut self, create_lattice: bool) {
        if !self.allow_word_end_recombination && !self.full_sum {
            return;
        }

        let label_history_hash =
            self.scorer.is_history_dependent() && self.label_recombination_limit != 0;
        let label_other_hash = self.position_dependent || self.tree.is_hmm_tree();

        let mut by_word: HashMap<u64, HashMap<u64, usize>> = HashMap::new();
        let mut out = 0usize;

        for i in 0..self.word_ends.len() {
            // the tree key stays full-order; only the recombination
            // equivalence is reduced
            let word_hash = if self.word_end_recombination_limit >= 0 {
                self.word_ends[i]
                    .recombination_history
                    .reduced_hash_key(self.word_end_recombination_limit)
            } else {
                self.word_ends[i].recombination_history.hash_key()
            };

            let label_hash = if label_history_hash || label_other_hash {
                let mut hash = 0u64;
                if label_history_hash {
                    hash = if self.label_recombination_limit == 1 {
                        match self.word_ends[i].label_history.last_label() {
                            Some(class) => self.label_history_hash[class as usize],
                            None => 0,
                        }
                    } else {
                        self.word_ends[i]
                            .label_history
                            .reduced_hash_key(self.label_recombination_limit)
                    };
                }
                if label_other_hash {
                    let transit_root = self.tree.exit(self.word_ends[i].exit).transit_root;
                    hash = update_hash_key(
                        update_hash_key(hash, u64::from(transit_root)),
                        u64::from(self.word_ends[i].position),
                    );
                }
                hash
            } else {
                0
            };

            let slot = by_word.entry(word_hash).or_default();
            match slot.get(&label_hash) {
                None => {
                    slot.insert(label_hash, out);
                    if out != i {
                        self.word_ends[out] = self.word_ends[i].clone();
                    }
                    out += 1;
                }
                Some(&kept) => {
                    self.recombine_two_word_ends(kept, i, create_lattice);
                }
            }
        }
        self.word_ends.truncate(out);
        self.stats
            .word_ends_after_recombination
            .add(self.word_ends.len() as f64);
    }

    fn recombine_two_word_ends(&mut self, kept: usize, removed: usize, create_lattice: bool) {
        let remove = self.word_ends[removed].clone();

        // deterministic order on ties: fewer labels, then lemma id
        let lemma_id = |space: &Self, weh: &WordEndHypothesis| -> u32 {
            space
                .tree
                .exit(weh.exit)
                .lemma
                .unwrap_or(INVALID_ID)
        };
        let keep_prospect = self.word_ends[kept].prospect;
        let mut replace = keep_prospect > remove.prospect;
        if !replace && keep_prospect == remove.prospect {
            let keep = &self.word_ends[kept];
            replace = keep.n_labels > remove.n_labels
                || (keep.n_labels == remove.n_labels
                    && lemma_id(self, keep) > lemma_id(self, &remove));
        }

        if self.full_sum {
            // pronunciation and spelling variants merge here; word-sequence
            // merging happens at the sentence end with the full history
            let acoustic = score_sum(self.word_ends[kept].score.acoustic, remove.score.acoustic);
            if replace {
                self.word_ends[kept] = remove;
            }
            self.word_ends[kept].score.acoustic = acoustic;
            let prospect = self.compute_word_end_prospect(&self.word_ends[kept]);
            self.word_ends[kept].prospect = prospect;
            let trace = self.word_ends[kept].trace.clone();
            trace.borrow_mut().score.acoustic = acoustic + self.global_score_offset as Score;
            let trace_prospect = self.compute_trace_prospect(&trace, false);
            trace.borrow_mut().prospect = trace_prospect;
        } else if replace {
            if create_lattice {
                debug_assert!(remove.trace.borrow().sibling.is_none());
                remove.trace.borrow_mut().sibling = Some(self.word_ends[kept].trace.clone());
            }
            self.word_ends[kept] = remove;
        } else if create_lattice {
            debug_assert!(remove.trace.borrow().sibling.is_none());
            let keep_trace = self.word_ends[kept].trace.clone();
            remove.trace.borrow_mut().sibling = keep_trace.borrow().sibling.clone();
            keep_trace.borrow_mut().sibling = Some(remove.trace);
        }
    }

    /// Drop lattice siblings whose lemma carries no LM token; they can
    /// never change the result.
    pub fn optimize_lattice(&mut self) {
        for weh in &self.word_ends {
            let mut trace = weh.trace.clone();
            loop {
                let sibling = trace.borrow().sibling.clone();
                let Some(sibling) = sibling else { break };
                let drop_sibling = sibling
                    .borrow()
                    .lemma
                    .is_some_and(|l| !self.lexicon.lemma(l).has_synt());
                if drop_sibling {
                    let next = sibling.borrow().sibling.clone();
                    trace.borrow_mut().sibling = next;
                } else {
                    trace = sibling;
                }
            }
        }
    }
}

/// Beam entry ordered by prospect (worst on top of the max-heap).
#[derive(Debug, Clone, Copy)]
struct BeamEntry {
    prospect: Score,
    category: u8,
    index: usize,
}

impl PartialEq for BeamEntry {
    fn eq(&self, other: &Self) -> bool {
        self.prospect.total_cmp(&other.prospect).is_eq()
    }
}

impl Eq for BeamEntry {}

impl PartialOrd for BeamEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BeamEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.prospect.total_cmp(&other.prospect)
    }
}

fn insert_beam(beam: &mut BinaryHeap<BeamEntry>, beam_size: usize, prospect: Score, category: u8, index: usize) {
    if beam.len() < beam_size {
        beam.push(BeamEntry {
            prospect,
            category,
            index,
        });
    } else if let Some(worst) = beam.peek()
        && prospect < worst.prospect
    {
        beam.pop();
        beam.push(BeamEntry {
            prospect,
            category,
            index,
        });
    }
}
