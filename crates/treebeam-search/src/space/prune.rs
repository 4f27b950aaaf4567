//! Label pruning, within-tree recombination and the histogram threshold.

use std::collections::HashMap;

use treebeam_core::{INVALID_SCORE, Score, score_sum, update_hash_key};

use super::SearchSpace;

/// Variant switches of the shared label-pruning pass.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PruneFlags {
    /// Drop hypotheses whose output already exceeds the input length.
    pub max_input_length_stop: bool,
    /// Drop hypotheses without successors (cleanup after word ends).
    pub remove_non_expandable: bool,
    /// Threshold relative to the per-word-length best prospect.
    pub word_len: bool,
    /// Allow deactivating instances that stayed empty too long.
    pub delete_tree: bool,
}

impl SearchSpace {
    /// Per-step label beam: score pruning, within-tree recombination and
    /// histogram pruning against the hard limit.
    pub fn apply_label_pruning(&mut self) {
        if self.word_len_balance {
            // one best prospect per word length, one shared threshold; a
            // histogram limit across lengths is unsafe here and the global
            // pruning later enforces the hard bound anyway
            self.prune_labels(
                self.label_pruning,
                PruneFlags {
                    max_input_length_stop: self.restrict_with_input_length
                        && self.decode_step > self.input_length,
                    word_len: true,
                    delete_tree: true,
                    ..PruneFlags::default()
                },
            );
            self.recombine_labels();
            self.stats.label_hyps.add(self.label_hyps.len() as f64);
            return;
        }

        debug_assert!(
            self.best_label_prospect != INVALID_SCORE || self.label_hyps.len() <= 1
        );
        let threshold = if self.label_pruning == INVALID_SCORE {
            INVALID_SCORE
        } else {
            self.best_label_prospect + self.label_pruning
        };
        self.prune_labels(
            threshold,
            PruneFlags {
                max_input_length_stop: self.restrict_with_input_length
                    && self.decode_step > self.input_length,
                delete_tree: true,
                ..PruneFlags::default()
            },
        );

        // recombination is much cheaper on the pruned beam
        self.recombine_labels();

        if self.label_hyps.len() > self.label_pruning_limit as usize {
            let tightened = self.quantile_score(
                self.best_label_prospect,
                threshold,
                self.label_pruning_limit,
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
            self.stats.label_saturation.add(1.0);
        } else {
            self.stats.label_saturation.add(0.0);
        }
        self.stats.label_hyps.add(self.label_hyps.len() as f64);
    }

    /// Compact the label array under `threshold`, updating every instance
    /// range and optionally deactivating empty instances.
    pub(crate) fn prune_labels(&mut self, threshold: Score, flags: PruneFlags) {
        let eos = self.eos_threshold != INVALID_SCORE;
        if threshold == INVALID_SCORE
            && !eos
            && !flags.max_input_length_stop
            && !flags.remove_non_expandable
        {
            return;
        }

        let mut out = 0usize;
        let mut removed_instance = false;
        let mut kept_instances = 0usize;

        for index in 0..self.instances.len() {
            let range = self.instances[index].labels;
            self.instances[index].labels.begin = out;

            let eos_threshold = if eos
                && self.instances[index].best_non_end_local != INVALID_SCORE
            {
                self.instances[index].best_non_end_local * self.eos_threshold
            } else {
                INVALID_SCORE
            };

            for i in range.begin..range.end {
                let keep = if flags.remove_non_expandable {
                    // only meaningful after word-end expansion
                    if !self.tree.has_successors(self.label_hyps[i].node) {
                        false
                    } else {
                        if flags.word_len {
                            let n_words = self.label_hyps[i].n_words as usize;
                            self.label_hyps[i].prospect = self.label_hyps[i].score.total()
                                + self.word_len_score[n_words];
                        }
                        self.label_hyps[i].prospect <= threshold
                    }
                } else if flags.max_input_length_stop
                    && (self.label_hyps[i].n_labels > self.input_length
                        || self.label_hyps[i].n_words > self.input_length)
                {
                    false
                } else if eos
                    && self.label_hyps[i].node == self.end_node
                    && self.label_hyps[i].local > eos_threshold
                {
                    false
                } else if flags.word_len {
                    let bucket = self.word_len_best_prospect
                        [self.label_hyps[i].n_words as usize];
                    self.label_hyps[i].prospect <= bucket + threshold
                } else {
                    self.label_hyps[i].prospect <= threshold
                };

                if keep {
                    if out != i {
                        self.label_hyps[out] = self.label_hyps[i].clone();
                    }
                    out += 1;
                }
            }
            self.instances[index].labels.end = out;

            if flags.delete_tree && self.may_deactivate_tree(index) {
                removed_instance = true;
            } else {
                if removed_instance {
                    self.instances.swap(kept_instances, index);
                }
                kept_instances += 1;
            }
        }

        self.label_hyps.truncate(out);
        if removed_instance {
            self.instances.truncate(kept_instances);
            self.rebuild_instance_map();
        }
    }

    /// An instance empty beyond the deletion tolerance is dropped.
    fn may_deactivate_tree(&mut self, index: usize) -> bool {
        let instance = &mut self.instances[index];
        if !instance.labels.is_empty() {
            return false;
        }
        instance.inactive += 1;
        instance.inactive > self.instance_deletion_tolerance
    }

    /// Within-tree recombination: hypotheses agreeing on
    /// `(node, reduced label history, position)` merge, Viterbi or
    /// full-sum. Prospects are already computed.
    pub(crate) fn recombine_labels(&mut self) {
        if !self.allow_label_recombination && !self.full_sum {
            return;
        }
        let history_hash =
            self.scorer.is_history_dependent() && self.label_recombination_limit != 0;
        let blank_updates = self.scorer.blank_updates_history();
        let loop_updates = self.scorer.loop_updates_history();
        // without history or position dependency the tree node is the key
        let simple = !history_hash && !self.position_dependent;

        let mut out = 0usize;
        for index in 0..self.instances.len() {
            let range = self.instances[index].labels;
            self.instances[index].labels.begin = out;

            let mut by_key: HashMap<(u32, u64), usize> = HashMap::new();

            for i in range.begin..range.end {
                if history_hash {
                    let hyp = &self.label_hyps[i];
                    if (!hyp.is_blank || blank_updates) && (!hyp.is_loop || loop_updates) {
                        let class = if hyp.is_blank {
                            self.blank_label
                        } else {
                            self.tree.label(hyp.node)
                        };
                        let hash = if self.label_recombination_limit == 1 {
                            // first-order hashes only depend on the class
                            let memo = &mut self.label_history_hash[class as usize];
                            if *memo == 0 {
                                *memo = self.label_hyps[i]
                                    .history
                                    .reduced_extended_hash_key(1, class);
                            }
                            *memo
                        } else {
                            self.label_hyps[i].history.reduced_extended_hash_key(
                                self.label_recombination_limit,
                                class,
                            )
                        };
                        self.label_hyps[i].hash = hash;
                    }
                }

                let key = if simple {
                    (self.label_hyps[i].node, 0)
                } else {
                    let hyp = &self.label_hyps[i];
                    (hyp.node, update_hash_key(hyp.hash, u64::from(hyp.position)))
                };

                match by_key.get(&key) {
                    None => {
                        by_key.insert(key, out);
                        if out != i {
                            self.label_hyps[out] = self.label_hyps[i].clone();
                        }
                        out += 1;
                    }
                    Some(&kept) => {
                        let remove = self.label_hyps[i].clone();
                        let keep = &mut self.label_hyps[kept];
                        if self.full_sum {
                            // full-sum needs the full LM history so the LM
                            // halves agree; prospects stay untouched
                            let acoustic =
                                score_sum(keep.score.acoustic, remove.score.acoustic);
                            if remove.prospect < keep.prospect {
                                *keep = remove;
                            }
                            keep.score.acoustic = acoustic;
                        } else if remove.prospect < keep.prospect
                            || (remove.prospect == keep.prospect
                                && remove.n_labels < keep.n_labels)
                        {
                            // ties favour the shorter sequence so LM-free
                            // re-entries recombine deterministically
                            *keep = remove;
                        }
                    }
                }
            }
            self.instances[index].labels.end = out;
        }
        self.label_hyps.truncate(out);
    }

    /// Delayed label-history extension, after all label-level pruning.
    pub(crate) fn extend_label_histories(&mut self) {
        if self.position_dependent {
            let min_pos = self
                .label_hyps
                .iter()
                .map(|hyp| hyp.position)
                .min()
                .unwrap_or(u32::MAX);
            self.scorer.clean_up_before_extension(min_pos);
        }

        if self.scorer.is_history_dependent() {
            for i in 0..self.label_hyps.len() {
                let (history, class, position, is_loop) = {
                    let hyp = &self.label_hyps[i];
                    let class = if hyp.is_blank {
                        self.blank_label
                    } else {
                        self.tree.label(hyp.node)
                    };
                    (hyp.history.clone(), class, hyp.position, hyp.is_loop)
                };
                self.label_hyps[i].history =
                    self.scorer
                        .extend_history(&history, class, position, is_loop);
            }
        }
    }

    /// Histogram threshold keeping about `limit` of the accumulated
    /// prospects between `best` and `threshold`.
    pub(crate) fn quantile_score(
        &mut self,
        best: Score,
        threshold: Score,
        limit: u32,
        labels: bool,
        words: bool,
        end_traces: bool,
    ) -> Score {
        self.histogram.clear();
        self.histogram.set_limits(best, threshold);
        if labels {
            for hyp in &self.label_hyps {
                self.histogram.accumulate(hyp.prospect);
            }
        }
        if words {
            for weh in &self.word_ends {
                self.histogram.accumulate(weh.prospect);
            }
        }
        if end_traces {
            // comparable with in-beam scores only without a pending offset
            debug_assert!(!(labels || words) || self.global_score_offset == 0.0);
            for trace in &self.end_traces {
                self.histogram.accumulate(trace.borrow().prospect);
            }
        }
        self.histogram.quantile(limit)
    }
}
