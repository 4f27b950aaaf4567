//! Applying the LM lookahead to the expanded beam.

use treebeam_core::INVALID_SCORE;

use super::SearchSpace;

impl SearchSpace {
    /// Compute every label prospect, activate full-order lookahead in
    /// dominant instances and record the per-step bests.
    pub(crate) fn apply_lookahead_in_instances(&mut self, eos: bool, word_len: bool) {
        let total_labels = self.label_hyps.len();

        for index in 0..self.instances.len() {
            self.instances[index].best_non_end_local = INVALID_SCORE;
            let range = self.instances[index].labels;
            if range.is_empty() {
                continue;
            }

            if word_len {
                let max_len = self.instances[index]
                    .entry_n_words
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(0) as usize;
                if max_len + 1 > self.word_len_best_prospect.len() {
                    self.word_len_best_prospect
                        .resize(max_len + 1, INVALID_SCORE);
                }
            }

            let table = if self.lookahead.is_some() {
                // full-order lookahead only pays off in dominant instances
                let dominance = total_labels as f32 * self.instance_lookahead_label_threshold;
                if range.len() as f32 >= dominance {
                    self.activate_lm_lookahead(index, true);
                }
                Some(match &self.instances[index].lookahead {
                    Some(table) => table.clone(),
                    None => self.lookahead.as_ref().expect("checked").unigram_table(),
                })
            } else {
                None
            };

            for i in range.begin..range.end {
                let lmla = match &table {
                    Some(table) => {
                        let node = self.label_hyps[i].node;
                        table.score(self.lookahead.as_ref().expect("checked").node_of(node))
                    }
                    None => 0.0,
                };
                let prospect = self.compute_label_prospect(&self.label_hyps[i], lmla);

                let (node, local, n_words) = {
                    let hyp = &mut self.label_hyps[i];
                    hyp.prospect = prospect;
                    if table.is_some() {
                        hyp.local += lmla;
                    }
                    (hyp.node, hyp.local, hyp.n_words)
                };

                if word_len {
                    let best = &mut self.word_len_best_prospect[n_words as usize];
                    if prospect < *best {
                        *best = prospect;
                    }
                } else if prospect < self.best_label_prospect {
                    self.best_label_prospect = prospect;
                }

                // EOS filter: track the best non-end local score per tree
                if eos && node != self.end_node {
                    let instance = &mut self.instances[index];
                    if local < instance.best_non_end_local {
                        instance.best_non_end_local = local;
                    }
                }
            }
        }
    }

    /// Attach a lookahead table to the instance: the shared unigram table
    /// for the unigram history, otherwise the history's own table.
    pub(crate) fn activate_lm_lookahead(&mut self, index: usize, compute: bool) {
        if self.instances[index].lookahead.is_some() {
            return;
        }
        let Some(lookahead) = self.lookahead.as_mut() else {
            return;
        };
        if self.instances[index].lookahead_history == *lookahead.unigram_history() {
            self.instances[index].lookahead = Some(lookahead.unigram_table());
        } else if compute {
            let history = self.instances[index].lookahead_history.clone();
            self.instances[index].lookahead = Some(lookahead.table_for(&history));
        }
    }
}
