//! Label expansion: the hottest loop of the search.
//!
//! The inner loop is monomorphised over four independent flags (blank,
//! relative position, transition penalty, local pruning) so each
//! configuration runs branch-free.

use treebeam_core::{INVALID_SCORE, Score};

use super::SearchSpace;
use crate::hyp::LabelHypothesis;

impl SearchSpace {
    /// Expand every live and entry label hypothesis by one step and apply
    /// the LM lookahead to the new beam.
    pub fn expand_labels(&mut self) {
        self.best_label_score = INVALID_SCORE;
        self.best_label_prospect = INVALID_SCORE;
        self.word_len_best_prospect.clear();

        let transition_penalty = self.tree.use_expansion_penalty();
        let local_pruning = self.local_label_pruning != INVALID_SCORE;
        match (
            self.allow_blank,
            self.use_relative_position,
            transition_penalty,
            local_pruning,
        ) {
            (false, _, false, false) => self.expand_labels_in_tree::<false, false, false, false>(),
            (false, _, false, true) => self.expand_labels_in_tree::<false, false, false, true>(),
            (false, _, true, false) => self.expand_labels_in_tree::<false, false, true, false>(),
            (false, _, true, true) => self.expand_labels_in_tree::<false, false, true, true>(),
            (true, false, false, false) => self.expand_labels_in_tree::<true, false, false, false>(),
            (true, false, false, true) => self.expand_labels_in_tree::<true, false, false, true>(),
            (true, false, true, false) => self.expand_labels_in_tree::<true, false, true, false>(),
            (true, false, true, true) => self.expand_labels_in_tree::<true, false, true, true>(),
            (true, true, false, false) => self.expand_labels_in_tree::<true, true, false, false>(),
            (true, true, false, true) => self.expand_labels_in_tree::<true, true, false, true>(),
            (true, true, true, false) => self.expand_labels_in_tree::<true, true, true, false>(),
            (true, true, true, true) => self.expand_labels_in_tree::<true, true, true, true>(),
        }

        // lookahead scoring after all trees expanded; records every best
        let eos = self.eos_threshold != INVALID_SCORE;
        self.apply_lookahead_in_instances(eos, self.word_len_balance);
    }

    fn expand_labels_in_tree<
        const ALLOW_BLANK: bool,
        const RELATIVE_POSITION: bool,
        const TRANSITION_PENALTY: bool,
        const LOCAL_PRUNING: bool,
    >(
        &mut self,
    ) {
        self.new_label_hyps
            .reserve(self.label_hyps.len() + self.instances.len());

        for index in 0..self.instances.len() {
            self.current_instance = index;
            let range = self.instances[index].labels;
            self.instances[index].labels.begin = self.new_label_hyps.len();

            let entries = std::mem::take(&mut self.instances[index].entry_labels);
            if !self.position_dependent {
                for hyp in &entries {
                    self.expand_label_with_score::<
                        ALLOW_BLANK, RELATIVE_POSITION, TRANSITION_PENALTY, LOCAL_PRUNING,
                    >(hyp, true);
                }
                for i in range.begin..range.end {
                    let hyp = self.label_hyps[i].clone();
                    self.expand_label_with_score::<
                        ALLOW_BLANK, RELATIVE_POSITION, TRANSITION_PENALTY, LOCAL_PRUNING,
                    >(&hyp, false);
                }
            } else {
                for hyp in &entries {
                    self.expand_label_with_score_and_position::<
                        ALLOW_BLANK, TRANSITION_PENALTY, LOCAL_PRUNING,
                    >(hyp, true);
                }
                for i in range.begin..range.end {
                    let hyp = self.label_hyps[i].clone();
                    self.expand_label_with_score_and_position::<
                        ALLOW_BLANK, TRANSITION_PENALTY, LOCAL_PRUNING,
                    >(&hyp, false);
                }
            }

            self.instances[index].labels.end = self.new_label_hyps.len();
        }
        std::mem::swap(&mut self.label_hyps, &mut self.new_label_hyps);
        self.new_label_hyps.clear();
    }

    /// Copy the current score row into the scratch buffers; returns the
    /// row width to detect the loop-head layout.
    fn fetch_scores(&mut self, hyp: &LabelHypothesis) -> usize {
        let row = self.scorer.scores(&hyp.history, false);
        self.score_scratch.clear();
        self.score_scratch.extend_from_slice(row);
        self.score_scratch.len()
    }

    fn fetch_loop_scores(&mut self, hyp: &LabelHypothesis) {
        let row = self.scorer.scores(&hyp.history, true);
        self.loop_scratch.clear();
        self.loop_scratch.extend_from_slice(row);
    }

    /// Time/label/alignment-synchronous expansion of one hypothesis.
    fn expand_label_with_score<
        const ALLOW_BLANK: bool,
        const RELATIVE_POSITION: bool,
        const TRANSITION_PENALTY: bool,
        const LOCAL_PRUNING: bool,
    >(
        &mut self,
        hyp: &LabelHypothesis,
        is_root: bool,
    ) {
        let successors = self.tree.successors(hyp.node);
        if successors.is_empty() {
            return;
        }
        // a node whose only successor is itself cannot leave blank
        let is_end = successors.len() == 1 && successors[0] == hyp.node;
        if hyp.is_blank && is_end {
            return;
        }
        debug_assert!(!is_root || *successors.last().unwrap() != hyp.node);

        let num_classes = self.scorer.num_classes();
        let width = self.fetch_scores(hyp);
        let label_dependent_loop = width == 2 * num_classes;
        let joint_loop = width == num_classes + 1;
        let mut loop_scores_fetched = false;

        let local_threshold = if LOCAL_PRUNING {
            self.score_scratch
                .iter()
                .copied()
                .fold(INVALID_SCORE, Score::min)
                + self.local_label_pruning
        } else {
            INVALID_SCORE
        };

        let successor_count = self.tree.successors(hyp.node).len();
        for succ_index in 0..successor_count {
            let target = self.tree.successors(hyp.node)[succ_index];
            let is_loop = target == hyp.node;
            if hyp.is_blank && is_loop {
                continue; // no more loop after blank
            }
            if !is_root && hyp.n_loop < self.min_loop_occur && !is_loop {
                continue; // no forward before the minimum duration
            }

            let class = self.tree.label(target);
            let mut local = self.score_scratch[class as usize];
            if is_loop {
                // loop scoring: joint forward|loop head or label-dependent
                if joint_loop {
                    local = *self.score_scratch.last().unwrap();
                } else if label_dependent_loop {
                    if !loop_scores_fetched {
                        self.fetch_loop_scores(hyp);
                        loop_scores_fetched = true;
                    }
                    local = self.loop_scratch[class as usize + num_classes];
                }
            }

            // drop bad successors before materialising them; the threshold
            // is safe because the lookahead is not included yet
            if LOCAL_PRUNING && local > local_threshold {
                continue;
            }

            let mut new_hyp = hyp.clone();
            new_hyp.node = target;
            new_hyp.is_blank = false;
            new_hyp.is_loop = is_loop;
            new_hyp.local = local;
            new_hyp.score.acoustic += local;
            if is_loop {
                new_hyp.n_loop += 1;
            } else {
                new_hyp.n_labels += 1;
                new_hyp.n_loop = 0;
            }
            if TRANSITION_PENALTY {
                new_hyp.score.acoustic += self.tree.transition_penalty(hyp.node, target);
            }
            if RELATIVE_POSITION {
                new_hyp.position = 0;
            }
            self.new_label_hyps.push(new_hyp);
        }

        if ALLOW_BLANK && !is_end {
            // blank: stay on the node, neither loop nor transition
            let blank_score = self.score_scratch[self.blank_label as usize];
            if blank_score < self.blank_score_threshold
                && (!LOCAL_PRUNING || blank_score <= local_threshold)
            {
                let mut new_hyp = hyp.clone();
                new_hyp.is_blank = true;
                new_hyp.is_loop = false;
                new_hyp.local = blank_score;
                new_hyp.score.acoustic += blank_score + self.blank_penalty;
                if RELATIVE_POSITION {
                    // relative position w.r.t. the last non-blank label
                    if new_hyp.position < self.relative_position_clip {
                        new_hyp.position += 1;
                    }
                } else if self.vertical_transition {
                    new_hyp.position += 1;
                }
                self.new_label_hyps.push(new_hyp);
            }
        }
    }

    /// Segmental expansion: each successor consumes a `(length, score)`
    /// span, the position jumps to the segment end.
    fn expand_label_with_score_and_position<
        const ALLOW_BLANK: bool,
        const TRANSITION_PENALTY: bool,
        const LOCAL_PRUNING: bool,
    >(
        &mut self,
        hyp: &LabelHypothesis,
        is_root: bool,
    ) {
        let successors = self.tree.successors(hyp.node);
        if successors.is_empty() {
            return;
        }

        let mut reach_end = true;
        let mut local_threshold = INVALID_SCORE;

        let successor_count = successors.len();
        for succ_index in 0..successor_count {
            let target = self.tree.successors(hyp.node)[succ_index];
            debug_assert_ne!(target, hyp.node, "no loops in segmental expansion");
            let class = self.tree.label(target);

            let spans = self
                .scorer
                .segment_scores(&hyp.history, class, hyp.position);
            if LOCAL_PRUNING && !spans.is_empty() {
                let best = spans
                    .iter()
                    .map(|&(_, s)| s)
                    .fold(INVALID_SCORE, Score::min);
                local_threshold = local_threshold.min(best + self.local_label_pruning);
            }

            for &(length, score) in &spans {
                if LOCAL_PRUNING && score > local_threshold {
                    continue;
                }
                let mut new_hyp = hyp.clone();
                new_hyp.node = target;
                new_hyp.n_labels += 1;
                new_hyp.is_blank = false;
                new_hyp.is_loop = false;
                new_hyp.local = score;
                new_hyp.score.acoustic += score;
                if ALLOW_BLANK {
                    // stretching over blanks is penalised per frame
                    new_hyp.score.acoustic += self.blank_penalty * (length - 1) as Score;
                } else if TRANSITION_PENALTY {
                    // forward plus (len - 1) loops as a duration penalty
                    new_hyp.score.acoustic += self.tree.transition_penalty(hyp.node, target)
                        + self.tree.transition_penalty(target, target) * (length - 1) as Score;
                }
                new_hyp.position += length;
                self.new_label_hyps.push(new_hyp);
                reach_end = false;
            }
        }

        // a trailing blank-only segment covers the rest of long inputs
        if ALLOW_BLANK
            && (self.allow_blank_segment
                || (is_root && self.scorer.maybe_final_segment(hyp.position)))
        {
            let spans = self
                .scorer
                .segment_scores(&hyp.history, self.blank_label, hyp.position);
            if let Some(&(length, score)) = spans.last()
                && (!LOCAL_PRUNING || score <= local_threshold)
            {
                let mut new_hyp = hyp.clone();
                new_hyp.is_blank = true;
                new_hyp.is_loop = false;
                new_hyp.local = score;
                new_hyp.score.acoustic += score + self.blank_penalty * length as Score;
                new_hyp.position += length;
                self.new_label_hyps.push(new_hyp);
                reach_end = false;
            }
        }

        // dead end before the input was consumed: remember the best
        // fallback in case pruning starves the search later
        if reach_end && self.end_traces.is_empty() {
            self.record_best_label_end_trace(self.current_instance, hyp);
        }
    }
}
