//! The beam-search space: per-step expansion, pruning, recombination,
//! word ends and end-trace management over the static network.

mod end;
mod expand;
mod lookahead;
mod prune;
mod scoring;
mod sentence_end;
mod word_end;

#[cfg(test)]
mod space_tests;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use treebeam_core::{
    INVALID_ID, INVALID_SCORE, LabelIndex, LabelScorer, LanguageModel, Lexicon, LmHistory, NodeId,
    Position, Score, ScoreVector, SearchOptions, StepIndex,
};
use treebeam_network::{
    CacheArchive, LabelTree, Lookahead, StateGraph, load_or_build_lookahead, load_or_build_tree,
};

use crate::SearchError;
use crate::histogram::Histogram;
use crate::hyp::{EarlyWordEndHypothesis, LabelHypothesis, WordEndHypothesis};
use crate::instance::TreeInstance;
use crate::stats::SearchStatistics;
use crate::trace::{Trace, TraceRef};

/// The search space drives the label tree under the scorer's topology:
/// one `expand → prune → recombine → word ends → end processing` pass per
/// decode step, all hypotheses in flat arrays partitioned by instance.
pub struct SearchSpace {
    pub(crate) lexicon: Arc<Lexicon>,
    pub(crate) scorer: Box<dyn LabelScorer>,
    pub(crate) lm: Option<Arc<dyn LanguageModel>>,

    pub(crate) tree: LabelTree,
    pub(crate) lookahead: Option<Lookahead>,

    pub(crate) stats: SearchStatistics,
    pub(crate) histogram: Histogram,

    // decision rule
    pub(crate) use_lm_score: bool,
    pub(crate) full_sum: bool,
    pub(crate) label_full_sum: bool,

    // pruning
    pub(crate) local_label_pruning: Score,
    pub(crate) label_pruning: Score,
    pub(crate) label_pruning_limit: u32,
    pub(crate) word_end_pruning: Score,
    pub(crate) word_end_pruning_limit: u32,

    pub(crate) instance_deletion_tolerance: u32,
    pub(crate) instance_lookahead_label_threshold: f32,

    // topology
    pub(crate) allow_loop: bool,
    pub(crate) min_loop_occur: u32,
    pub(crate) allow_blank: bool,
    pub(crate) blank_label: LabelIndex,
    pub(crate) blank_penalty: Score,
    pub(crate) blank_score_threshold: Score,
    pub(crate) allow_blank_segment: bool,
    pub(crate) use_relative_position: bool,
    pub(crate) relative_position_clip: u32,
    pub(crate) vertical_transition: bool,
    pub(crate) position_dependent: bool,

    // recombination
    pub(crate) allow_label_recombination: bool,
    pub(crate) label_recombination_limit: i32,
    pub(crate) allow_word_end_recombination: bool,
    pub(crate) word_end_recombination_limit: i32,

    // end processing
    pub(crate) need_end_processing: bool,
    pub(crate) end_node: NodeId,
    pub(crate) end_exit: u32,
    pub(crate) restrict_with_input_length: bool,
    pub(crate) prune_trace: bool,
    pub(crate) trace_pruning: Score,
    pub(crate) trace_pruning_limit: u32,

    // heuristics
    pub(crate) fixed_beam_search: bool,
    pub(crate) length_norm: bool,
    pub(crate) norm_label_only: bool,
    pub(crate) norm_word_only: bool,
    pub(crate) eos_threshold: Score,

    // derived length model
    pub(crate) step_re_norm: bool,
    pub(crate) step_early_stop: bool,
    pub(crate) step_length_only: bool,
    pub(crate) step_length_scale: Score,

    // global pruning policies
    pub(crate) prune_words_with_labels: bool,
    pub(crate) word_len_balance: bool,
    pub(crate) word_len_scale: Score,

    pub(crate) pronunciation_scale: Score,

    // per-segment state
    pub(crate) decode_step: StepIndex,
    pub(crate) input_length: Position,
    pub(crate) global_score_offset: f64,
    pub(crate) stop_search: bool,

    pub(crate) best_label_score: Score,
    pub(crate) best_label_prospect: Score,
    pub(crate) best_word_end_prospect: Score,
    pub(crate) best_end_trace_prospect: Score,

    pub(crate) word_len_best_prospect: Vec<Score>,
    pub(crate) word_len_score: Vec<Score>,

    pub(crate) step_sum_score: Score,
    pub(crate) step_end_score: Score,
    pub(crate) step_accu_len_score: Score,

    pub(crate) instances: Vec<TreeInstance>,
    pub(crate) instance_map: HashMap<LmHistory, usize>,
    pub(crate) current_instance: usize,

    pub(crate) label_hyps: Vec<LabelHypothesis>,
    pub(crate) new_label_hyps: Vec<LabelHypothesis>,
    /// Memoised first-order history hash per label class.
    pub(crate) label_history_hash: Vec<u64>,

    pub(crate) early_word_ends: Vec<EarlyWordEndHypothesis>,
    pub(crate) word_ends: Vec<WordEndHypothesis>,

    pub(crate) end_traces: Vec<TraceRef>,
    pub(crate) best_label_end_trace: Option<TraceRef>,

    // scorer output scratch (avoids holding the scorer borrow)
    pub(crate) score_scratch: Vec<Score>,
    pub(crate) loop_scratch: Vec<Score>,
}

impl SearchSpace {
    /// Build the network (from image or source), validate the topology
    /// against the scorer's capabilities and set up the search.
    pub fn new(
        lexicon: Arc<Lexicon>,
        scorer: Box<dyn LabelScorer>,
        lm: Option<Arc<dyn LanguageModel>>,
        options: &SearchOptions,
        state_graph: Option<&StateGraph>,
    ) -> Result<Self, SearchError> {
        let archive = options.cache_dir.as_ref().map(CacheArchive::new);
        let mut tree =
            load_or_build_tree(archive.as_ref(), &lexicon, &*scorer, options, state_graph)?;

        let num_classes = scorer.num_classes() as u32;
        for node in 1..tree.num_nodes() {
            let label = tree.label(node);
            if label != INVALID_ID && label >= num_classes {
                return Err(SearchError::ScorerContract(format!(
                    "tree label {label} out of range for {num_classes} classes"
                )));
            }
        }

        let allow_loop = options.allow_label_loop;
        let allow_blank = options.allow_blank_label;
        if allow_loop {
            tree.activate_loop();
            if options.min_loop_occurrence > 0 {
                if allow_blank {
                    return Err(SearchError::InvalidTopology(
                        "min-loop-occurrence cannot be combined with blank labels",
                    ));
                }
                info!(
                    min = options.min_loop_occurrence,
                    "forcing label loops to occur a minimum number of times"
                );
            }
        } else if options.min_loop_occurrence > 0 {
            return Err(SearchError::InvalidTopology(
                "min-loop-occurrence requires allow-label-loop",
            ));
        }
        tree.set_expansion_penalty(allow_loop);

        let blank_label = scorer.blank_label_index().unwrap_or(INVALID_ID);
        let mut blank_score_threshold = INVALID_SCORE;
        if allow_blank {
            if blank_label == INVALID_ID {
                return Err(SearchError::InvalidTopology("no blank label found"));
            }
            if options.blank_label_probability_threshold > 0.0 {
                blank_score_threshold = -options.blank_label_probability_threshold.ln();
            }
            info!(
                penalty = options.blank_label_penalty,
                threshold = blank_score_threshold,
                "blank label enabled"
            );
            if allow_loop {
                info!("both blank and label loop allowed (no loop after blank)");
            }
        }

        // speed-up: first-order recombination hashes are step-invariant
        let label_history_hash =
            if scorer.is_history_dependent() && options.label_recombination_limit == 1 {
                vec![0; scorer.num_classes()]
            } else {
                Vec::new()
            };

        let position_dependent = scorer.is_position_dependent();
        let need_end_processing = scorer.need_end_processing();
        let vertical_transition = scorer.use_vertical_transition() && allow_blank;
        let mut use_relative_position = false;
        let mut end_node = INVALID_ID;
        let mut end_exit = INVALID_ID;

        if position_dependent {
            // segmental decoding: the position finishes the hypothesis
            if !need_end_processing || allow_loop {
                return Err(SearchError::InvalidTopology(
                    "segmental scorers need end processing and forbid label loops",
                ));
            }
            let silence_node = tree.silence();
            if silence_node != INVALID_ID {
                info!(
                    node = silence_node,
                    label = tree.label(silence_node),
                    "segmental silence model"
                );
            }
        } else if vertical_transition {
            // alignment-sync search: the position finishes the hypothesis
            if !need_end_processing || allow_loop {
                return Err(SearchError::InvalidTopology(
                    "vertical transitions need end processing and forbid label loops",
                ));
            }
            if options.restrict_with_input_length {
                return Err(SearchError::InvalidTopology(
                    "vertical transitions allow outputs longer than the input; \
                     disable restrict-with-input-length",
                ));
            }
        } else if need_end_processing {
            // label-sync search: the end label finishes the hypothesis
            let end_label = scorer
                .end_label_index()
                .ok_or(SearchError::InvalidTopology("no end label found"))?;
            let end_lemma = lexicon.end_lemma().map(|l| l.id);
            tree.activate_end_label(end_label, end_lemma, false);
            end_node = tree.end_node_id();
            end_exit = tree.end_exit_id();
            info!(
                end_label,
                end_node,
                end_exit,
                nodes = tree.num_nodes(),
                exits = tree.all_exits().len(),
                "end label activated"
            );
        } else {
            // strictly monotonic time-sync search
            use_relative_position = scorer.use_relative_position() && allow_blank;
            if use_relative_position {
                info!(
                    clip = options.relative_position_clipping,
                    "using relative positions in decoding"
                );
            }
        }

        let use_lm_score = options.use_lm_score && lm.is_some();
        if options.use_lm_score && lm.is_none() {
            info!("no language model provided; scoring without LM");
        } else if !options.use_lm_score {
            warn!("language model scoring deactivated");
        }

        let full_sum = options.full_sum_decoding;
        if full_sum {
            // full-sum needs the full word history to be correct
            if options.word_end_recombination_limit != -1 {
                return Err(SearchError::InvalidTopology(
                    "full-sum decoding with truncated word history",
                ));
            }
            if options.label_recombination_limit != -1 {
                warn!(
                    limit = options.label_recombination_limit,
                    "full-sum decoding with truncated label history"
                );
            }
        }

        // pruning setup; simple beam search narrows it to one global beam
        let simple_beam = options.simple_beam_search;
        let mut word_end_pruning = options.effective_word_end_pruning();
        if !word_end_pruning.is_finite() {
            word_end_pruning = INVALID_SCORE;
        }
        let mut prune_trace = options.prune_trace;
        let mut prune_words_with_labels = options.prune_words_with_labels;
        let mut word_len_balance = options.word_length_balance && need_end_processing;
        let mut step_re_norm = options.step_re_normalization && need_end_processing;
        let length_norm = options.length_normalization && need_end_processing;
        if simple_beam {
            info!("simple beam search with one global beam over all hypothesis levels");
            prune_trace = false;
            prune_words_with_labels = true;
            word_len_balance = false;
            step_re_norm = false;
        }
        let step_early_stop = options.step_early_stop && step_re_norm;
        if length_norm {
            info!("length normalization for pruning and decision");
            warn!("score offsets are disabled under length normalization");
        }
        if word_len_balance && length_norm {
            return Err(SearchError::InvalidTopology(
                "word-length balance cannot be combined with length normalization",
            ));
        }
        if step_re_norm && length_norm {
            return Err(SearchError::InvalidTopology(
                "step re-normalization cannot be combined with length normalization",
            ));
        }

        let lookahead = match (&lm, use_lm_score && options.lm_lookahead) {
            (Some(lm), true) => Some(load_or_build_lookahead(
                archive.as_ref(),
                &tree,
                &lexicon,
                Arc::clone(lm),
                options.lm_lookahead_scale,
                options.lm_lookahead_history_limit,
            )?),
            _ => {
                info!("lm lookahead deactivated");
                None
            }
        };

        let mut space = Self {
            lexicon,
            scorer,
            lm,
            tree,
            lookahead,
            stats: SearchStatistics::default(),
            histogram: Histogram::new(options.histogram_pruning_bins),

            use_lm_score,
            full_sum,
            label_full_sum: options.label_full_sum,

            local_label_pruning: options.local_label_pruning,
            label_pruning: options.label_pruning,
            label_pruning_limit: options.label_pruning_limit,
            word_end_pruning,
            word_end_pruning_limit: options.word_end_pruning_limit,

            instance_deletion_tolerance: options.instance_deletion_tolerance,
            instance_lookahead_label_threshold: options.instance_lookahead_label_threshold,

            allow_loop,
            min_loop_occur: options.min_loop_occurrence,
            allow_blank,
            blank_label,
            blank_penalty: options.blank_label_penalty,
            blank_score_threshold,
            allow_blank_segment: options.allow_blank_segment,
            use_relative_position,
            relative_position_clip: options.relative_position_clipping,
            vertical_transition,
            position_dependent,

            allow_label_recombination: options.allow_label_recombination,
            label_recombination_limit: options.label_recombination_limit,
            allow_word_end_recombination: options.allow_word_end_recombination,
            word_end_recombination_limit: options.word_end_recombination_limit,

            need_end_processing,
            end_node,
            end_exit,
            restrict_with_input_length: options.restrict_with_input_length,
            prune_trace,
            trace_pruning: options.trace_pruning,
            trace_pruning_limit: options.trace_pruning_limit,

            fixed_beam_search: options.fixed_beam_search,
            length_norm,
            norm_label_only: options.normalize_label_only,
            norm_word_only: options.normalize_word_only,
            eos_threshold: options.eos_threshold,

            step_re_norm,
            step_early_stop,
            step_length_only: options.step_length_only,
            step_length_scale: options.step_length_scale,

            prune_words_with_labels,
            word_len_balance,
            word_len_scale: options.word_length_scale,

            pronunciation_scale: options.pronunciation_scale,

            decode_step: 0,
            input_length: 0,
            global_score_offset: 0.0,
            stop_search: false,

            best_label_score: INVALID_SCORE,
            best_label_prospect: INVALID_SCORE,
            best_word_end_prospect: INVALID_SCORE,
            best_end_trace_prospect: INVALID_SCORE,

            word_len_best_prospect: Vec::new(),
            word_len_score: Vec::new(),

            step_sum_score: INVALID_SCORE,
            step_end_score: INVALID_SCORE,
            step_accu_len_score: 0.0,

            instances: Vec::new(),
            instance_map: HashMap::new(),
            current_instance: 0,

            label_hyps: Vec::new(),
            new_label_hyps: Vec::new(),
            label_history_hash,

            early_word_ends: Vec::new(),
            word_ends: Vec::new(),

            end_traces: Vec::new(),
            best_label_end_trace: None,

            score_scratch: Vec::new(),
            loop_scratch: Vec::new(),
        };
        space.clear();
        Ok(space)
    }

    // ---- statistics ----

    pub fn n_active_trees(&self) -> usize {
        self.instances.len()
    }

    pub fn n_label_hypotheses(&self) -> usize {
        self.label_hyps.len()
    }

    pub fn n_word_end_hypotheses(&self) -> usize {
        self.word_ends.len()
    }

    pub fn n_end_traces(&self) -> usize {
        self.end_traces.len()
    }

    pub fn statistics(&self) -> &SearchStatistics {
        &self.stats
    }

    pub fn need_end_processing(&self) -> bool {
        self.need_end_processing
    }

    pub fn should_stop_search(&self) -> bool {
        self.stop_search
    }

    pub fn set_decode_step(&mut self, step: StepIndex) {
        self.decode_step = step;
    }

    pub fn set_input_length(&mut self, length: Position) {
        self.input_length = length;
    }

    pub fn global_score_offset(&self) -> f64 {
        self.global_score_offset
    }

    /// Reset the complete search space between segments.
    pub fn clear(&mut self) {
        self.label_hyps.clear();
        self.new_label_hyps.clear();
        self.instances.clear();
        self.instance_map.clear();
        self.current_instance = 0;
        self.early_word_ends.clear();
        self.word_ends.clear();
        self.end_traces.clear();
        self.best_label_end_trace = None;

        self.decode_step = 0;
        self.input_length = 0;
        self.global_score_offset = 0.0;
        self.best_label_score = INVALID_SCORE;
        self.best_label_prospect = INVALID_SCORE;
        self.best_word_end_prospect = INVALID_SCORE;
        self.best_end_trace_prospect = INVALID_SCORE;
        self.word_len_best_prospect.clear();
        self.word_len_score.clear();
        self.step_sum_score = INVALID_SCORE;
        self.step_end_score = INVALID_SCORE;
        self.step_accu_len_score = 0.0;
        self.stop_search = false;
    }

    /// Seed the segment with the empty-history word end at `step`.
    pub fn add_startup_word_end_hypothesis(&mut self, step: StepIndex) {
        let label_history = self.scorer.start_history();
        let (recombination_history, score_history) = match &self.lm {
            Some(lm) => (lm.start_history(), lm.start_history()),
            None => (LmHistory::root(), LmHistory::root()),
        };
        let lookahead_history = match &self.lookahead {
            Some(lookahead) => match &self.lm {
                Some(lm) => lookahead.reduced_history(&lm.start_history()),
                None => LmHistory::root(),
            },
            None => LmHistory::root(),
        };

        let trace = Trace::root(step, ScoreVector::ZERO);
        trace.borrow_mut().score.acoustic += self.global_score_offset as Score;
        self.word_ends.push(WordEndHypothesis {
            label_history,
            trace,
            recombination_history,
            score_history,
            lookahead_history,
            score: ScoreVector::ZERO,
            prospect: 0.0,
            node: INVALID_ID,
            exit: INVALID_ID,
            n_labels: 0,
            n_words: 0,
            position: 0,
        });
    }

    /// Activate or re-enter a tree instance for every surviving word end.
    pub fn start_new_trees(&mut self) {
        let word_ends = std::mem::take(&mut self.word_ends);
        for weh in &word_ends {
            self.activate_or_update_tree(weh);
        }
    }

    fn activate_or_update_tree(&mut self, weh: &WordEndHypothesis) {
        // instance keys are always the full-order recombination history
        let index = match self.instance_map.get(&weh.recombination_history) {
            Some(&index) => index,
            None => {
                let index = self.instances.len();
                self.instances.push(TreeInstance::new(
                    weh.recombination_history.clone(),
                    weh.score_history.clone(),
                    weh.lookahead_history.clone(),
                ));
                self.instance_map
                    .insert(weh.recombination_history.clone(), index);
                index
            }
        };
        let transit_root = if weh.exit == INVALID_ID {
            self.tree.root()
        } else {
            self.tree.exit(weh.exit).transit_root
        };
        let instance = &mut self.instances[index];
        instance.enter(transit_root, weh);
        // roots can stay in blank, so they need a recombination hash too
        let entry = instance.entry_labels.last_mut().expect("just entered");
        entry.hash = entry
            .history
            .reduced_hash_key(self.label_recombination_limit);
    }

    /// Subtract `offset` (default: the best label score) from every live
    /// hypothesis and account for it globally. Prospects are unchanged
    /// modulo the offset. Not available under length normalization.
    pub fn rescale(&mut self, offset: Score) {
        if self.length_norm {
            return;
        }
        let offset = if offset == 0.0 {
            self.best_label_score()
        } else {
            offset
        };
        debug_assert!(self.word_ends.is_empty() && self.early_word_ends.is_empty());
        for hyp in &mut self.label_hyps {
            hyp.score.acoustic -= offset;
        }
        self.global_score_offset += f64::from(offset);
    }

    pub fn best_label_score(&mut self) -> Score {
        if self.best_label_score == INVALID_SCORE {
            for hyp in &self.label_hyps {
                if hyp.score.total() < self.best_label_score {
                    self.best_label_score = hyp.score.total();
                }
            }
        }
        self.best_label_score
    }

    pub fn best_label_prospect(&mut self) -> Score {
        if self.best_label_prospect == INVALID_SCORE
            && let Some(index) = self.best_prospect_label()
        {
            self.best_label_prospect = self.label_hyps[index].prospect;
        }
        self.best_label_prospect
    }

    /// Index of the minimum-prospect label hypothesis (the first one when
    /// every prospect is infeasible).
    pub(crate) fn best_prospect_label(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, hyp) in self.label_hyps.iter().enumerate() {
            match best {
                None => best = Some(index),
                Some(current) if hyp.prospect < self.label_hyps[current].prospect => {
                    best = Some(index);
                }
                _ => {}
            }
        }
        best
    }

    pub(crate) fn best_prospect_label_tree(&self, index: usize) -> Option<usize> {
        self.instances
            .iter()
            .position(|instance| instance.labels.contains(index))
    }

    pub(crate) fn best_prospect_word_end(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, weh) in self.word_ends.iter().enumerate() {
            match best {
                None => best = Some(index),
                Some(current) if weh.prospect < self.word_ends[current].prospect => {
                    best = Some(index);
                }
                _ => {}
            }
        }
        best
    }

    /// Remove hypotheses that cannot expand any further (memory only; the
    /// last step keeps them for the fallback).
    pub fn clean_up(&mut self) {
        if self.allow_loop {
            return; // loops always leave successors
        }
        if self.need_end_processing && self.restrict_with_input_length {
            let last = if self.vertical_transition {
                self.decode_step == 2 * self.input_length.saturating_sub(1)
            } else {
                self.decode_step == self.input_length
            };
            if last {
                return;
            }
        }
        self.prune_labels(
            INVALID_SCORE,
            prune::PruneFlags {
                remove_non_expandable: true,
                delete_tree: true,
                ..prune::PruneFlags::default()
            },
        );
    }

    /// Rebuild the key-to-index map after instances were compacted.
    pub(crate) fn rebuild_instance_map(&mut self) {
        self.instance_map.clear();
        for (index, instance) in self.instances.iter().enumerate() {
            self.instance_map.insert(instance.key.clone(), index);
        }
    }
}
