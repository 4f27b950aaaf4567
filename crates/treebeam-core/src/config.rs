//! Search configuration surface.
//!
//! One serde struct covers the whole option set; every field has the
//! engine's default so partial JSON configs stay short.

use serde::Deserialize;
use std::path::PathBuf;

use crate::types::{INVALID_SCORE, Score};

/// Modeling unit of the label tree (has to match the label scorer).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelUnit {
    /// Converted from a tied-state HMM graph.
    Hmm,
    #[default]
    Phoneme,
    /// Whitespace-separated tokens of the preferred orthography.
    Subword,
    /// Whole orthography as one label.
    Word,
}

/// Per-class transition penalties (negative log probabilities).
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PenaltyClass {
    #[serde(rename = "loop")]
    pub loop_: Score,
    pub forward: Score,
    pub exit: Score,
}

impl Default for PenaltyClass {
    fn default() -> Self {
        Self {
            loop_: 3.0,
            forward: 0.0,
            exit: 0.0,
        }
    }
}

/// The 3-class transition penalty table: root, default, special.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransitionPenaltyOptions {
    pub root_transition: PenaltyClass,
    pub default_transition: PenaltyClass,
    pub special_transition: PenaltyClass,
    pub transition_scale: Option<Score>,
    /// Labels assigned to the special class.
    pub special_transition_labels: Vec<String>,
}

impl TransitionPenaltyOptions {
    pub fn scale(&self) -> Score {
        self.transition_scale.unwrap_or(1.0)
    }
}

/// Options consumed by the search core. Field names mirror the
/// configuration keys (kebab-case in JSON).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SearchOptions {
    // network construction
    pub label_unit: LabelUnit,
    pub skip_unknown_label: bool,
    pub skip_silence: bool,
    pub use_transition_penalty: bool,
    pub transition_penalty: TransitionPenaltyOptions,

    // language model
    pub use_lm_score: bool,
    pub lm_lookahead: bool,
    pub lm_lookahead_scale: Score,
    /// History limit of the lookahead LM; negative keeps the full order.
    pub lm_lookahead_history_limit: i32,
    pub pronunciation_scale: Score,

    // decision rule
    pub full_sum_decoding: bool,
    pub label_full_sum: bool,

    // per-step label beam
    pub local_label_pruning: Score,
    pub label_pruning: Score,
    pub label_pruning_limit: u32,

    // word-end beam; a value <= 1.0 is a fraction of label-pruning
    pub word_end_pruning: Score,
    pub word_end_pruning_limit: u32,

    pub histogram_pruning_bins: u32,

    // tree instance lifecycle
    pub instance_deletion_tolerance: u32,
    pub instance_lookahead_label_threshold: f32,

    // topology
    pub allow_label_loop: bool,
    pub min_loop_occurrence: u32,
    pub allow_blank_label: bool,
    pub blank_label_penalty: Score,
    pub blank_label_probability_threshold: f32,
    pub allow_blank_segment: bool,
    pub relative_position_clipping: u32,

    // recombination
    pub allow_label_recombination: bool,
    pub label_recombination_limit: i32,
    pub allow_word_end_recombination: bool,
    pub word_end_recombination_limit: i32,

    // end-trace management
    pub prune_trace: bool,
    pub trace_pruning: Score,
    pub trace_pruning_limit: u32,
    pub restrict_with_input_length: bool,

    // derived length model
    pub step_re_normalization: bool,
    pub step_early_stop: bool,
    pub step_length_only: bool,
    pub step_length_scale: Score,

    // global pruning policies
    pub prune_words_with_labels: bool,
    pub word_length_balance: bool,
    pub word_length_scale: Score,

    // simple beam search + heuristics
    pub simple_beam_search: bool,
    pub fixed_beam_search: bool,
    pub eos_threshold: Score,
    pub length_normalization: bool,
    pub normalize_label_only: bool,
    pub normalize_word_only: bool,

    // numerics
    pub score_rescale_threshold: Score,

    // persistence
    pub cache_dir: Option<PathBuf>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            label_unit: LabelUnit::Phoneme,
            skip_unknown_label: true,
            skip_silence: false,
            use_transition_penalty: false,
            transition_penalty: TransitionPenaltyOptions::default(),

            use_lm_score: true,
            lm_lookahead: true,
            lm_lookahead_scale: 1.0,
            lm_lookahead_history_limit: -1,
            pronunciation_scale: 1.0,

            full_sum_decoding: false,
            label_full_sum: false,

            local_label_pruning: INVALID_SCORE,
            label_pruning: INVALID_SCORE,
            label_pruning_limit: 50_000,

            word_end_pruning: INVALID_SCORE,
            word_end_pruning_limit: 5_000,

            histogram_pruning_bins: 101,

            instance_deletion_tolerance: 0,
            instance_lookahead_label_threshold: 0.0,

            allow_label_loop: false,
            min_loop_occurrence: 0,
            allow_blank_label: false,
            blank_label_penalty: 0.0,
            blank_label_probability_threshold: 0.0,
            allow_blank_segment: false,
            relative_position_clipping: 32,

            allow_label_recombination: false,
            label_recombination_limit: -1,
            allow_word_end_recombination: true,
            word_end_recombination_limit: -1,

            prune_trace: true,
            trace_pruning: INVALID_SCORE,
            trace_pruning_limit: 1_000,
            restrict_with_input_length: true,

            step_re_normalization: false,
            step_early_stop: true,
            step_length_only: false,
            step_length_scale: 1.0,

            prune_words_with_labels: false,
            word_length_balance: false,
            word_length_scale: 1.0,

            simple_beam_search: false,
            fixed_beam_search: false,
            eos_threshold: INVALID_SCORE,
            length_normalization: false,
            normalize_label_only: true,
            normalize_word_only: false,

            score_rescale_threshold: 10_000.0,

            cache_dir: None,
        }
    }
}

impl SearchOptions {
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Effective word-end pruning threshold: values <= 1.0 are interpreted
    /// as a fraction of label-pruning.
    pub fn effective_word_end_pruning(&self) -> Score {
        if self.word_end_pruning <= 1.0 {
            self.word_end_pruning * self.label_pruning
        } else {
            self.word_end_pruning
        }
    }
}
