//! In-beam hypothesis objects.

use treebeam_core::{ExitId, LabelHistory, LmHistory, NodeId, Position, Score, ScoreVector};

use crate::trace::TraceRef;

/// Label-history-dependent label hypothesis.
#[derive(Debug, Clone)]
pub struct LabelHypothesis {
    pub node: NodeId,

    pub score: ScoreVector,
    /// Local score of the producing step; the EOS filter compares it.
    pub local: Score,
    /// Pruning key: score plus lookahead, possibly normalised.
    pub prospect: Score,

    /// Index into the owning instance's entry traces.
    pub trace_id: u32,
    pub history: LabelHistory,

    pub n_labels: u32,
    pub n_words: u32,

    /// Input position (alignment-sync / segmental) or relative position.
    pub position: Position,

    pub is_blank: bool,
    pub is_loop: bool,
    /// Consecutive loop occurrences (minimum-duration gating).
    pub n_loop: u32,

    /// Reduced label-history hash for recombination.
    pub hash: u64,
}

impl LabelHypothesis {
    pub fn entry(
        node: NodeId,
        score: ScoreVector,
        trace_id: u32,
        history: LabelHistory,
        n_labels: u32,
        n_words: u32,
        position: Position,
    ) -> Self {
        Self {
            node,
            score,
            local: 0.0,
            prospect: 0.0,
            trace_id,
            history,
            n_labels,
            n_words,
            position,
            is_blank: false,
            is_loop: false,
            n_loop: 0,
            hash: 0,
        }
    }
}

/// Word end before global pruning; histories are not yet extended.
#[derive(Debug, Clone)]
pub struct EarlyWordEndHypothesis {
    pub history: LabelHistory,

    /// Last tree node of the word.
    pub node: NodeId,
    pub trace_id: u32,
    pub exit: ExitId,
    /// Needed for the delayed label-history extension.
    pub is_loop: bool,

    pub score: ScoreVector,
    pub prospect: Score,

    pub n_labels: u32,
    pub n_words: u32,
    pub position: Position,
}

/// LM-history-dependent word-end hypothesis.
#[derive(Debug, Clone)]
pub struct WordEndHypothesis {
    pub label_history: LabelHistory,

    pub trace: TraceRef,

    pub recombination_history: LmHistory,
    pub score_history: LmHistory,
    pub lookahead_history: LmHistory,

    pub score: ScoreVector,
    pub prospect: Score,

    /// Last tree node of the word; `INVALID_ID` on the startup hypothesis.
    pub node: NodeId,
    /// `INVALID_ID` on the startup hypothesis.
    pub exit: ExitId,

    pub n_labels: u32,
    pub n_words: u32,
    pub position: Position,
}
