//! The label-scorer seam.
//!
//! The search engine drives a neural (or otherwise) scorer exclusively
//! through [`LabelScorer`]. Capability flags select the synchronisation
//! regime; the engine never looks at scores it was not promised.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::history::LabelHistory;
use crate::types::{LabelIndex, Position, Score, StepIndex};

/// Synchronisation regime of a scorer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScorerTopology {
    /// Strictly monotonic; one step per input frame.
    #[default]
    TimeSync,
    /// One step per output label; ends by emitting the end label.
    LabelSync,
    /// RNN-T style; blank advances the input position.
    AlignmentSync,
    /// Scores whole segments `(length, score)` per label.
    Segmental,
}

#[derive(Debug, thiserror::Error)]
pub enum ScorerError {
    #[error("score row {row} has {got} entries, expected {expected} (or +1 / x2 for loop heads)")]
    RowWidth {
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("empty score matrix")]
    EmptyMatrix,

    #[error("special label `{0}` is not in the emission table")]
    UnknownSpecialLabel(String),

    #[error("failed to parse scorer spec: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-segment scores: `(length, joint score of label and duration)`.
pub type SegmentScores = Vec<(u32, Score)>;

/// Contract between the search engine and the acoustic label scorer.
///
/// `extend_history` may be a no-op for blank or loop transitions depending
/// on `blank_updates_history` / `loop_updates_history`; the engine checks
/// the flags before hashing histories for recombination.
pub trait LabelScorer {
    /// Number of output classes of the emission table.
    fn num_classes(&self) -> usize;

    /// Label name to emission index map used by the tree builders.
    fn label_indices(&self) -> &IndexMap<String, LabelIndex>;

    fn start_history(&mut self) -> LabelHistory {
        LabelHistory::root()
    }

    fn extend_history(
        &mut self,
        history: &LabelHistory,
        label: LabelIndex,
        position: Position,
        is_loop: bool,
    ) -> LabelHistory;

    /// Per-class scores for the current step. Length is `num_classes`,
    /// `num_classes + 1` (joint loop head) or `2 * num_classes`
    /// (label-dependent loop scores, queried with `is_loop = true`).
    fn scores(&mut self, history: &LabelHistory, is_loop: bool) -> &[Score];

    /// Segmental scorers only: `(length, score)` per reachable segment of
    /// `label` starting at `start`.
    fn segment_scores(
        &mut self,
        _history: &LabelHistory,
        _label: LabelIndex,
        _start: Position,
    ) -> SegmentScores {
        Vec::new()
    }

    // ---- capabilities ----
    fn is_history_dependent(&self) -> bool {
        false
    }
    fn is_position_dependent(&self) -> bool {
        false
    }
    fn use_relative_position(&self) -> bool {
        false
    }
    fn use_vertical_transition(&self) -> bool {
        false
    }
    fn need_end_processing(&self) -> bool {
        false
    }
    fn blank_updates_history(&self) -> bool {
        false
    }
    fn loop_updates_history(&self) -> bool {
        false
    }
    fn blank_label_index(&self) -> Option<LabelIndex> {
        None
    }
    fn end_label_index(&self) -> Option<LabelIndex> {
        None
    }
    fn unknown_label_index(&self) -> Option<LabelIndex> {
        None
    }
    fn start_label_index(&self) -> Option<LabelIndex> {
        None
    }

    // ---- buffer lifecycle ----
    /// Whether enough input is buffered to score the current step.
    fn buffer_filled(&self) -> bool {
        true
    }

    /// Input (encoder) length of the current segment.
    fn input_length(&self) -> Position;

    /// Whether decoding must stop before running `step`.
    fn reach_end(&self, step: StepIndex) -> bool;

    fn increase_decode_step(&mut self) {}

    /// Segmental scorers may drop buffered encodings before `min_pos`.
    fn clean_up_before_extension(&mut self, _min_pos: Position) {}

    /// Segmental scorers: whether a segment starting at `pos` may be final.
    fn maybe_final_segment(&self, _pos: Position) -> bool {
        false
    }
}

/// Serde spec for [`MatrixScorer`].
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixScorerSpec {
    /// Emission labels in index order.
    pub labels: Vec<String>,
    /// One row per decode step; row width `num_classes`,
    /// `num_classes + 1` or `2 * num_classes`.
    pub scores: Vec<Vec<Score>>,
    #[serde(default)]
    pub topology: ScorerTopology,
    #[serde(default)]
    pub blank_label: Option<String>,
    #[serde(default)]
    pub end_label: Option<String>,
    #[serde(default)]
    pub unknown_label: Option<String>,
    #[serde(default)]
    pub start_label: Option<String>,
    /// Encoder length; defaults to the number of score rows.
    #[serde(default)]
    pub input_length: Option<Position>,
    #[serde(default)]
    pub history_dependent: bool,
    #[serde(default)]
    pub blank_updates_history: bool,
    #[serde(default)]
    pub loop_updates_history: bool,
    /// Segmental topology only: scores per `(label, start)` pair.
    #[serde(default)]
    pub segments: Vec<SegmentSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentSpec {
    pub label: LabelIndex,
    pub start: Position,
    pub spans: SegmentScores,
}

/// Precomputed score-matrix scorer used by the CLI and the test suites.
///
/// Row selection is by decode step; the topology flags are taken verbatim
/// from the spec, so any synchronisation regime can be emulated.
#[derive(Debug, Clone)]
pub struct MatrixScorer {
    labels: IndexMap<String, LabelIndex>,
    scores: Vec<Vec<Score>>,
    topology: ScorerTopology,
    blank: Option<LabelIndex>,
    end: Option<LabelIndex>,
    unknown: Option<LabelIndex>,
    start: Option<LabelIndex>,
    input_length: Position,
    history_dependent: bool,
    blank_updates_history: bool,
    loop_updates_history: bool,
    segments: Vec<SegmentSpec>,
    step: StepIndex,
}

impl MatrixScorer {
    pub fn from_spec(spec: MatrixScorerSpec) -> Result<Self, ScorerError> {
        let num_classes = spec.labels.len();
        if spec.scores.is_empty() && spec.segments.is_empty() {
            return Err(ScorerError::EmptyMatrix);
        }
        for (row, scores) in spec.scores.iter().enumerate() {
            let w = scores.len();
            if w != num_classes && w != num_classes + 1 && w != 2 * num_classes {
                return Err(ScorerError::RowWidth {
                    row,
                    got: w,
                    expected: num_classes,
                });
            }
        }

        let labels: IndexMap<String, LabelIndex> = spec
            .labels
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as LabelIndex))
            .collect();
        let resolve = |name: &Option<String>| -> Result<Option<LabelIndex>, ScorerError> {
            match name {
                None => Ok(None),
                Some(n) => labels
                    .get(n)
                    .copied()
                    .map(Some)
                    .ok_or_else(|| ScorerError::UnknownSpecialLabel(n.clone())),
            }
        };

        let input_length = spec.input_length.unwrap_or(spec.scores.len() as Position);
        Ok(Self {
            blank: resolve(&spec.blank_label)?,
            end: resolve(&spec.end_label)?,
            unknown: resolve(&spec.unknown_label)?,
            start: resolve(&spec.start_label)?,
            labels,
            scores: spec.scores,
            topology: spec.topology,
            input_length,
            history_dependent: spec.history_dependent,
            blank_updates_history: spec.blank_updates_history,
            loop_updates_history: spec.loop_updates_history,
            segments: spec.segments,
            step: 0,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, ScorerError> {
        Self::from_spec(serde_json::from_str(json)?)
    }

    fn current_row(&self) -> &[Score] {
        let row = (self.step as usize).min(self.scores.len().saturating_sub(1));
        &self.scores[row]
    }
}

impl LabelScorer for MatrixScorer {
    fn num_classes(&self) -> usize {
        self.labels.len()
    }

    fn label_indices(&self) -> &IndexMap<String, LabelIndex> {
        &self.labels
    }

    fn extend_history(
        &mut self,
        history: &LabelHistory,
        label: LabelIndex,
        _position: Position,
        is_loop: bool,
    ) -> LabelHistory {
        let is_blank = self.blank == Some(label);
        if (is_blank && !self.blank_updates_history) || (is_loop && !self.loop_updates_history) {
            return history.clone();
        }
        history.extended(label)
    }

    fn scores(&mut self, _history: &LabelHistory, _is_loop: bool) -> &[Score] {
        self.current_row()
    }

    fn segment_scores(
        &mut self,
        _history: &LabelHistory,
        label: LabelIndex,
        start: Position,
    ) -> SegmentScores {
        self.segments
            .iter()
            .find(|s| s.label == label && s.start == start)
            .map(|s| s.spans.clone())
            .unwrap_or_default()
    }

    fn is_history_dependent(&self) -> bool {
        self.history_dependent
    }

    fn is_position_dependent(&self) -> bool {
        self.topology == ScorerTopology::Segmental
    }

    fn use_vertical_transition(&self) -> bool {
        self.topology == ScorerTopology::AlignmentSync
    }

    fn need_end_processing(&self) -> bool {
        matches!(
            self.topology,
            ScorerTopology::LabelSync | ScorerTopology::AlignmentSync | ScorerTopology::Segmental
        )
    }

    fn blank_updates_history(&self) -> bool {
        self.blank_updates_history
    }

    fn loop_updates_history(&self) -> bool {
        self.loop_updates_history
    }

    fn blank_label_index(&self) -> Option<LabelIndex> {
        self.blank
    }

    fn end_label_index(&self) -> Option<LabelIndex> {
        self.end
    }

    fn unknown_label_index(&self) -> Option<LabelIndex> {
        self.unknown
    }

    fn start_label_index(&self) -> Option<LabelIndex> {
        self.start
    }

    fn input_length(&self) -> Position {
        self.input_length
    }

    fn reach_end(&self, step: StepIndex) -> bool {
        match self.topology {
            ScorerTopology::TimeSync => step >= self.input_length,
            // label/alignment-sync and segmental regimes end through end
            // processing; the matrix bounds the number of scoreable steps
            _ => step as usize >= self.scores.len().max(1),
        }
    }

    fn increase_decode_step(&mut self) {
        self.step += 1;
    }
}

#[cfg(test)]
mod scorer_tests {
    use super::*;

    fn spec(scores: Vec<Vec<Score>>) -> MatrixScorerSpec {
        MatrixScorerSpec {
            labels: vec!["a".into(), "b".into(), "c".into()],
            scores,
            topology: ScorerTopology::TimeSync,
            blank_label: None,
            end_label: None,
            unknown_label: None,
            start_label: None,
            input_length: None,
            history_dependent: false,
            blank_updates_history: false,
            loop_updates_history: false,
            segments: Vec::new(),
        }
    }

    #[test]
    fn rows_advance_with_decode_steps() {
        let mut scorer =
            MatrixScorer::from_spec(spec(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]])).unwrap();
        let h = scorer.start_history();
        assert_eq!(scorer.scores(&h, false), &[1.0, 2.0, 3.0]);
        scorer.increase_decode_step();
        assert_eq!(scorer.scores(&h, false), &[4.0, 5.0, 6.0]);
        assert_eq!(scorer.input_length(), 2);
        assert!(!scorer.reach_end(1));
        assert!(scorer.reach_end(2));
    }

    #[test]
    fn row_width_is_validated() {
        assert!(matches!(
            MatrixScorer::from_spec(spec(vec![vec![1.0, 2.0]])),
            Err(ScorerError::RowWidth { row: 0, .. })
        ));
        // loop-head widths are accepted
        assert!(MatrixScorer::from_spec(spec(vec![vec![0.0; 4]])).is_ok());
        assert!(MatrixScorer::from_spec(spec(vec![vec![0.0; 6]])).is_ok());
    }

    #[test]
    fn blank_and_loop_history_updates_follow_flags() {
        let mut s = spec(vec![vec![0.0; 3]]);
        s.blank_label = Some("c".into());
        let mut scorer = MatrixScorer::from_spec(s).unwrap();
        let h = scorer.start_history();

        let after_blank = scorer.extend_history(&h, 2, 0, false);
        assert_eq!(after_blank.len(), 0);
        let after_label = scorer.extend_history(&h, 1, 0, false);
        assert_eq!(after_label.len(), 1);
        let after_loop = scorer.extend_history(&after_label, 1, 0, true);
        assert_eq!(after_loop.len(), 1);
    }
}
