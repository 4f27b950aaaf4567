//! Score and id primitives shared by every treebeam crate.

use std::ops::{Add, AddAssign};

/// Negative log-probability. Lower is better.
pub type Score = f32;

/// Sentinel for "this path is infeasible". Expected during search, never an error.
pub const INVALID_SCORE: Score = f32::MAX;

/// Node of the lexical prefix tree (0 is the root).
pub type NodeId = u32;

/// Index into the acoustic model's emission table.
pub type LabelIndex = u32;

/// Index into the tree's exit table.
pub type ExitId = u32;

/// Node of the compressed lookahead structure (0 is the root).
pub type LookaheadId = u32;

/// Lemma id assigned by the lexicon.
pub type LemmaId = u32;

/// Pronunciation id assigned by the lexicon.
pub type PronId = u32;

/// Interned LM token id.
pub type TokenId = u32;

/// Global decode step (time frame if time-synchronous).
pub type StepIndex = u32;

/// Input (encoder) position.
pub type Position = u32;

/// Invalid marker shared by all u32 id spaces.
pub const INVALID_ID: u32 = u32::MAX;

/// Acoustic and language-model score halves of a hypothesis.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct ScoreVector {
    pub acoustic: Score,
    pub lm: Score,
}

impl ScoreVector {
    pub const ZERO: ScoreVector = ScoreVector {
        acoustic: 0.0,
        lm: 0.0,
    };

    pub fn new(acoustic: Score, lm: Score) -> Self {
        Self { acoustic, lm }
    }

    /// Combined score used for pruning and decision making.
    #[inline]
    pub fn total(&self) -> Score {
        self.acoustic + self.lm
    }

    #[inline]
    pub fn is_infeasible(&self) -> bool {
        self.total() >= INVALID_SCORE
    }
}

impl Add for ScoreVector {
    type Output = ScoreVector;

    fn add(self, rhs: ScoreVector) -> ScoreVector {
        ScoreVector {
            acoustic: self.acoustic + rhs.acoustic,
            lm: self.lm + rhs.lm,
        }
    }
}

impl AddAssign for ScoreVector {
    fn add_assign(&mut self, rhs: ScoreVector) {
        self.acoustic += rhs.acoustic;
        self.lm += rhs.lm;
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn score_vector_total_and_add() {
        let a = ScoreVector::new(1.5, 0.5);
        let b = ScoreVector::new(0.25, 0.75);
        assert_eq!(a.total(), 2.0);
        assert_eq!((a + b).total(), 3.0);

        let mut c = a;
        c += b;
        assert_eq!(c.acoustic, 1.75);
        assert_eq!(c.lm, 1.25);
    }

    #[test]
    fn infeasible_score_is_detected() {
        let v = ScoreVector::new(INVALID_SCORE, 0.0);
        assert!(v.is_infeasible());
        assert!(!ScoreVector::ZERO.is_infeasible());
    }
}
