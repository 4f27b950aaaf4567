//! Back-pointer traces forming the lattice topology.
//!
//! Traces are shared with counted ownership: a trace lives as long as a
//! hypothesis, a successor trace or a lattice root still points at it.
//! Predecessor links give the best-path traceback, sibling links the
//! recombined alternatives. Histories are only stamped on end traces.

use std::cell::RefCell;
use std::rc::Rc;

use treebeam_core::{
    LabelHistory, LemmaId, LmHistory, Position, PronId, Score, ScoreVector, StepIndex,
};

pub type TraceRef = Rc<RefCell<Trace>>;

#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub predecessor: Option<TraceRef>,
    pub sibling: Option<TraceRef>,

    pub pronunciation: Option<PronId>,
    pub lemma: Option<LemmaId>,

    pub step: StepIndex,
    pub score: ScoreVector,
    pub position: Position,
    pub n_labels: u32,
    pub n_words: u32,

    /// Pruning and decision key; maintained for end traces only.
    pub prospect: Score,

    // end traces only (memory explosion otherwise)
    pub recombination_history: Option<LmHistory>,
    /// Fallback traces keep the score history for sentence-end scoring.
    pub score_history: Option<LmHistory>,
    pub label_history: Option<LabelHistory>,
}

impl Trace {
    /// Root trace starting a segment.
    pub fn root(step: StepIndex, score: ScoreVector) -> TraceRef {
        Rc::new(RefCell::new(Trace {
            step,
            score,
            ..Trace::default()
        }))
    }

    /// Word-end trace extending `predecessor`.
    #[allow(clippy::too_many_arguments)]
    pub fn extended(
        predecessor: TraceRef,
        pronunciation: Option<PronId>,
        lemma: Option<LemmaId>,
        step: StepIndex,
        score: ScoreVector,
        n_labels: u32,
        n_words: u32,
        position: Position,
    ) -> TraceRef {
        Rc::new(RefCell::new(Trace {
            predecessor: Some(predecessor),
            sibling: None,
            pronunciation,
            lemma,
            step,
            score,
            position,
            n_labels,
            n_words,
            prospect: 0.0,
            recombination_history: None,
            score_history: None,
            label_history: None,
        }))
    }
}

/// Number of predecessor hops to the segment root.
pub fn depth(trace: &TraceRef) -> u32 {
    let mut hops = 0;
    let mut current = trace.clone();
    loop {
        let predecessor = current.borrow().predecessor.clone();
        match predecessor {
            Some(pre) => {
                hops += 1;
                current = pre;
            }
            None => return hops,
        }
    }
}

#[cfg(test)]
mod trace_tests {
    use super::*;

    #[test]
    fn traces_are_collected_when_the_last_owner_drops() {
        let root = Trace::root(0, ScoreVector::ZERO);
        let a = Trace::extended(root.clone(), None, Some(1), 3, ScoreVector::ZERO, 3, 1, 0);
        let b = Trace::extended(a.clone(), None, Some(2), 5, ScoreVector::ZERO, 5, 2, 0);
        assert_eq!(Rc::strong_count(&root), 2);
        drop(a);
        // still alive through b's predecessor chain
        assert_eq!(depth(&b), 2);
        drop(root);
        assert_eq!(depth(&b), 2);
    }

    #[test]
    fn sibling_links_do_not_extend_depth() {
        let root = Trace::root(0, ScoreVector::ZERO);
        let a = Trace::extended(root.clone(), None, Some(1), 2, ScoreVector::ZERO, 2, 1, 0);
        let b = Trace::extended(root, None, Some(2), 2, ScoreVector::ZERO, 2, 1, 0);
        a.borrow_mut().sibling = Some(b);
        assert_eq!(depth(&a), 1);
    }
}
