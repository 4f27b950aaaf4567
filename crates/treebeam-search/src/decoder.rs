//! Segment decoder: drives the search space once per decode step and
//! extracts the best hypothesis and the lattice.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use treebeam_core::{
    INVALID_SCORE, LabelScorer, LanguageModel, LemmaId, Lexicon, Position, PronId, Score,
    ScoreVector, SearchOptions, StepIndex,
};
use treebeam_network::StateGraph;

use crate::SearchError;
use crate::space::SearchSpace;
use crate::trace::TraceRef;

/// One recognised word of the best path.
#[derive(Debug, Clone, Serialize)]
pub struct TracebackItem {
    pub orth: Option<String>,
    pub lemma: Option<LemmaId>,
    pub pronunciation: Option<PronId>,
    /// Whether the lemma carries LM tokens (silence and friends do not).
    pub is_word: bool,
    pub step: StepIndex,
    pub position: Position,
    pub acoustic: Score,
    pub lm: Score,
}

/// Serialisable word lattice: arcs point at their predecessor arc;
/// `sibling_of` groups recombined alternatives.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Lattice {
    pub arcs: Vec<LatticeArc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatticeArc {
    pub id: usize,
    pub predecessor: Option<usize>,
    pub sibling_of: Option<usize>,
    pub orth: Option<String>,
    pub lemma: Option<LemmaId>,
    pub step: StepIndex,
    pub acoustic: Score,
    pub lm: Score,
    pub prospect: Score,
}

/// Result of one decoded segment.
#[derive(Debug, Clone, Serialize)]
pub struct DecodeResult {
    /// Best path, oldest word first.
    pub best: Vec<TracebackItem>,
    pub score: ScoreVector,
    pub n_labels: u32,
    pub n_words: u32,
    pub steps: StepIndex,
    pub lattice: Option<Lattice>,
}

impl DecodeResult {
    /// Space-joined orthography of the word items on the best path.
    pub fn text(&self) -> String {
        let words: Vec<&str> = self
            .best
            .iter()
            .filter(|item| item.is_word)
            .filter_map(|item| item.orth.as_deref())
            .collect();
        words.join(" ")
    }
}

/// Owns the search space and runs the per-step loop over a segment.
pub struct Decoder {
    space: SearchSpace,
    simple_beam: bool,
    rescale_threshold: Score,
}

impl Decoder {
    pub fn new(
        lexicon: Arc<Lexicon>,
        scorer: Box<dyn LabelScorer>,
        lm: Option<Arc<dyn LanguageModel>>,
        options: &SearchOptions,
        state_graph: Option<&StateGraph>,
    ) -> Result<Self, SearchError> {
        let space = SearchSpace::new(lexicon, scorer, lm, options, state_graph)?;
        Ok(Self {
            space,
            simple_beam: options.simple_beam_search,
            rescale_threshold: options.score_rescale_threshold,
        })
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut SearchSpace {
        &mut self.space
    }

    /// Decode the scorer's current segment.
    pub fn decode_segment(&mut self, create_lattice: bool) -> Result<DecodeResult, SearchError> {
        self.space.clear();
        let input_length = self.space.scorer.input_length();
        self.space.set_input_length(input_length);
        self.space.add_startup_word_end_hypothesis(0);

        let mut step: StepIndex = 0;
        loop {
            if self.space.scorer.reach_end(step) || !self.space.scorer.buffer_filled() {
                break;
            }
            if self.space.may_stop_early() {
                break;
            }
            self.space.set_decode_step(step);

            self.space.start_new_trees();
            self.space.expand_labels();
            if self.simple_beam {
                self.space.find_word_ends_and_prune_global();
            } else {
                self.space.apply_label_pruning();
                let best = self.space.best_label_score();
                if best != INVALID_SCORE && best > self.rescale_threshold {
                    self.space.rescale(0.0);
                }
                self.space.find_word_ends_and_prune();
            }
            self.space.extend_word_histories();
            self.space.create_traces();
            self.space.recombine_word_ends(create_lattice);
            if create_lattice {
                self.space.optimize_lattice();
            }
            self.space.process_end();
            if self.space.should_stop_search() {
                break;
            }
            self.space.clean_up();

            step += 1;
            self.space.scorer.increase_decode_step();
        }
        self.space.set_decode_step(step);

        let trace = self
            .space
            .get_sentence_end(create_lattice)
            .or_else(|| self.space.get_sentence_end_fallback())
            .ok_or(SearchError::NoSentenceEnd)?;

        debug!(
            steps = step,
            trees = self.space.n_active_trees(),
            labels = self.space.n_label_hypotheses(),
            "segment decoded"
        );
        self.space.statistics().log_summary();

        let lexicon = Arc::clone(&self.space.lexicon);
        let lattice = create_lattice.then(|| build_lattice(&trace, &lexicon));
        let (score, n_labels, n_words) = {
            let t = trace.borrow();
            (t.score, t.n_labels, t.n_words)
        };
        Ok(DecodeResult {
            best: traceback(&trace, &lexicon),
            score,
            n_labels,
            n_words,
            steps: step,
            lattice,
        })
    }
}

/// Walk the predecessor chain, oldest word first.
pub fn traceback(trace: &TraceRef, lexicon: &Lexicon) -> Vec<TracebackItem> {
    let mut items = Vec::new();
    let mut current = Some(trace.clone());
    while let Some(t) = current {
        let t = t.borrow();
        if t.predecessor.is_some() || t.lemma.is_some() || t.pronunciation.is_some() {
            items.push(TracebackItem {
                orth: t.lemma.map(|l| lexicon.lemma(l).orth.clone()),
                lemma: t.lemma,
                pronunciation: t.pronunciation,
                is_word: t.lemma.is_some_and(|l| lexicon.lemma(l).has_synt()),
                step: t.step,
                position: t.position,
                acoustic: t.score.acoustic,
                lm: t.score.lm,
            });
        }
        current = t.predecessor.clone();
    }
    items.reverse();
    items
}

/// Serialise the trace DAG reachable over predecessor and sibling links.
pub fn build_lattice(root: &TraceRef, lexicon: &Lexicon) -> Lattice {
    let mut lattice = Lattice::default();
    let mut ids: HashMap<*const (), usize> = HashMap::new();
    let mut queue: Vec<(TraceRef, Option<usize>)> = vec![(root.clone(), None)];

    while let Some((trace, sibling_of)) = queue.pop() {
        let key = Rc::as_ptr(&trace) as *const ();
        if ids.contains_key(&key) {
            continue;
        }
        let id = lattice.arcs.len();
        ids.insert(key, id);

        let (predecessor, sibling) = {
            let t = trace.borrow();
            (t.predecessor.clone(), t.sibling.clone())
        };
        {
            let t = trace.borrow();
            lattice.arcs.push(LatticeArc {
                id,
                predecessor: None,
                sibling_of,
                orth: t.lemma.map(|l| lexicon.lemma(l).orth.clone()),
                lemma: t.lemma,
                step: t.step,
                acoustic: t.score.acoustic,
                lm: t.score.lm,
                prospect: t.prospect,
            });
        }
        if let Some(pre) = predecessor {
            queue.push((pre, None));
        }
        if let Some(sib) = sibling {
            queue.push((sib, Some(id)));
        }
    }

    // resolve predecessor ids in a second pass now that all arcs exist
    let mut queue: Vec<TraceRef> = vec![root.clone()];
    let mut seen: HashMap<*const (), bool> = HashMap::new();
    while let Some(trace) = queue.pop() {
        let key = Rc::as_ptr(&trace) as *const ();
        if seen.insert(key, true).is_some() {
            continue;
        }
        let (predecessor, sibling) = {
            let t = trace.borrow();
            (t.predecessor.clone(), t.sibling.clone())
        };
        if let Some(pre) = &predecessor {
            let pre_key = Rc::as_ptr(pre) as *const ();
            let id = ids[&key];
            lattice.arcs[id].predecessor = ids.get(&pre_key).copied();
        }
        if let Some(pre) = predecessor {
            queue.push(pre);
        }
        if let Some(sib) = sibling {
            queue.push(sib);
        }
    }

    lattice
}
