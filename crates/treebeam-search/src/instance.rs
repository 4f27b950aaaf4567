//! Tree instances: per-LM-history activations of the static tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use treebeam_core::{
    INVALID_SCORE, LanguageModel, LemmaId, Lexicon, LmHistory, NodeId, Score, add_lemma_score,
};
use treebeam_network::LookaheadTable;

use crate::hyp::{LabelHypothesis, WordEndHypothesis};
use crate::trace::TraceRef;

/// `[begin, end)` range into one of the flat hypothesis arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypRange {
    pub begin: usize,
    pub end: usize,
}

impl HypRange {
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.begin && index < self.end
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }
}

/// Runtime activation of the tree for one recombination history.
///
/// Word ends entering the same history land in the same instance; each
/// entry contributes a trace and a root label hypothesis consumed by the
/// next expansion.
#[derive(Debug)]
pub struct TreeInstance {
    /// Steps this instance has been empty; drives deletion tolerance.
    pub inactive: u32,
    /// Full-order recombination history, the instance key.
    pub key: LmHistory,

    pub score_history: LmHistory,
    pub lookahead_history: LmHistory,
    pub lookahead: Option<Arc<LookaheadTable>>,

    /// Best local score of a non-end label this step (EOS filtering).
    pub best_non_end_local: Score,

    pub entry_traces: Vec<TraceRef>,
    pub entry_labels: Vec<LabelHypothesis>,
    /// Word lengths of the entered traces (word-length balancing).
    pub entry_n_words: HashSet<u32>,

    pub labels: HypRange,
    pub early_word_ends: HypRange,

    /// LM scores in this context, cached per lemma.
    lm_cache: HashMap<LemmaId, Score>,
}

impl TreeInstance {
    pub fn new(key: LmHistory, score_history: LmHistory, lookahead_history: LmHistory) -> Self {
        Self {
            inactive: 0,
            key,
            score_history,
            lookahead_history,
            lookahead: None,
            best_non_end_local: INVALID_SCORE,
            entry_traces: Vec::new(),
            entry_labels: Vec::new(),
            entry_n_words: HashSet::new(),
            labels: HypRange::default(),
            early_word_ends: HypRange::default(),
            lm_cache: HashMap::new(),
        }
    }

    /// Queue a word end on this instance as an entry at `transit_root`.
    pub fn enter(&mut self, transit_root: NodeId, weh: &WordEndHypothesis) {
        let trace_id = self.entry_traces.len() as u32;
        self.entry_traces.push(weh.trace.clone());
        self.entry_labels.push(LabelHypothesis::entry(
            transit_root,
            weh.score,
            trace_id,
            weh.label_history.clone(),
            weh.n_labels,
            weh.n_words,
            weh.position,
        ));
        self.entry_n_words.insert(weh.n_words);
    }

    /// Cached LM score of `lemma` in this instance's scoring context,
    /// without the pronunciation score.
    pub fn lm_score(
        &mut self,
        lm: &dyn LanguageModel,
        lexicon: &Lexicon,
        lemma: Option<LemmaId>,
    ) -> Score {
        let Some(lemma) = lemma else {
            return 0.0;
        };
        if let Some(&score) = self.lm_cache.get(&lemma) {
            return score;
        }
        let score = add_lemma_score(lm, &self.score_history, lexicon.lemma(lemma));
        self.lm_cache.insert(lemma, score);
        score
    }
}

#[cfg(test)]
mod instance_tests {
    use super::*;
    use crate::trace::Trace;
    use treebeam_core::{
        INVALID_ID, LabelHistory, Lexicon, ScoreVector, TableLm, TableLmEntry, TableLmSpec,
    };

    fn lexicon_and_lm() -> (Lexicon, TableLm) {
        let mut lexicon = Lexicon::from_json_str(
            r#"{ "lemmas": [ { "orth": "CAT" }, { "orth": "CAR" } ]}"#,
        )
        .unwrap();
        let lm = TableLm::from_spec(
            TableLmSpec {
                order: 1,
                scale: 1.0,
                default_score: INVALID_SCORE,
                entries: vec![TableLmEntry {
                    context: vec![],
                    token: "CAT".into(),
                    score: 2.0,
                }],
            },
            lexicon.tokens_mut(),
        );
        (lexicon, lm)
    }

    fn startup_weh() -> WordEndHypothesis {
        WordEndHypothesis {
            label_history: LabelHistory::root(),
            trace: Trace::root(0, ScoreVector::ZERO),
            recombination_history: LmHistory::root(),
            score_history: LmHistory::root(),
            lookahead_history: LmHistory::root(),
            score: ScoreVector::new(1.0, 0.5),
            prospect: 0.0,
            node: INVALID_ID,
            exit: INVALID_ID,
            n_labels: 2,
            n_words: 1,
            position: 0,
        }
    }

    #[test]
    fn entering_appends_traces_and_entry_labels() {
        let mut instance =
            TreeInstance::new(LmHistory::root(), LmHistory::root(), LmHistory::root());
        let weh = startup_weh();
        instance.enter(0, &weh);
        instance.enter(3, &weh);

        assert_eq!(instance.entry_traces.len(), 2);
        assert_eq!(instance.entry_labels.len(), 2);
        assert_eq!(instance.entry_labels[0].trace_id, 0);
        assert_eq!(instance.entry_labels[1].trace_id, 1);
        assert_eq!(instance.entry_labels[1].node, 3);
        assert_eq!(instance.entry_labels[0].n_words, 1);
        assert_eq!(instance.entry_n_words.len(), 1);
    }

    #[test]
    fn lm_scores_are_cached_per_lemma() {
        let (lexicon, lm) = lexicon_and_lm();
        let mut instance =
            TreeInstance::new(LmHistory::root(), LmHistory::root(), LmHistory::root());

        assert_eq!(instance.lm_score(&lm, &lexicon, None), 0.0);
        assert_eq!(instance.lm_score(&lm, &lexicon, Some(0)), 2.0);
        assert_eq!(instance.lm_score(&lm, &lexicon, Some(0)), 2.0);
        assert_eq!(instance.lm_score(&lm, &lexicon, Some(1)), INVALID_SCORE);
    }
}
