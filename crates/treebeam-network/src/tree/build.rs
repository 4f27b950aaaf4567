//! Tree construction for the four modeling units.
//!
//! Determinization by prefix sharing; no minimization except for converted
//! HMM graphs, which arrive minimized.

use std::collections::HashSet;

use tracing::{debug, warn};

use treebeam_core::{LabelIndex, LabelScorer, LabelUnit, Lexicon, SearchOptions};

use super::{LabelTree, TRANSITION_ROOT, TRANSITION_SPECIAL, TransitionPenalty};
use crate::NetworkError;

/// Builds a [`LabelTree`] from the lexicon and the scorer's emission table.
pub struct TreeBuilder<'a> {
    lexicon: &'a Lexicon,
    scorer: &'a dyn LabelScorer,
    options: &'a SearchOptions,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        lexicon: &'a Lexicon,
        scorer: &'a dyn LabelScorer,
        options: &'a SearchOptions,
    ) -> Self {
        Self {
            lexicon,
            scorer,
            options,
        }
    }

    pub(crate) fn lexicon(&self) -> &Lexicon {
        self.lexicon
    }

    pub(crate) fn scorer(&self) -> &dyn LabelScorer {
        self.scorer
    }

    pub(crate) fn options(&self) -> &SearchOptions {
        self.options
    }

    /// Construct the tree for the configured label unit.
    ///
    /// HMM trees are converted from a tied-state graph; use
    /// [`TreeBuilder::build_hmm`] for those.
    pub fn build(&self) -> Result<LabelTree, NetworkError> {
        let mut tree = LabelTree::empty(self.options.label_unit);
        match self.options.label_unit {
            LabelUnit::Phoneme => self.build_phoneme(&mut tree)?,
            LabelUnit::Subword => self.build_subword(&mut tree)?,
            LabelUnit::Word => self.build_word(&mut tree)?,
            LabelUnit::Hmm => return Err(NetworkError::HmmNeedsStateGraph),
        }
        self.finish(tree)
    }

    fn finish(&self, mut tree: LabelTree) -> Result<LabelTree, NetworkError> {
        if tree.num_nodes() <= 1 {
            return Err(NetworkError::EmptyTree);
        }
        if self.options.use_transition_penalty && tree.transitions.is_empty() {
            self.make_transition_penalty(&mut tree)?;
        }
        debug!(
            nodes = tree.num_nodes(),
            exits = tree.all_exits().len(),
            "label tree built"
        );
        Ok(tree)
    }

    /// Labels never placed in the tree; handled explicitly by the search.
    fn skip_labels(&self) -> HashSet<LabelIndex> {
        [
            self.scorer.start_label_index(),
            self.scorer.end_label_index(),
            self.scorer.blank_label_index(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Map a lexicon symbol to an emission index honouring the
    /// unknown-label policy. `Ok(None)` means "skip this entry".
    fn resolve_label(&self, symbol: &str, context: &str) -> Result<Option<LabelIndex>, NetworkError> {
        if let Some(&index) = self.scorer.label_indices().get(symbol) {
            return Ok(Some(index));
        }
        if self.options.skip_unknown_label {
            return Ok(None);
        }
        match self.scorer.unknown_label_index() {
            Some(unknown) => {
                warn!(symbol, context, "mapped to unknown label");
                Ok(Some(unknown))
            }
            None => Err(NetworkError::UnknownLabel {
                symbol: symbol.to_owned(),
                context: context.to_owned(),
            }),
        }
    }

    fn build_phoneme(&self, tree: &mut LabelTree) -> Result<(), NetworkError> {
        tree.has_pronunciation = true;
        let skip = self.skip_labels();
        let silence = self.lexicon.special_lemma("silence").map(|l| l.id);

        'prons: for pron in self.lexicon.pronunciations() {
            let lemma = self.lexicon.lemma(pron.lemma);
            let is_silence = silence == Some(lemma.id);
            if self.options.skip_silence && is_silence {
                continue;
            }

            let mut labels = Vec::with_capacity(pron.phonemes.len());
            for phoneme in &pron.phonemes {
                match self.resolve_label(phoneme, &lemma.orth)? {
                    Some(index) if !skip.contains(&index) => labels.push(index),
                    _ => {
                        warn!(
                            orth = %lemma.orth,
                            phoneme = %phoneme,
                            "pronunciation skipped: unknown or reserved phoneme label"
                        );
                        continue 'prons;
                    }
                }
            }

            let mut node = tree.root();
            for &label in &labels {
                node = tree.extend_label(node, label);
            }
            let root = tree.root();
            tree.add_exit_to_node(
                node,
                Some(pron.id),
                Some(lemma.id),
                root,
                is_silence && !self.options.skip_silence,
            );
        }
        Ok(())
    }

    fn build_subword(&self, tree: &mut LabelTree) -> Result<(), NetworkError> {
        let skip = self.skip_labels();
        let silence = self.lexicon.special_lemma("silence").map(|l| l.id);

        'lemmas: for lemma in self.lexicon.lemmas() {
            let is_silence = silence == Some(lemma.id);
            if self.options.skip_silence && is_silence {
                continue;
            }
            if lemma.orth.is_empty() {
                continue;
            }

            // one chain of whitespace-separated tokens per lemma; different
            // token splits of the same word are different lemmas
            let mut labels = Vec::new();
            for token in lemma.orth.split_whitespace() {
                match self.resolve_label(token, &lemma.orth)? {
                    Some(index) if !skip.contains(&index) => labels.push(index),
                    _ => {
                        warn!(orth = %lemma.orth, token, "lemma skipped: unknown or reserved subword label");
                        continue 'lemmas;
                    }
                }
            }
            if labels.is_empty() {
                continue;
            }

            let mut node = tree.root();
            for &label in &labels {
                node = tree.extend_label(node, label);
            }
            let root = tree.root();
            tree.add_exit_to_node(
                node,
                None,
                Some(lemma.id),
                root,
                is_silence && !self.options.skip_silence,
            );
        }
        Ok(())
    }

    fn build_word(&self, tree: &mut LabelTree) -> Result<(), NetworkError> {
        let skip = self.skip_labels();
        let silence = self.lexicon.special_lemma("silence").map(|l| l.id);

        for lemma in self.lexicon.lemmas() {
            let is_silence = silence == Some(lemma.id);
            if self.options.skip_silence && is_silence {
                continue;
            }
            if lemma.orth.is_empty() {
                continue;
            }

            let Some(label) = self.resolve_label(&lemma.orth, &lemma.orth)? else {
                warn!(orth = %lemma.orth, "lemma skipped: unknown label");
                continue;
            };
            if skip.contains(&label) {
                debug!(orth = %lemma.orth, "lemma skipped: reserved label");
                continue;
            }

            let root = tree.root();
            let node = tree.extend_label(root, label);
            tree.add_exit_to_node(
                node,
                None,
                Some(lemma.id),
                root,
                is_silence && !self.options.skip_silence,
            );
        }
        Ok(())
    }

    /// Fill the 3-class penalty table from the options (non-HMM units).
    fn make_transition_penalty(&self, tree: &mut LabelTree) -> Result<(), NetworkError> {
        let penalties = &self.options.transition_penalty;
        let scale = penalties.scale();
        tree.use_transition_penalty = true;
        tree.transitions = [
            penalties.root_transition,
            penalties.default_transition,
            penalties.special_transition,
        ]
        .iter()
        .map(|class| {
            TransitionPenalty::new(class.loop_ * scale, class.forward * scale, class.exit * scale)
        })
        .collect();

        let mut special = HashSet::new();
        for symbol in &penalties.special_transition_labels {
            let index = self.scorer.label_indices().get(symbol).copied().ok_or_else(|| {
                NetworkError::UnknownLabel {
                    symbol: symbol.clone(),
                    context: "special-transition-labels".to_owned(),
                }
            })?;
            special.insert(index);
        }

        tree.node_transition.insert(tree.root(), TRANSITION_ROOT);
        for node in 1..tree.num_nodes() {
            if special.contains(&tree.label(node)) {
                tree.node_transition.insert(node, TRANSITION_SPECIAL);
            }
        }
        Ok(())
    }
}
