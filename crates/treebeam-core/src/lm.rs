//! The language-model seam.
//!
//! The search engine only consumes histories, scores and batched lookups;
//! the LM family behind the trait is interchangeable. [`TableLm`] is the
//! explicit score-table implementation used by the CLI and the tests.

use std::collections::HashMap;

use serde::Deserialize;

use crate::history::LmHistory;
use crate::lexicon::{Lemma, TokenInventory};
use crate::types::{INVALID_SCORE, Score, TokenId};

/// Reserved sentence-end token symbol.
pub const SENTENCE_END_TOKEN: &str = "</s>";

/// One vectorised lookahead lookup: a token sequence scored into `target`
/// with an additive `offset`.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub tokens: Vec<TokenId>,
    pub target: u32,
    pub offset: Score,
}

/// Batch compiled once per network and reused for every history.
#[derive(Debug, Clone, Default)]
pub struct CompiledBatchRequest {
    pub requests: Vec<BatchRequest>,
}

/// Contract between the search engine and the language model.
///
/// `score` returns scaled scores. `extended_history` may truncate to the
/// model order; equal histories must then produce equal scores.
pub trait LanguageModel {
    fn scale(&self) -> Score {
        1.0
    }

    fn start_history(&self) -> LmHistory {
        LmHistory::root()
    }

    fn extended_history(&self, history: &LmHistory, token: TokenId) -> LmHistory {
        history.extended(token)
    }

    fn reduced_history(&self, history: &LmHistory, order: i32) -> LmHistory {
        history.reduced(order)
    }

    /// Scaled score of `token` given `history`.
    fn score(&self, history: &LmHistory, token: TokenId) -> Score;

    /// Scaled sentence-end score given `history`.
    fn sentence_end_score(&self, history: &LmHistory) -> Score;

    fn compile_batch_request(&self, requests: Vec<BatchRequest>) -> CompiledBatchRequest {
        CompiledBatchRequest { requests }
    }

    /// Fill `out[target] = min(out[target], score(tokens) + offset)` for
    /// every request under `history`.
    fn get_batch(&self, history: &LmHistory, batch: &CompiledBatchRequest, out: &mut [Score]) {
        for request in &batch.requests {
            let mut h = history.clone();
            let mut total = request.offset;
            for &token in &request.tokens {
                total += self.score(&h, token);
                h = self.extended_history(&h, token);
            }
            let slot = &mut out[request.target as usize];
            if total < *slot {
                *slot = total;
            }
        }
    }
}

/// Score of a lemma's syntactic token sequence given `history`, without
/// extending the caller's history. Empty sequences score zero.
pub fn add_lemma_score(lm: &dyn LanguageModel, history: &LmHistory, lemma: &Lemma) -> Score {
    let mut h = history.clone();
    let mut total = 0.0;
    for &token in &lemma.synt {
        total += lm.score(&h, token);
        h = lm.extended_history(&h, token);
    }
    total
}

/// One `(context, token) -> score` row of a [`TableLm`].
#[derive(Debug, Clone, Deserialize)]
pub struct TableLmEntry {
    /// Conditioning tokens, oldest first; at most `order - 1` are used.
    #[serde(default)]
    pub context: Vec<String>,
    pub token: String,
    pub score: Score,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableLmSpec {
    pub order: u32,
    #[serde(default = "default_scale")]
    pub scale: Score,
    /// Score for `(context, token)` pairs missing from the table.
    #[serde(default = "default_missing")]
    pub default_score: Score,
    pub entries: Vec<TableLmEntry>,
}

fn default_scale() -> Score {
    1.0
}

fn default_missing() -> Score {
    INVALID_SCORE
}

/// Explicit score-table LM with longest-context matching.
///
/// Lookups walk from the full `order - 1` context down to the empty
/// context; the first hit wins, otherwise `default_score` applies.
/// Unscaled scores are stored; `scale` is applied on every query.
#[derive(Debug, Clone)]
pub struct TableLm {
    order: u32,
    scale: Score,
    default_score: Score,
    table: HashMap<(Vec<TokenId>, TokenId), Score>,
    sentence_end: TokenId,
}

impl TableLm {
    pub fn from_spec(spec: TableLmSpec, tokens: &mut TokenInventory) -> Self {
        let mut table = HashMap::with_capacity(spec.entries.len());
        for entry in &spec.entries {
            let context: Vec<TokenId> = entry.context.iter().map(|t| tokens.intern(t)).collect();
            let token = tokens.intern(&entry.token);
            table.insert((context, token), entry.score);
        }
        Self {
            order: spec.order.max(1),
            scale: spec.scale,
            default_score: spec.default_score,
            table,
            sentence_end: tokens.intern(SENTENCE_END_TOKEN),
        }
    }

    pub fn from_json_str(json: &str, tokens: &mut TokenInventory) -> serde_json::Result<Self> {
        Ok(Self::from_spec(serde_json::from_str(json)?, tokens))
    }

    fn raw_score(&self, history: &LmHistory, token: TokenId) -> Score {
        let context = history.suffix(self.order as usize - 1);
        for start in 0..=context.len() {
            if let Some(&score) = self.table.get(&(context[start..].to_vec(), token)) {
                return score;
            }
        }
        self.default_score
    }
}

impl LanguageModel for TableLm {
    fn scale(&self) -> Score {
        self.scale
    }

    fn extended_history(&self, history: &LmHistory, token: TokenId) -> LmHistory {
        // keep instance keys bounded by the model order
        history.extended(token).reduced(self.order as i32 - 1)
    }

    fn score(&self, history: &LmHistory, token: TokenId) -> Score {
        let raw = self.raw_score(history, token);
        if raw >= INVALID_SCORE {
            return INVALID_SCORE;
        }
        self.scale * raw
    }

    fn sentence_end_score(&self, history: &LmHistory) -> Score {
        self.score(history, self.sentence_end)
    }
}

#[cfg(test)]
mod lm_tests {
    use super::*;

    fn bigram() -> (TableLm, TokenInventory) {
        let mut tokens = TokenInventory::default();
        let spec = TableLmSpec {
            order: 2,
            scale: 1.0,
            default_score: INVALID_SCORE,
            entries: vec![
                TableLmEntry {
                    context: vec![],
                    token: "cat".into(),
                    score: 1.0,
                },
                TableLmEntry {
                    context: vec!["cat".into()],
                    token: "cat".into(),
                    score: 0.25,
                },
                TableLmEntry {
                    context: vec![],
                    token: SENTENCE_END_TOKEN.into(),
                    score: 2.0,
                },
            ],
        };
        let lm = TableLm::from_spec(spec, &mut tokens);
        (lm, tokens)
    }

    #[test]
    fn longest_context_wins() {
        let (lm, tokens) = bigram();
        let cat = tokens.id("cat").unwrap();
        let h0 = lm.start_history();
        assert_eq!(lm.score(&h0, cat), 1.0);
        let h1 = lm.extended_history(&h0, cat);
        assert_eq!(lm.score(&h1, cat), 0.25);
        assert_eq!(lm.sentence_end_score(&h1), 2.0);
    }

    #[test]
    fn histories_are_truncated_to_model_order() {
        let (lm, tokens) = bigram();
        let cat = tokens.id("cat").unwrap();
        let mut h = lm.start_history();
        for _ in 0..5 {
            h = lm.extended_history(&h, cat);
        }
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn missing_entries_fall_back_to_default() {
        let (lm, mut tokens) = bigram();
        let dog = tokens.intern("dog");
        assert_eq!(lm.score(&lm.start_history(), dog), INVALID_SCORE);
    }

    #[test]
    fn batch_fills_minima_with_offsets() {
        let (lm, tokens) = bigram();
        let cat = tokens.id("cat").unwrap();
        let batch = lm.compile_batch_request(vec![
            BatchRequest {
                tokens: vec![cat],
                target: 0,
                offset: 0.5,
            },
            BatchRequest {
                tokens: vec![cat, cat],
                target: 1,
                offset: 0.0,
            },
        ]);
        let mut out = [INVALID_SCORE; 2];
        lm.get_batch(&lm.start_history(), &batch, &mut out);
        assert_eq!(out[0], 1.5);
        assert_eq!(out[1], 1.25);
    }

    #[test]
    fn lemma_scores_leave_history_untouched() {
        let (lm, tokens) = bigram();
        let cat_token = tokens.id("cat").unwrap();
        let lemma = Lemma {
            id: 0,
            orth: "cat".into(),
            synt: vec![cat_token, cat_token],
        };
        let h = lm.start_history();
        assert_eq!(add_lemma_score(&lm, &h, &lemma), 1.25);
        assert_eq!(h.len(), 0);

        let silent = Lemma {
            id: 1,
            orth: "[sil]".into(),
            synt: vec![],
        };
        assert_eq!(add_lemma_score(&lm, &h, &silent), 0.0);
    }
}
