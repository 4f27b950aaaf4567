//! Core data model for the treebeam decoder.
//!
//! Two layers:
//! - **Data layer**: scores, ids, persistent histories, the lexicon model
//! - **Seam layer**: the [`LabelScorer`] and [`LanguageModel`] traits the
//!   search engine drives, plus table-backed implementations for tooling
//!   and tests

pub mod config;
pub mod hash;
pub mod history;
pub mod lexicon;
pub mod lm;
pub mod math;
pub mod scorer;
pub mod types;

pub use config::{LabelUnit, PenaltyClass, SearchOptions, TransitionPenaltyOptions};
pub use hash::update_hash_key;
pub use history::{LabelHistory, LmHistory};
pub use lexicon::{
    Lemma, LemmaPronunciation, Lexicon, LexiconError, Pronunciation, TokenInventory,
};
pub use lm::{
    BatchRequest, CompiledBatchRequest, LanguageModel, SENTENCE_END_TOKEN, TableLm, TableLmEntry,
    TableLmSpec, add_lemma_score,
};
pub use math::{neg_log_one_minus_exp_neg, score_sum, score_sum_all};
pub use scorer::{
    LabelScorer, MatrixScorer, MatrixScorerSpec, ScorerError, ScorerTopology, SegmentScores,
    SegmentSpec,
};
pub use types::{
    ExitId, INVALID_ID, INVALID_SCORE, LabelIndex, LemmaId, LookaheadId, NodeId, Position, PronId,
    Score, ScoreVector, StepIndex, TokenId,
};
