//! Lexicon data model.
//!
//! Two layers:
//! - **Deserialization layer**: 1:1 mapping to the lexicon JSON format
//! - **Analysis layer**: id-indexed lemmas, pronunciations and an interned
//!   syntactic-token inventory for LM scoring
//!
//! The search core treats lemmas and pronunciations as opaque identifiers;
//! only the tree builders and the shell look inside.

use std::collections::HashMap;
use std::io;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::types::{LemmaId, PronId, Score, TokenId};

/// Raw lemma entry from the lexicon JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLemma {
    pub orth: String,
    /// Syntactic token sequence; omitted means `[orth]` for regular lemmas
    /// and empty for special ones.
    #[serde(default)]
    pub synt: Option<Vec<String>>,
    #[serde(default)]
    pub prons: Vec<RawPronunciation>,
    /// Special role: `silence`, `unknown`, `sentence-boundary`, `sentence-end`.
    #[serde(default)]
    pub special: Option<String>,
}

/// Raw pronunciation variant.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPronunciation {
    /// Whitespace-separated phoneme symbols.
    pub phon: String,
    /// Negative log pronunciation probability.
    #[serde(default)]
    pub score: Score,
}

#[derive(Debug, Clone, Deserialize)]
struct RawLexicon {
    lemmas: Vec<RawLemma>,
}

#[derive(Debug, thiserror::Error)]
pub enum LexiconError {
    #[error("failed to read lexicon: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse lexicon: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate special lemma `{0}`")]
    DuplicateSpecial(String),

    #[error("lemma `{orth}` has an empty pronunciation")]
    EmptyPronunciation { orth: String },
}

/// Interned syntactic-token strings shared by the lexicon and the LM.
#[derive(Debug, Clone, Default)]
pub struct TokenInventory {
    tokens: IndexMap<String, TokenId>,
}

impl TokenInventory {
    pub fn intern(&mut self, token: &str) -> TokenId {
        if let Some(&id) = self.tokens.get(token) {
            return id;
        }
        let id = self.tokens.len() as TokenId;
        self.tokens.insert(token.to_owned(), id);
        id
    }

    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.tokens.get(token).copied()
    }

    pub fn text(&self, id: TokenId) -> Option<&str> {
        self.tokens
            .get_index(id as usize)
            .map(|(text, _)| text.as_str())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Transcription output unit; carries the LM token sequence it emits.
#[derive(Debug, Clone)]
pub struct Lemma {
    pub id: LemmaId,
    pub orth: String,
    /// Syntactic token sequence; empty sequences do not count as words.
    pub synt: Vec<TokenId>,
}

impl Lemma {
    /// Whether the lemma contributes tokens to the LM (and to word counts).
    pub fn has_synt(&self) -> bool {
        !self.synt.is_empty()
    }
}

/// One pronunciation variant of one lemma.
#[derive(Debug, Clone)]
pub struct Pronunciation {
    pub id: PronId,
    pub lemma: LemmaId,
    pub phonemes: Vec<String>,
    pub score: Score,
}

/// A lemma together with one of its pronunciation variants.
#[derive(Debug, Clone, Copy)]
pub struct LemmaPronunciation<'a> {
    pub lemma: &'a Lemma,
    pub pronunciation: &'a Pronunciation,
}

/// Id-indexed lexicon with special-lemma lookup.
#[derive(Debug, Clone, Default)]
pub struct Lexicon {
    lemmas: Vec<Lemma>,
    pronunciations: Vec<Pronunciation>,
    specials: HashMap<String, LemmaId>,
    tokens: TokenInventory,
}

impl Lexicon {
    pub fn from_json_str(json: &str) -> Result<Self, LexiconError> {
        let raw: RawLexicon = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    pub fn from_json_reader<R: io::Read>(reader: R) -> Result<Self, LexiconError> {
        let raw: RawLexicon = serde_json::from_reader(reader)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawLexicon) -> Result<Self, LexiconError> {
        let mut lexicon = Lexicon::default();
        for raw_lemma in raw.lemmas {
            lexicon.add_raw_lemma(raw_lemma)?;
        }
        Ok(lexicon)
    }

    fn add_raw_lemma(&mut self, raw: RawLemma) -> Result<LemmaId, LexiconError> {
        let id = self.lemmas.len() as LemmaId;
        let synt = match &raw.synt {
            Some(tokens) => tokens.iter().map(|t| self.tokens.intern(t)).collect(),
            // special lemmas default to no LM tokens
            None if raw.special.is_some() => Vec::new(),
            None => vec![self.tokens.intern(&raw.orth)],
        };
        if let Some(special) = &raw.special
            && self.specials.insert(special.clone(), id).is_some()
        {
            return Err(LexiconError::DuplicateSpecial(special.clone()));
        }
        for pron in &raw.prons {
            let phonemes: Vec<String> =
                pron.phon.split_whitespace().map(str::to_owned).collect();
            if phonemes.is_empty() {
                return Err(LexiconError::EmptyPronunciation {
                    orth: raw.orth.clone(),
                });
            }
            self.pronunciations.push(Pronunciation {
                id: self.pronunciations.len() as PronId,
                lemma: id,
                phonemes,
                score: pron.score,
            });
        }
        self.lemmas.push(Lemma {
            id,
            orth: raw.orth,
            synt,
        });
        Ok(id)
    }

    pub fn lemmas(&self) -> &[Lemma] {
        &self.lemmas
    }

    pub fn pronunciations(&self) -> &[Pronunciation] {
        &self.pronunciations
    }

    pub fn lemma(&self, id: LemmaId) -> &Lemma {
        &self.lemmas[id as usize]
    }

    pub fn pronunciation(&self, id: PronId) -> &Pronunciation {
        &self.pronunciations[id as usize]
    }

    pub fn lemma_pronunciation(&self, id: PronId) -> LemmaPronunciation<'_> {
        let pronunciation = self.pronunciation(id);
        LemmaPronunciation {
            lemma: self.lemma(pronunciation.lemma),
            pronunciation,
        }
    }

    pub fn special_lemma(&self, name: &str) -> Option<&Lemma> {
        self.specials.get(name).map(|&id| self.lemma(id))
    }

    /// The sentence-boundary lemma, falling back to `sentence-end`.
    pub fn end_lemma(&self) -> Option<&Lemma> {
        self.special_lemma("sentence-boundary")
            .or_else(|| self.special_lemma("sentence-end"))
    }

    pub fn tokens(&self) -> &TokenInventory {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut TokenInventory {
        &mut self.tokens
    }
}

#[cfg(test)]
mod lexicon_tests {
    use super::*;

    const CAT_CAR: &str = r#"{
        "lemmas": [
            { "orth": "CAT", "prons": [{ "phon": "k ae t" }] },
            { "orth": "CAR", "prons": [{ "phon": "k aa r", "score": 0.5 }] },
            { "orth": "[SILENCE]", "special": "silence",
              "prons": [{ "phon": "si" }] },
            { "orth": "[SENTENCE-END]", "special": "sentence-boundary" }
        ]
    }"#;

    #[test]
    fn parses_lemmas_and_pronunciations() {
        let lexicon = Lexicon::from_json_str(CAT_CAR).unwrap();
        assert_eq!(lexicon.lemmas().len(), 4);
        assert_eq!(lexicon.pronunciations().len(), 3);

        let cat = &lexicon.lemmas()[0];
        assert_eq!(cat.orth, "CAT");
        assert_eq!(cat.synt.len(), 1);
        assert!(cat.has_synt());

        let car_pron = lexicon.pronunciation(1);
        assert_eq!(car_pron.phonemes, vec!["k", "aa", "r"]);
        assert_eq!(car_pron.score, 0.5);
        assert_eq!(lexicon.lemma(car_pron.lemma).orth, "CAR");
    }

    #[test]
    fn special_lemmas_have_no_tokens_by_default() {
        let lexicon = Lexicon::from_json_str(CAT_CAR).unwrap();
        let silence = lexicon.special_lemma("silence").unwrap();
        assert!(!silence.has_synt());
        assert!(lexicon.end_lemma().is_some());
        assert!(lexicon.special_lemma("unknown").is_none());
    }

    #[test]
    fn duplicate_special_is_rejected() {
        let json = r#"{ "lemmas": [
            { "orth": "a", "special": "silence" },
            { "orth": "b", "special": "silence" }
        ]}"#;
        assert!(matches!(
            Lexicon::from_json_str(json),
            Err(LexiconError::DuplicateSpecial(_))
        ));
    }

    #[test]
    fn empty_pronunciation_is_rejected() {
        let json = r#"{ "lemmas": [ { "orth": "a", "prons": [{ "phon": "  " }] } ]}"#;
        assert!(matches!(
            Lexicon::from_json_str(json),
            Err(LexiconError::EmptyPronunciation { .. })
        ));
    }

    #[test]
    fn token_inventory_interns_shared_tokens() {
        let json = r#"{ "lemmas": [
            { "orth": "NEW YORK", "synt": ["NEW", "YORK"] },
            { "orth": "NEW", "synt": ["NEW"] }
        ]}"#;
        let lexicon = Lexicon::from_json_str(json).unwrap();
        assert_eq!(lexicon.tokens().len(), 2);
        assert_eq!(lexicon.lemmas()[0].synt[0], lexicon.lemmas()[1].synt[0]);
    }
}
