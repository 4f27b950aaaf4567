//! End-to-end decoding scenarios and search-space invariants.

use std::sync::Arc;

use treebeam_core::{
    INVALID_SCORE, LanguageModel, Lexicon, MatrixScorer, MatrixScorerSpec, Score, ScorerTopology,
    SearchOptions, TableLm,
};

use crate::decoder::Decoder;
use crate::trace;

const PHONES: [&str; 6] = ["k", "ae", "t", "aa", "r", "si"];

fn cat_car_lexicon() -> Lexicon {
    Lexicon::from_json_str(
        r#"{
            "lemmas": [
                { "orth": "CAT", "prons": [{ "phon": "k ae t" }] },
                { "orth": "CAR", "prons": [{ "phon": "k aa r" }] },
                { "orth": "[SILENCE]", "special": "silence",
                  "prons": [{ "phon": "si" }] }
            ]
        }"#,
    )
    .unwrap()
}

fn spec(labels: &[&str], scores: Vec<Vec<Score>>, topology: ScorerTopology) -> MatrixScorerSpec {
    MatrixScorerSpec {
        labels: labels.iter().map(|s| s.to_string()).collect(),
        scores,
        topology,
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

/// One row per frame; the favoured label scores `0`, the rest `bad`.
fn frames(labels: &[&str], favoured: &[&str], bad: Score) -> Vec<Vec<Score>> {
    favoured
        .iter()
        .map(|f| {
            labels
                .iter()
                .map(|l| if l == f { 0.0 } else { bad })
                .collect()
        })
        .collect()
}

fn options() -> SearchOptions {
    SearchOptions {
        lm_lookahead: false,
        ..SearchOptions::default()
    }
}

fn decoder(
    lexicon: Lexicon,
    scorer: MatrixScorer,
    lm: Option<Arc<dyn LanguageModel>>,
    options: &SearchOptions,
) -> Decoder {
    Decoder::new(Arc::new(lexicon), Box::new(scorer), lm, options, None).unwrap()
}

// ---- time-sync scenarios ----

#[test]
fn uniform_scores_decode_the_fed_phoneme_sequence() {
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["k", "ae", "t"], 10.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options());

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "CAT");
    assert_eq!(
        result.best.iter().filter(|item| item.orth.is_some()).count(),
        1
    );
    assert_eq!(result.n_labels, 3);
    assert_eq!(result.score.acoustic, 0.0);
    assert_eq!(result.score.lm, 0.0);
}

#[test]
fn best_path_traceback_reaches_the_root_within_step_count() {
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["k", "aa", "r"], 10.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options());

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "CAR");
    assert!(result.best.len() as u32 <= result.steps + 1);
}

#[test]
fn language_model_rescoring_flips_the_decision() {
    // acoustics tie CAT and CAR; the LM prefers CAR
    let rows = vec![vec![0.0, 0.0, 0.0, 0.0, 0.0, 10.0]; 3];
    let scorer =
        MatrixScorer::from_spec(spec(&PHONES, rows, ScorerTopology::TimeSync)).unwrap();
    let mut lexicon = cat_car_lexicon();
    let lm = TableLm::from_json_str(
        r#"{
            "order": 1,
            "entries": [
                { "token": "CAT", "score": 4.0 },
                { "token": "CAR", "score": 1.0 },
                { "token": "</s>", "score": 0.5 }
            ]
        }"#,
        lexicon.tokens_mut(),
    )
    .unwrap();

    let mut decoder = decoder(lexicon, scorer, Some(Arc::new(lm)), &options());
    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "CAR");
    assert_eq!(result.score.lm, 1.5); // CAR plus sentence end
}

#[test]
fn histogram_pruning_with_limit_one_keeps_only_the_best_label() {
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["k", "ae", "t"], 10.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();
    let mut options = options();
    options.label_pruning = INVALID_SCORE;
    options.label_pruning_limit = 1;
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options);

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "CAT");
    // the beam never grew past the limit
    assert!(decoder.space().n_label_hypotheses() <= 1);
}

#[test]
fn full_sum_merges_pronunciation_variants() {
    // two pronunciations of the same word with identical path scores
    let lexicon = Lexicon::from_json_str(
        r#"{ "lemmas": [
            { "orth": "CAT", "prons": [{ "phon": "k ae t" }, { "phon": "k aa t" }] }
        ]}"#,
    )
    .unwrap();
    let rows = vec![vec![1.0; 6]; 3];
    let scorer =
        MatrixScorer::from_spec(spec(&PHONES, rows, ScorerTopology::TimeSync)).unwrap();

    let mut viterbi_options = options();
    viterbi_options.label_recombination_limit = 0;
    let mut viterbi = decoder(lexicon.clone(), scorer.clone(), None, &viterbi_options);
    let viterbi_result = viterbi.decode_segment(false).unwrap();
    assert_eq!(viterbi_result.text(), "CAT");
    assert!((viterbi_result.score.acoustic - 3.0).abs() < 1e-5);

    let mut fullsum_options = viterbi_options.clone();
    fullsum_options.full_sum_decoding = true;
    let mut fullsum = decoder(lexicon, scorer, None, &fullsum_options);
    let fullsum_result = fullsum.decode_segment(false).unwrap();
    assert_eq!(fullsum_result.text(), "CAT");
    // both equal-score paths combine: 3 - ln 2
    let expected = 3.0 - std::f32::consts::LN_2;
    assert!((fullsum_result.score.acoustic - expected).abs() < 1e-5);
}

#[test]
fn full_sum_equals_viterbi_on_a_single_path() {
    let lexicon = Lexicon::from_json_str(
        r#"{ "lemmas": [ { "orth": "CAT", "prons": [{ "phon": "k ae t" }] } ]}"#,
    )
    .unwrap();
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["k", "ae", "t"], 10.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();

    let mut fullsum_options = options();
    fullsum_options.full_sum_decoding = true;
    let mut fullsum = decoder(lexicon.clone(), scorer.clone(), None, &fullsum_options);
    let mut viterbi = decoder(lexicon, scorer, None, &options());

    let a = fullsum.decode_segment(false).unwrap();
    let b = viterbi.decode_segment(false).unwrap();
    assert_eq!(a.text(), b.text());
    assert!((a.score.acoustic - b.score.acoustic).abs() < 1e-6);
}

// ---- blank / CTC ----

fn ctc_labels() -> Vec<&'static str> {
    let mut labels = PHONES.to_vec();
    labels.push("_");
    labels
}

fn ctc_scorer(favoured: &[&str]) -> MatrixScorer {
    let labels = ctc_labels();
    let mut s = spec(
        &labels,
        frames(&labels, favoured, 10.0),
        ScorerTopology::TimeSync,
    );
    s.blank_label = Some("_".into());
    MatrixScorer::from_spec(s).unwrap()
}

#[test]
fn ctc_blanks_between_labels_decode_like_the_plain_sequence() {
    let mut options = options();
    options.allow_blank_label = true;
    let mut decoder = decoder(
        cat_car_lexicon(),
        ctc_scorer(&["k", "_", "ae", "_", "t"]),
        None,
        &options,
    );

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "CAT");
    assert_eq!(result.n_labels, 3);
}

#[test]
fn label_recombination_is_idempotent_after_a_decode() {
    let mut options = options();
    options.allow_blank_label = true;
    options.allow_label_recombination = true;
    let mut decoder = decoder(
        cat_car_lexicon(),
        ctc_scorer(&["k", "_", "ae", "_", "t"]),
        None,
        &options,
    );
    decoder.decode_segment(false).unwrap();

    // recombination uniqueness: a second pass must not merge anything
    let space = decoder.space_mut();
    let before = space.label_hyps.len();
    space.recombine_labels();
    assert_eq!(space.label_hyps.len(), before);
}

// ---- label-sync (attention) ----

fn attention_setup(favoured: &[&str]) -> (Lexicon, MatrixScorer) {
    let labels = ["a", "b", "E"];
    let lexicon = Lexicon::from_json_str(
        r#"{ "lemmas": [
            { "orth": "A", "prons": [{ "phon": "a" }] },
            { "orth": "B", "prons": [{ "phon": "b" }] },
            { "orth": "[SENTENCE-END]", "special": "sentence-boundary",
              "synt": ["</s>"] }
        ]}"#,
    )
    .unwrap();
    let mut s = spec(
        &labels,
        frames(&labels, favoured, 10.0),
        ScorerTopology::LabelSync,
    );
    s.end_label = Some("E".into());
    s.input_length = Some(50);
    (lexicon, MatrixScorer::from_spec(s).unwrap())
}

#[test]
fn label_sync_search_ends_on_the_end_label() {
    let (lexicon, scorer) = attention_setup(&["a", "b", "E"]);
    let mut decoder = decoder(lexicon, scorer, None, &options());

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "A B");
    assert_eq!(result.n_labels, 3); // a, b and the end label
    assert!(decoder.space().n_end_traces() >= 1);
}

#[test]
fn end_label_at_step_zero_produces_an_empty_hypothesis() {
    let (lexicon, scorer) = attention_setup(&["E"]);
    let mut decoder = decoder(lexicon, scorer, None, &options());

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "");
    assert!(result.n_words >= 1);
}

#[test]
fn deterministic_early_stop_clears_the_beam() {
    // the end label wins immediately; later rows only make things worse
    let (lexicon, scorer) = attention_setup(&["E", "a", "a", "a"]);
    let mut options = options();
    options.label_pruning = 5.0;
    options.word_end_pruning = 5.0;
    let mut decoder = decoder(lexicon, scorer, None, &options);

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "");
    assert!(result.steps < 4);
}

#[test]
fn word_length_balance_runs_the_joint_pruning_path() {
    let (lexicon, scorer) = attention_setup(&["a", "b", "E"]);
    let mut options = options();
    options.word_length_balance = true;
    options.word_length_scale = 1.0;
    let mut decoder = decoder(lexicon, scorer, None, &options);

    // with a single dominant word length the balance weights renormalise
    // to zero and the decision is unchanged
    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "A B");
}

// ---- alignment-sync (vertical transitions) ----

#[test]
fn all_blank_alignment_sync_ends_at_the_input_boundary() {
    let labels = ["a", "_"];
    let lexicon = Lexicon::from_json_str(
        r#"{ "lemmas": [ { "orth": "A", "prons": [{ "phon": "a" }] } ]}"#,
    )
    .unwrap();
    let mut s = spec(
        &labels,
        frames(&labels, &["_", "_", "_", "_"], 10.0),
        ScorerTopology::AlignmentSync,
    );
    s.blank_label = Some("_".into());
    s.input_length = Some(3);
    let scorer = MatrixScorer::from_spec(s).unwrap();

    let mut options = options();
    options.allow_blank_label = true;
    options.restrict_with_input_length = false;
    let mut decoder = decoder(lexicon, scorer, None, &options);

    let result = decoder.decode_segment(false).unwrap();
    // an end trace exists even though no non-blank label was emitted
    assert_eq!(result.text(), "");
    assert_eq!(result.n_labels, 0);
    assert!(result.n_words >= 1);
}

// ---- invariants ----

#[test]
fn instance_ranges_partition_the_label_array() {
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["k", "ae", "t"], 2.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options());
    decoder.decode_segment(false).unwrap();

    let space = decoder.space();
    let mut cursor = 0;
    for instance in &space.instances {
        assert_eq!(instance.labels.begin, cursor);
        assert!(instance.labels.end >= instance.labels.begin);
        cursor = instance.labels.end;
    }
    assert_eq!(cursor, space.label_hyps.len());
}

#[test]
fn rescale_shifts_scores_into_the_global_offset() {
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["k", "ae", "t"], 2.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options());
    decoder.decode_segment(false).unwrap();

    let space = decoder.space_mut();
    space.word_ends.clear();
    let before: Vec<Score> = space.label_hyps.iter().map(|h| h.score.acoustic).collect();
    let offset_before = space.global_score_offset();
    space.best_label_score = INVALID_SCORE;
    let delta = space.best_label_score();
    assert_ne!(delta, INVALID_SCORE);

    space.rescale(0.0);
    for (hyp, old) in space.label_hyps.iter().zip(&before) {
        assert!((hyp.score.acoustic - (old - delta)).abs() < 1e-4);
    }
    assert!((space.global_score_offset() - offset_before - f64::from(delta)).abs() < 1e-4);
}

#[test]
fn lattice_roots_keep_recombined_alternatives_reachable() {
    // CAT and CAR tie acoustically; the lattice must contain both
    let rows = vec![vec![0.0, 0.0, 0.0, 0.0, 0.0, 10.0]; 3];
    let scorer =
        MatrixScorer::from_spec(spec(&PHONES, rows, ScorerTopology::TimeSync)).unwrap();
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options());

    let result = decoder.decode_segment(true).unwrap();
    let lattice = result.lattice.unwrap();
    let words: std::collections::HashSet<&str> = lattice
        .arcs
        .iter()
        .filter_map(|arc| arc.orth.as_deref())
        .collect();
    assert!(words.contains("CAT"));
    assert!(words.contains("CAR"));
}

#[test]
fn truncated_recording_falls_back_to_the_best_live_hypothesis() {
    // the input ends in the middle of every word: no exit is ever reached
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["k", "ae"], 4.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();
    let mut options = options();
    options.label_pruning = 2.0;
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options);

    let result = decoder.decode_segment(false).unwrap();
    // no complete word survives; the fallback still yields a trace
    assert_eq!(result.text(), "");
    assert!(result.best.len() <= 1);
    assert_eq!(result.n_labels, 2);
}

#[test]
fn cached_images_reproduce_the_decode() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options();
    options.cache_dir = Some(dir.path().to_path_buf());

    let build_scorer = || {
        MatrixScorer::from_spec(spec(
            &PHONES,
            frames(&PHONES, &["k", "ae", "t"], 10.0),
            ScorerTopology::TimeSync,
        ))
        .unwrap()
    };

    // first run builds and writes the image, the second reads it back
    let mut first = decoder(cat_car_lexicon(), build_scorer(), None, &options);
    let first_result = first.decode_segment(false).unwrap();
    assert!(dir.path().join("label-tree.img").exists());

    let mut second = decoder(cat_car_lexicon(), build_scorer(), None, &options);
    let second_result = second.decode_segment(false).unwrap();
    assert_eq!(first_result.text(), second_result.text());
    assert_eq!(first_result.score.acoustic, second_result.score.acoustic);

    // a corrupted image is discarded, rebuilt and overwritten
    let path = dir.path().join("label-tree.img");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let mut third = decoder(cat_car_lexicon(), build_scorer(), None, &options);
    let third_result = third.decode_segment(false).unwrap();
    assert_eq!(first_result.text(), third_result.text());
    assert_ne!(std::fs::read(&path).unwrap(), bytes);
}

#[test]
fn trace_depth_is_bounded_by_the_step_count() {
    let scorer = MatrixScorer::from_spec(spec(
        &PHONES,
        frames(&PHONES, &["si", "k", "ae", "t", "si"], 10.0),
        ScorerTopology::TimeSync,
    ))
    .unwrap();
    let mut decoder = decoder(cat_car_lexicon(), scorer, None, &options());

    let result = decoder.decode_segment(false).unwrap();
    assert_eq!(result.text(), "CAT");

    let trace = decoder
        .space_mut()
        .get_sentence_end(false)
        .expect("sentence end exists");
    assert!(trace::depth(&trace) <= result.steps + 1);
}
