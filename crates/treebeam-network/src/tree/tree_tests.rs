//! Tests for tree construction, runtime adjustments and image round-trips.

use treebeam_core::{
    INVALID_ID, LabelUnit, Lexicon, MatrixScorer, MatrixScorerSpec, ScorerTopology, SearchOptions,
};

use super::{LabelTree, StateGraph, TreeBuilder, tree_config_checksum};
use crate::image::CacheArchive;

pub(crate) fn cat_car_lexicon() -> Lexicon {
    Lexicon::from_json_str(
        r#"{
            "lemmas": [
                { "orth": "CAT", "prons": [{ "phon": "k ae t" }] },
                { "orth": "CAR", "prons": [{ "phon": "k aa r", "score": 0.5 }] },
                { "orth": "[SILENCE]", "special": "silence",
                  "prons": [{ "phon": "si" }] }
            ]
        }"#,
    )
    .unwrap()
}

pub(crate) fn phoneme_scorer() -> MatrixScorer {
    MatrixScorer::from_spec(MatrixScorerSpec {
        labels: vec![
            "k".into(),
            "ae".into(),
            "t".into(),
            "aa".into(),
            "r".into(),
            "si".into(),
        ],
        scores: vec![vec![0.0; 6]],
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
    })
    .unwrap()
}

fn phoneme_tree() -> LabelTree {
    let lexicon = cat_car_lexicon();
    let scorer = phoneme_scorer();
    let options = SearchOptions::default();
    TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap()
}

#[test]
fn phoneme_tree_shares_prefixes() {
    let tree = phoneme_tree();
    // root + k + (ae t) + (aa r) + si
    assert_eq!(tree.num_nodes(), 7);
    assert_eq!(tree.all_exits().len(), 3);

    let root_succs = tree.successors(tree.root());
    assert_eq!(root_succs.len(), 2); // k and si

    let k = root_succs[0];
    assert_eq!(tree.label(k), 0);
    assert_eq!(tree.successors(k).len(), 2); // ae and aa branch off the shared k
    assert!(!tree.has_exit(k));

    // every exit re-enters the root
    for exit in tree.all_exits() {
        assert_eq!(exit.transit_root, tree.root());
        assert!(exit.pronunciation.is_some());
    }
    assert!(tree.has_pronunciation());
}

#[test]
fn silence_node_is_recorded() {
    let tree = phoneme_tree();
    let silence = tree.silence();
    assert_ne!(silence, INVALID_ID);
    assert!(tree.has_exit(silence));
    assert!(tree.is_silence(silence));
}

#[test]
fn skip_silence_drops_the_silence_lemma() {
    let lexicon = cat_car_lexicon();
    let scorer = phoneme_scorer();
    let options = SearchOptions {
        skip_silence: true,
        ..SearchOptions::default()
    };
    let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();
    assert_eq!(tree.all_exits().len(), 2);
    assert_eq!(tree.silence(), INVALID_ID);
}

#[test]
fn unknown_phoneme_skips_the_pronunciation() {
    let lexicon = Lexicon::from_json_str(
        r#"{ "lemmas": [
            { "orth": "CAT", "prons": [{ "phon": "k ae t" }] },
            { "orth": "XYZ", "prons": [{ "phon": "x y" }] }
        ]}"#,
    )
    .unwrap();
    let scorer = phoneme_scorer();
    let options = SearchOptions::default();
    let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();
    assert_eq!(tree.all_exits().len(), 1);

    // without skipping and without an unknown label the build is fatal
    let strict = SearchOptions {
        skip_unknown_label: false,
        ..SearchOptions::default()
    };
    assert!(TreeBuilder::new(&lexicon, &scorer, &strict).build().is_err());
}

#[test]
fn word_tree_has_one_chain_per_lemma() {
    let lexicon = Lexicon::from_json_str(
        r#"{ "lemmas": [ { "orth": "k" }, { "orth": "ae" } ]}"#,
    )
    .unwrap();
    let scorer = phoneme_scorer();
    let options = SearchOptions {
        label_unit: LabelUnit::Word,
        ..SearchOptions::default()
    };
    let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();
    assert_eq!(tree.num_nodes(), 3);
    assert_eq!(tree.all_exits().len(), 2);
    assert!(!tree.has_pronunciation());
    for exit in tree.all_exits() {
        assert!(exit.pronunciation.is_none());
        assert!(exit.lemma.is_some());
    }
}

#[test]
fn subword_tree_splits_whitespace() {
    let lexicon = Lexicon::from_json_str(
        r#"{ "lemmas": [ { "orth": "k ae" }, { "orth": "k aa t" } ]}"#,
    )
    .unwrap();
    let scorer = phoneme_scorer();
    let options = SearchOptions {
        label_unit: LabelUnit::Subword,
        ..SearchOptions::default()
    };
    let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();
    // root + shared k + ae + aa + t
    assert_eq!(tree.num_nodes(), 5);
    let k = tree.successors(tree.root())[0];
    assert_eq!(tree.successors(k).len(), 2);
}

#[test]
fn activate_loop_adds_self_successors() {
    let mut tree = phoneme_tree();
    tree.activate_loop();
    for node in 1..tree.num_nodes() {
        assert!(tree.successors(node).contains(&node));
    }
    assert!(!tree.successors(tree.root()).contains(&tree.root()));
}

#[test]
fn activate_end_label_splices_under_the_root() {
    let mut tree = phoneme_tree();
    let nodes_before = tree.num_nodes();
    tree.activate_end_label(5, None, true);
    assert_eq!(tree.num_nodes(), nodes_before); // "si" already under the root
    let end = tree.end_node_id();
    assert!(tree.successors(tree.root()).contains(&end));
    assert!(tree.has_exit(end));

    // a genuinely new label allocates a node and an exit
    let mut tree = phoneme_tree();
    tree.activate_end_label(4, None, true);
    assert_eq!(tree.num_nodes(), nodes_before + 1);
    let exit = tree.exit(tree.end_exit_id());
    assert_eq!(exit.lemma, None);
    assert_eq!(exit.transit_root, tree.root());
}

#[test]
fn transition_penalties_use_the_three_classes() {
    let lexicon = cat_car_lexicon();
    let scorer = phoneme_scorer();
    let mut options = SearchOptions {
        use_transition_penalty: true,
        ..SearchOptions::default()
    };
    options.transition_penalty.default_transition.loop_ = 2.0;
    options.transition_penalty.default_transition.forward = 1.0;
    options.transition_penalty.special_transition.exit = 4.0;
    options.transition_penalty.special_transition.forward = 0.5;
    options.transition_penalty.special_transition_labels = vec!["si".into()];

    let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();
    assert!(tree.use_transition_penalty());

    let k = tree.successors(tree.root())[0];
    let ae = tree.successors(k)[0];
    assert_eq!(tree.transition_penalty(k, ae), 1.0);
    assert_eq!(tree.transition_penalty(k, k), 2.0);
    // root class comes from the root row
    assert_eq!(tree.transition_penalty(tree.root(), k), 0.0);

    let si = tree.silence();
    assert_eq!(tree.exit_penalty(si), 4.0);
    assert_eq!(tree.exit_penalty(k), 0.0);

    let mut tree = tree;
    tree.set_expansion_penalty(false);
    assert!(tree.use_expansion_penalty());
}

#[test]
fn hmm_tree_converts_transit_states_to_roots() {
    let lexicon = cat_car_lexicon();
    let scorer = phoneme_scorer();
    let options = SearchOptions {
        label_unit: LabelUnit::Hmm,
        ..SearchOptions::default()
    };
    // root -(k)-> s1 -(ae)-> s2 with an exit for CAT back to the root state
    let graph = StateGraph::from_json_str(
        r#"{
            "root": 0,
            "states": [
                { "successors": [1] },
                { "label": "k", "successors": [2] },
                { "label": "ae",
                  "exits": [{ "pronunciation": 0, "transit_state": 3 }] },
                { "label": "k", "successors": [] }
            ],
            "word_boundary_states": [2]
        }"#,
    )
    .unwrap();
    let tree = TreeBuilder::new(&lexicon, &scorer, &options)
        .build_hmm(&graph)
        .unwrap();

    assert!(tree.is_hmm_tree());
    assert_eq!(tree.num_nodes(), 4); // root, k, ae, transit root
    let exit = &tree.all_exits()[0];
    assert_eq!(exit.pronunciation, Some(0));
    let transit = exit.transit_root;
    assert_eq!(tree.label(transit), INVALID_ID);
    assert!(tree.force_end_nodes().contains(&tree.root()));

    // transit roots never loop
    let mut tree = tree;
    tree.activate_loop();
    assert!(!tree.successors(transit).contains(&transit));
}

#[test]
fn image_round_trip_reproduces_the_tree() {
    let lexicon = cat_car_lexicon();
    let scorer = phoneme_scorer();
    let options = SearchOptions::default();
    let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let archive = CacheArchive::new(dir.path());
    let checksum = tree_config_checksum(&options, &lexicon, &scorer);
    tree.write_image(&archive, checksum).unwrap();

    let read = LabelTree::read_image(&archive, &lexicon, &options, checksum).unwrap();
    assert_eq!(read.num_nodes(), tree.num_nodes());
    assert_eq!(read.node_labels, tree.node_labels);
    assert_eq!(read.successors, tree.successors);
    assert_eq!(read.node_exits, tree.node_exits);
    assert_eq!(read.exits, tree.exits);
    assert_eq!(read.silence, tree.silence);
    assert_eq!(read.has_pronunciation, tree.has_pronunciation);
}

#[test]
fn changed_options_invalidate_the_image() {
    let lexicon = cat_car_lexicon();
    let scorer = phoneme_scorer();
    let options = SearchOptions::default();
    let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let archive = CacheArchive::new(dir.path());
    tree.write_image(&archive, tree_config_checksum(&options, &lexicon, &scorer))
        .unwrap();

    let changed = SearchOptions {
        label_unit: LabelUnit::Subword,
        ..SearchOptions::default()
    };
    let checksum = tree_config_checksum(&changed, &lexicon, &scorer);
    assert!(LabelTree::read_image(&archive, &lexicon, &changed, checksum).is_err());
}

#[test]
fn identical_builds_serialize_identically() {
    let lexicon = cat_car_lexicon();
    let scorer = phoneme_scorer();
    let options = SearchOptions::default();
    let checksum = tree_config_checksum(&options, &lexicon, &scorer);

    let dir = tempfile::tempdir().unwrap();
    let a = CacheArchive::new(dir.path().join("a"));
    let b = CacheArchive::new(dir.path().join("b"));
    TreeBuilder::new(&lexicon, &scorer, &options)
        .build()
        .unwrap()
        .write_image(&a, checksum)
        .unwrap();
    TreeBuilder::new(&lexicon, &scorer, &options)
        .build()
        .unwrap()
        .write_image(&b, checksum)
        .unwrap();

    let bytes_a = std::fs::read(dir.path().join("a").join("label-tree.img")).unwrap();
    let bytes_b = std::fs::read(dir.path().join("b").join("label-tree.img")).unwrap();
    assert_eq!(bytes_a, bytes_b);
}
