//! Tests for lookahead construction, scoring and image round-trips.

use std::sync::Arc;

use treebeam_core::{
    INVALID_SCORE, LanguageModel, Lexicon, SearchOptions, TableLm, TableLmSpec, TableLmEntry,
};

use super::{Lookahead, LookaheadStructure, lookahead_config_checksum};
use crate::image::CacheArchive;
use crate::tree::tree_tests::{cat_car_lexicon, phoneme_scorer};
use crate::tree::{LabelTree, TreeBuilder};

fn phoneme_tree(lexicon: &Lexicon) -> LabelTree {
    let scorer = phoneme_scorer();
    let options = SearchOptions::default();
    TreeBuilder::new(lexicon, &scorer, &options).build().unwrap()
}

fn unigram_lm(lexicon: &mut Lexicon, cat: f32, car: f32) -> Arc<TableLm> {
    let spec = TableLmSpec {
        order: 1,
        scale: 1.0,
        default_score: INVALID_SCORE,
        entries: vec![
            TableLmEntry {
                context: vec![],
                token: "CAT".into(),
                score: cat,
            },
            TableLmEntry {
                context: vec![],
                token: "CAR".into(),
                score: car,
            },
            TableLmEntry {
                context: vec![],
                token: "</s>".into(),
                score: 1.0,
            },
        ],
    };
    Arc::new(TableLm::from_spec(spec, lexicon.tokens_mut()))
}

#[test]
fn chains_compress_onto_one_node() {
    let lexicon = cat_car_lexicon();
    let tree = phoneme_tree(&lexicon);
    let structure = LookaheadStructure::build(&tree).unwrap();

    // ae/t collapse onto one node, aa/r onto another: 5 entries for 7 nodes
    assert_eq!(structure.n_entries(), 5);

    let k = tree.successors(tree.root())[0];
    let ae = tree.successors(k)[0];
    let t = tree.successors(ae)[0];
    assert_eq!(structure.node_of(ae), structure.node_of(t));
    assert_ne!(structure.node_of(ae), structure.node_of(k));
    assert_ne!(structure.node_of(k), structure.node_of(tree.root()));

    // exits sit on the node of their last label
    assert_eq!(structure.exit_node(0), structure.node_of(t));
}

#[test]
fn scores_are_minima_over_completions() {
    let mut lexicon = cat_car_lexicon();
    let tree = phoneme_tree(&lexicon);
    let lm = unigram_lm(&mut lexicon, 2.0, 3.0);
    let structure = LookaheadStructure::build(&tree).unwrap();
    let mut lookahead =
        Lookahead::new(structure, &tree, &lexicon, lm.clone(), 1.0, -1).unwrap();

    let table = lookahead.table_for(&lm.start_history());

    let k = tree.successors(tree.root())[0];
    let ae = tree.successors(k)[0];
    let aa = tree.successors(k)[1];
    // below the branch each path sees exactly its own word
    assert_eq!(table.score(lookahead.node_of(ae)), 2.0);
    assert_eq!(table.score(lookahead.node_of(aa)), 3.0);
    // the shared k node dominates both words: the better one bounds it
    assert_eq!(table.score(lookahead.node_of(k)), 2.0);
    // the root never biases pruning
    assert_eq!(table.score(lookahead.node_of(tree.root())), 0.0);

    // the silence exit has no LM tokens: score 0 at its node
    let si = tree.silence();
    assert_eq!(table.score(lookahead.node_of(si)), 0.0);
}

#[test]
fn lookahead_invariant_holds_on_every_node() {
    let mut lexicon = cat_car_lexicon();
    let tree = phoneme_tree(&lexicon);
    let lm = unigram_lm(&mut lexicon, 2.0, 3.0);
    let structure = LookaheadStructure::build(&tree).unwrap();
    let mut lookahead =
        Lookahead::new(structure.clone(), &tree, &lexicon, lm.clone(), 1.0, -1).unwrap();
    let table = lookahead.table_for(&lm.start_history());

    // every node with successors scores the minimum of its successors
    // (direct-exit scores can only lower it further)
    for (id, succs) in structure.successor_entries() {
        if id == 0 {
            continue; // clamped
        }
        let min_succ = succs
            .iter()
            .map(|&s| table.score(s))
            .fold(INVALID_SCORE, f32::min);
        assert!(table.score(id) <= min_succ);
    }
}

#[test]
fn scale_multiplies_finite_scores() {
    let mut lexicon = cat_car_lexicon();
    let tree = phoneme_tree(&lexicon);
    let lm = unigram_lm(&mut lexicon, 2.0, 3.0);
    let structure = LookaheadStructure::build(&tree).unwrap();
    let mut lookahead = Lookahead::new(structure, &tree, &lexicon, lm.clone(), 0.5, -1).unwrap();
    let table = lookahead.table_for(&lm.start_history());

    let k = tree.successors(tree.root())[0];
    let ae = tree.successors(k)[0];
    assert_eq!(table.score(lookahead.node_of(ae)), 1.0);
}

#[test]
fn infeasible_subtrees_stay_infinite() {
    let mut lexicon = cat_car_lexicon();
    let tree = phoneme_tree(&lexicon);
    // LM knows CAT only: the CAR subtree has no feasible completion
    let spec = TableLmSpec {
        order: 1,
        scale: 1.0,
        default_score: INVALID_SCORE,
        entries: vec![TableLmEntry {
            context: vec![],
            token: "CAT".into(),
            score: 2.0,
        }],
    };
    let lm = Arc::new(TableLm::from_spec(spec, lexicon.tokens_mut()));
    let structure = LookaheadStructure::build(&tree).unwrap();
    let mut lookahead = Lookahead::new(structure, &tree, &lexicon, lm.clone(), 1.0, -1).unwrap();
    let table = lookahead.table_for(&lm.start_history());

    let k = tree.successors(tree.root())[0];
    let aa = tree.successors(k)[1];
    assert_eq!(table.score(lookahead.node_of(aa)), INVALID_SCORE);
}

#[test]
fn tables_are_cached_per_history() {
    let mut lexicon = cat_car_lexicon();
    let tree = phoneme_tree(&lexicon);
    let lm = unigram_lm(&mut lexicon, 2.0, 3.0);
    let structure = LookaheadStructure::build(&tree).unwrap();
    let mut lookahead = Lookahead::new(structure, &tree, &lexicon, lm.clone(), 1.0, -1).unwrap();

    let h = lm.start_history();
    let a = lookahead.table_for(&h);
    let b = lookahead.table_for(&h);
    assert!(Arc::ptr_eq(&a, &b));

    // the precomputed unigram table answers the empty history directly
    let unigram_history = lookahead.unigram_history().clone();
    let unigram = lookahead.table_for(&unigram_history);
    assert!(Arc::ptr_eq(&unigram, &lookahead.unigram_table()));
}

#[test]
fn image_round_trip_reproduces_the_structure() {
    let lexicon = cat_car_lexicon();
    let tree = phoneme_tree(&lexicon);
    let structure = LookaheadStructure::build(&tree).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let archive = CacheArchive::new(dir.path());
    let checksum = lookahead_config_checksum(&tree, -1);
    structure.write_image(&archive, checksum).unwrap();

    let read = LookaheadStructure::read_image(&archive, checksum).unwrap();
    assert_eq!(read, structure);

    // a different history limit invalidates the image
    assert!(LookaheadStructure::read_image(&archive, lookahead_config_checksum(&tree, 2)).is_err());
}
