//! Human-readable network dumps for the CLI and snapshot tests.

use treebeam_core::{INVALID_ID, Lexicon};

use crate::lookahead::LookaheadStructure;
use crate::tree::LabelTree;

/// Render the tree one node per block: label, successors, exits.
pub fn dump_tree(tree: &LabelTree, lexicon: &Lexicon) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "label tree: nodes={} exits={} pronunciation={}",
        tree.num_nodes(),
        tree.all_exits().len(),
        tree.has_pronunciation(),
    ));

    for node in 0..tree.num_nodes() {
        let label = tree.label(node);
        if tree.is_root(node) {
            lines.push(format!("node {node} root"));
        } else if label == INVALID_ID {
            lines.push(format!("node {node} transit-root"));
        } else {
            lines.push(format!("node {node} label={label}"));
        }

        if tree.has_successors(node) {
            let succs: Vec<String> = tree
                .successors(node)
                .iter()
                .map(|s| s.to_string())
                .collect();
            lines.push(format!("  -> {}", succs.join(" ")));
        }
        for &exit_id in tree.exits(node) {
            let exit = tree.exit(exit_id);
            let orth = exit
                .lemma
                .map(|l| lexicon.lemma(l).orth.as_str())
                .unwrap_or("<null>");
            match exit.pronunciation {
                Some(pron) => lines.push(format!(
                    "  exit {exit_id}: {orth} pron={pron} transit={}",
                    exit.transit_root
                )),
                None => lines.push(format!(
                    "  exit {exit_id}: {orth} transit={}",
                    exit.transit_root
                )),
            }
        }
    }
    lines.join("\n")
}

/// Render the lookahead structure: per-tree-node mapping and the
/// descending successor map.
pub fn dump_lookahead(structure: &LookaheadStructure, tree: &LabelTree) -> String {
    let mut lines = Vec::new();
    lines.push(format!("lm lookahead: entries={}", structure.n_entries()));

    let mapping: Vec<String> = (0..tree.num_nodes())
        .map(|n| format!("{n}:{}", structure.node_of(n)))
        .collect();
    lines.push(format!("tree-node map: {}", mapping.join(" ")));

    for (id, succs) in structure.successor_entries() {
        let succs: Vec<String> = succs.iter().map(|s| s.to_string()).collect();
        lines.push(format!("node {id} -> {}", succs.join(" ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod dump_tests {
    use treebeam_core::SearchOptions;

    use super::*;
    use crate::lookahead::LookaheadStructure;
    use crate::tree::TreeBuilder;
    use crate::tree::tree_tests::{cat_car_lexicon, phoneme_scorer};

    #[test]
    fn tree_dump_is_stable() {
        let lexicon = cat_car_lexicon();
        let scorer = phoneme_scorer();
        let options = SearchOptions::default();
        let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();

        insta::assert_snapshot!(dump_tree(&tree, &lexicon), @r"
        label tree: nodes=7 exits=3 pronunciation=true
        node 0 root
          -> 1 6
        node 1 label=0
          -> 2 4
        node 2 label=1
          -> 3
        node 3 label=2
          exit 0: CAT pron=0 transit=0
        node 4 label=3
          -> 5
        node 5 label=4
          exit 1: CAR pron=1 transit=0
        node 6 label=5
          exit 2: [SILENCE] pron=2 transit=0
        ");
    }

    #[test]
    fn lookahead_dump_is_stable() {
        let lexicon = cat_car_lexicon();
        let scorer = phoneme_scorer();
        let options = SearchOptions::default();
        let tree = TreeBuilder::new(&lexicon, &scorer, &options).build().unwrap();
        let structure = LookaheadStructure::build(&tree).unwrap();

        insta::assert_snapshot!(dump_lookahead(&structure, &tree), @r"
        lm lookahead: entries=5
        tree-node map: 0:0 1:1 2:3 3:3 4:4 5:4 6:2
        node 1 -> 3 4
        node 0 -> 1 2
        ");
    }
}
