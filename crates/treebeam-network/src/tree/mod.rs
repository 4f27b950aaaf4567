//! Static lexical prefix tree.
//!
//! A compressed graph of the pronunciation lexicon parameterised by the
//! modeling unit. Each node holds an acoustic label; each exit holds the
//! lemma (and pronunciation, where the unit has one) emitted on completion
//! plus the root to re-enter. The orthography of a transcription unit is a
//! path through the tree; variants are just different paths or exits.

mod build;
mod hmm;
mod image;

#[cfg(test)]
pub(crate) mod tree_tests;

pub use build::TreeBuilder;
pub use hmm::{StateGraph, StateGraphExit, StateGraphState};
pub use image::{TREE_FORMAT_VERSION, TREE_IMAGE_ENTRY, tree_config_checksum};

use std::collections::{HashMap, HashSet};

use treebeam_core::{
    ExitId, INVALID_ID, LabelIndex, LabelUnit, LemmaId, NodeId, PronId, Score,
};

/// Label-level transition penalties (no skip transitions).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TransitionPenalty {
    pub loop_: Score,
    pub forward: Score,
    pub exit: Score,
}

impl TransitionPenalty {
    pub fn new(loop_: Score, forward: Score, exit: Score) -> Self {
        Self {
            loop_,
            forward,
            exit,
        }
    }
}

/// Word end of a tree node: what is emitted and where search re-enters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exit {
    pub pronunciation: Option<PronId>,
    pub lemma: Option<LemmaId>,
    /// Entry root of the next tree.
    pub transit_root: NodeId,
}

/// Penalty class of the root node.
pub const TRANSITION_ROOT: u32 = 0;
/// Default penalty class (not stored per node).
pub const TRANSITION_DEFAULT: u32 = 1;
/// Penalty class of labels listed as special.
pub const TRANSITION_SPECIAL: u32 = 2;

/// Static tree over dense node ids; node 0 is the root.
#[derive(Debug, Clone, Default)]
pub struct LabelTree {
    unit: LabelUnit,
    has_pronunciation: bool,

    /// Acoustic label per node; root and transit roots carry `INVALID_ID`.
    node_labels: Vec<LabelIndex>,
    successors: Vec<Vec<NodeId>>,
    node_exits: Vec<Vec<ExitId>>,
    exits: Vec<Exit>,

    silence: NodeId,
    /// Uncoarticulated word-end nodes (HMM compatibility).
    force_end_nodes: HashSet<NodeId>,

    use_transition_penalty: bool,
    use_expansion_penalty: bool,
    transitions: Vec<TransitionPenalty>,
    /// Only non-default classes are recorded.
    node_transition: HashMap<NodeId, u32>,

    end_node: NodeId,
    end_exit: ExitId,
}

impl LabelTree {
    pub(crate) fn empty(unit: LabelUnit) -> Self {
        let mut tree = Self {
            unit,
            silence: INVALID_ID,
            end_node: INVALID_ID,
            end_exit: INVALID_ID,
            use_expansion_penalty: true,
            ..Self::default()
        };
        // root = 0, no acoustic label
        tree.create_node(INVALID_ID);
        tree
    }

    pub(crate) fn create_node(&mut self, label: LabelIndex) -> NodeId {
        let id = self.node_labels.len() as NodeId;
        self.node_labels.push(label);
        self.successors.push(Vec::new());
        self.node_exits.push(Vec::new());
        id
    }

    /// Find or create the successor of `source` carrying `label`.
    pub(crate) fn extend_label(&mut self, source: NodeId, label: LabelIndex) -> NodeId {
        if let Some(&existing) = self.successors[source as usize]
            .iter()
            .find(|&&n| n != source && self.node_labels[n as usize] == label)
        {
            return existing;
        }
        let node = self.create_node(label);
        self.successors[source as usize].push(node);
        node
    }

    /// Find or create an exit of `node`; silence exits record the node.
    pub(crate) fn add_exit_to_node(
        &mut self,
        node: NodeId,
        pronunciation: Option<PronId>,
        lemma: Option<LemmaId>,
        transit_root: NodeId,
        is_silence: bool,
    ) -> ExitId {
        if let Some(&existing) = self.node_exits[node as usize].iter().find(|&&e| {
            let exit = &self.exits[e as usize];
            exit.pronunciation == pronunciation && exit.lemma == lemma
        }) {
            return existing;
        }
        if is_silence {
            self.silence = node;
        }
        let exit_id = self.exits.len() as ExitId;
        self.exits.push(Exit {
            pronunciation,
            lemma,
            transit_root,
        });
        self.node_exits[node as usize].push(exit_id);
        exit_id
    }

    // ---- search interface ----

    #[inline]
    pub fn root(&self) -> NodeId {
        0
    }

    #[inline]
    pub fn is_root(&self, node: NodeId) -> bool {
        node == 0
    }

    #[inline]
    pub fn num_nodes(&self) -> u32 {
        self.node_labels.len() as u32
    }

    #[inline]
    pub fn label(&self, node: NodeId) -> LabelIndex {
        self.node_labels[node as usize]
    }

    #[inline]
    pub fn successors(&self, node: NodeId) -> &[NodeId] {
        &self.successors[node as usize]
    }

    #[inline]
    pub fn has_successors(&self, node: NodeId) -> bool {
        !self.successors[node as usize].is_empty()
    }

    #[inline]
    pub fn exits(&self, node: NodeId) -> &[ExitId] {
        &self.node_exits[node as usize]
    }

    #[inline]
    pub fn has_exit(&self, node: NodeId) -> bool {
        !self.node_exits[node as usize].is_empty()
    }

    #[inline]
    pub fn exit(&self, exit: ExitId) -> &Exit {
        &self.exits[exit as usize]
    }

    pub fn all_exits(&self) -> &[Exit] {
        &self.exits
    }

    pub fn unit(&self) -> LabelUnit {
        self.unit
    }

    pub fn is_hmm_tree(&self) -> bool {
        self.unit == LabelUnit::Hmm
    }

    pub fn has_pronunciation(&self) -> bool {
        self.has_pronunciation
    }

    pub fn silence(&self) -> NodeId {
        self.silence
    }

    pub fn is_silence(&self, node: NodeId) -> bool {
        node == self.silence
    }

    pub fn force_end_nodes(&self) -> &HashSet<NodeId> {
        &self.force_end_nodes
    }

    pub fn end_node_id(&self) -> NodeId {
        self.end_node
    }

    pub fn end_exit_id(&self) -> ExitId {
        self.end_exit
    }

    // ---- transition penalties ----

    pub fn use_transition_penalty(&self) -> bool {
        self.use_transition_penalty
    }

    fn transition_class(&self, node: NodeId) -> u32 {
        self.node_transition
            .get(&node)
            .copied()
            .unwrap_or(TRANSITION_DEFAULT)
    }

    pub fn transition_penalty(&self, source: NodeId, target: NodeId) -> Score {
        let row = &self.transitions[self.transition_class(source) as usize];
        if source == target { row.loop_ } else { row.forward }
    }

    pub fn exit_penalty(&self, node: NodeId) -> Score {
        self.transitions[self.transition_class(node) as usize].exit
    }

    /// Skip per-expansion penalties when only exit penalties are non-zero.
    pub fn set_expansion_penalty(&mut self, allow_loop: bool) {
        self.use_expansion_penalty = self.use_transition_penalty;
        if !self.use_expansion_penalty {
            return;
        }
        self.use_expansion_penalty = self.transitions[TRANSITION_ROOT as usize].forward != 0.0;
        for row in &self.transitions[TRANSITION_DEFAULT as usize..] {
            if row.forward != 0.0 || (allow_loop && row.loop_ != 0.0) {
                self.use_expansion_penalty = true;
                break;
            }
        }
    }

    pub fn use_expansion_penalty(&self) -> bool {
        self.use_transition_penalty && self.use_expansion_penalty
    }

    // ---- runtime adjustments ----

    /// Add a self-successor to every loopable node. HMM transit roots and
    /// the root never loop.
    pub fn activate_loop(&mut self) {
        let mut roots: HashSet<NodeId> = HashSet::new();
        if self.unit == LabelUnit::Hmm {
            roots.extend(self.exits.iter().map(|e| e.transit_root));
        }
        for node in 1..self.num_nodes() {
            if roots.contains(&node) {
                continue;
            }
            self.successors[node as usize].push(node);
        }
    }

    /// Splice the end label directly under the root and make sure an exit
    /// with the end lemma (or the null lemma) exists.
    pub fn activate_end_label(
        &mut self,
        end_label: LabelIndex,
        end_lemma: Option<LemmaId>,
        use_null_lemma: bool,
    ) {
        let end_node = self.extend_label(self.root(), end_label);
        self.end_node = end_node;

        let lemma = if use_null_lemma { None } else { end_lemma };
        let existing = self.node_exits[end_node as usize]
            .iter()
            .copied()
            .find(|&e| self.exits[e as usize].lemma == end_lemma);
        self.end_exit = match existing {
            Some(exit) => {
                self.exits[exit as usize].lemma = lemma;
                exit
            }
            None => self.add_exit_to_node(end_node, None, lemma, self.root(), false),
        };
    }
}
