//! Compressed language-model lookahead over the label tree.
//!
//! Chains with a single successor collapse onto one lookahead node, so the
//! table is much smaller than the tree. Tree roots and transit roots map to
//! lookahead node 0 and never carry a lookahead score; the end-label node is
//! clamped to zero as well. Per-history score tables are filled by one batch
//! LM lookup followed by a minimum push in reverse-topological order.

mod image;

#[cfg(test)]
mod lookahead_tests;

pub use image::{LOOKAHEAD_FORMAT_VERSION, LOOKAHEAD_IMAGE_ENTRY, lookahead_config_checksum};

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use treebeam_core::{
    BatchRequest, CompiledBatchRequest, INVALID_ID, INVALID_SCORE, LanguageModel, Lexicon,
    LmHistory, LookaheadId, NodeId, Score,
};

use crate::NetworkError;
use crate::tree::LabelTree;

/// Static lookahead graph: tree-node and exit mappings plus the successor
/// map, stored so a descending walk pushes scores in reverse-topological
/// order. Transit-root subtrees occupy the ids above `transit_node_end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookaheadStructure {
    n_entries: u32,
    transit_node_end: LookaheadId,
    node_id: Vec<LookaheadId>,
    exit_to_node: Vec<LookaheadId>,
    successors: BTreeMap<LookaheadId, Vec<LookaheadId>>,
}

impl LookaheadStructure {
    pub fn build(tree: &LabelTree) -> Result<Self, NetworkError> {
        let mut builder = StructureBuilder {
            tree,
            node_id: vec![INVALID_ID; tree.num_nodes() as usize],
            exit_to_node: vec![INVALID_ID; tree.all_exits().len()],
            successors: BTreeMap::new(),
            n_entries: 0,
        };

        builder.node_id[tree.root() as usize] = 0;
        builder.n_entries = 1;
        let mut queue: VecDeque<NodeId> = VecDeque::from([tree.root()]);
        let mut transit_roots = Vec::new();
        builder.traverse(&mut queue, &mut transit_roots);

        // transit-root subtrees get ids above every id of the first pass so
        // the descending score push stays well ordered
        let transit_node_end = if transit_roots.is_empty() {
            builder.n_entries
        } else {
            *builder
                .successors
                .keys()
                .next_back()
                .ok_or(NetworkError::EmptyTree)?
        };
        while !transit_roots.is_empty() {
            queue.extend(transit_roots.drain(..));
            builder.traverse(&mut queue, &mut transit_roots);
        }

        builder.verify()?;
        debug!(
            entries = builder.n_entries,
            tree_nodes = tree.num_nodes(),
            "lookahead structure built"
        );
        Ok(LookaheadStructure {
            n_entries: builder.n_entries,
            transit_node_end,
            node_id: builder.node_id,
            exit_to_node: builder.exit_to_node,
            successors: builder.successors,
        })
    }

    pub fn n_entries(&self) -> u32 {
        self.n_entries
    }

    #[inline]
    pub fn node_of(&self, tree_node: NodeId) -> LookaheadId {
        self.node_id[tree_node as usize]
    }

    pub fn exit_node(&self, exit: u32) -> LookaheadId {
        self.exit_to_node[exit as usize]
    }

    /// Successor entries in descending id order (the push order).
    pub fn successor_entries(&self) -> impl Iterator<Item = (LookaheadId, &[LookaheadId])> {
        self.successors
            .iter()
            .rev()
            .map(|(&id, succs)| (id, succs.as_slice()))
    }

    /// Fill `scores` for `history`: batch lookup into direct-exit nodes,
    /// then a minimum push from high ids to low, a recursive pass for the
    /// transit region, and the root/end clamps.
    fn fill(
        &self,
        lm: &dyn LanguageModel,
        history: &LmHistory,
        batch: &CompiledBatchRequest,
        end_node: LookaheadId,
        scores: &mut Vec<Score>,
    ) {
        scores.clear();
        scores.resize(self.n_entries as usize, INVALID_SCORE);
        lm.get_batch(history, batch, scores);

        // roots carry no lookahead score: either not a hypothesis or
        // already counted as the previous word
        scores[0] = 0.0;

        for (&id, succs) in self
            .successors
            .range(1..=self.transit_node_end)
            .rev()
        {
            let mut s = scores[id as usize];
            for &succ in succs {
                if scores[succ as usize] < s {
                    s = scores[succ as usize];
                }
            }
            scores[id as usize] = s;
        }

        // cross-word fan-in is not well ordered, resolve it recursively
        if self.transit_node_end != self.n_entries {
            let ids: Vec<LookaheadId> = self
                .successors
                .range(self.transit_node_end + 1..)
                .map(|(&id, _)| id)
                .collect();
            for id in ids {
                self.compute_node_score(id, scores);
            }
        }

        if end_node != INVALID_ID {
            scores[end_node as usize] = 0.0;
        }
    }

    fn compute_node_score(&self, id: LookaheadId, scores: &mut [Score]) {
        if scores[id as usize] != INVALID_SCORE {
            return;
        }
        let Some(succs) = self.successors.get(&id) else {
            return;
        };
        let mut s = INVALID_SCORE;
        for &succ in succs {
            self.compute_node_score(succ, scores);
            if scores[succ as usize] < s {
                s = scores[succ as usize];
            }
        }
        scores[id as usize] = s;
    }
}

struct StructureBuilder<'a> {
    tree: &'a LabelTree,
    node_id: Vec<LookaheadId>,
    exit_to_node: Vec<LookaheadId>,
    successors: BTreeMap<LookaheadId, Vec<LookaheadId>>,
    n_entries: u32,
}

impl StructureBuilder<'_> {
    fn traverse(&mut self, queue: &mut VecDeque<NodeId>, transit_roots: &mut Vec<NodeId>) {
        while let Some(tree_node) = queue.pop_front() {
            let id = self.node_id[tree_node as usize];
            debug_assert_ne!(id, INVALID_ID);

            let successors: Vec<NodeId> = self
                .tree
                .successors(tree_node)
                .iter()
                .copied()
                .filter(|&s| s != tree_node)
                .collect();

            if successors.len() == 1 {
                // single-successor chains share one lookahead node
                let succ = successors[0];
                if self.node_id[succ as usize] == INVALID_ID {
                    self.node_id[succ as usize] = id;
                    queue.push_back(succ);
                } else {
                    self.link(id, self.node_id[succ as usize]);
                }
            } else {
                for &succ in &successors {
                    if self.node_id[succ as usize] == INVALID_ID {
                        let new_id = self.n_entries;
                        self.n_entries += 1;
                        self.node_id[succ as usize] = new_id;
                        self.link(id, new_id);
                        queue.push_back(succ);
                    } else {
                        self.link(id, self.node_id[succ as usize]);
                    }
                }
            }

            for &exit in self.tree.exits(tree_node) {
                debug_assert_eq!(self.exit_to_node[exit as usize], INVALID_ID);
                self.exit_to_node[exit as usize] = id;
                let transit_root = self.tree.exit(exit).transit_root;
                if self.node_id[transit_root as usize] == INVALID_ID {
                    // transit roots score like the root
                    self.node_id[transit_root as usize] = 0;
                    transit_roots.push(transit_root);
                }
            }
        }
    }

    fn link(&mut self, pred: LookaheadId, succ: LookaheadId) {
        if pred == succ {
            return;
        }
        let entry = self.successors.entry(pred).or_default();
        if !entry.contains(&succ) {
            entry.push(succ);
        }
    }

    fn verify(&self) -> Result<(), NetworkError> {
        if self.node_id.iter().any(|&id| id == INVALID_ID) {
            return Err(NetworkError::ImageContents("unmapped tree node in lookahead"));
        }
        let mut end_nodes: HashSet<LookaheadId> = HashSet::new();
        for &id in &self.exit_to_node {
            if id == INVALID_ID {
                return Err(NetworkError::ImageContents("unmapped exit in lookahead"));
            }
            end_nodes.insert(id);
        }
        for id in 0..self.n_entries {
            if !self.successors.contains_key(&id) && !end_nodes.contains(&id) {
                return Err(NetworkError::ImageContents(
                    "lookahead node without successors or exit",
                ));
            }
        }
        Ok(())
    }
}

/// One per-history score table, indexed by lookahead id.
#[derive(Debug, Clone)]
pub struct LookaheadTable {
    scores: Vec<Score>,
}

impl LookaheadTable {
    #[inline]
    pub fn score(&self, id: LookaheadId) -> Score {
        self.scores[id as usize]
    }

    pub fn scores(&self) -> &[Score] {
        &self.scores
    }
}

/// Runtime lookahead: static structure, the compiled batch request and the
/// per-history table cache with the precomputed unigram fallback.
pub struct Lookahead {
    structure: LookaheadStructure,
    batch: CompiledBatchRequest,
    end_node: LookaheadId,
    lm: Arc<dyn LanguageModel>,
    scale: Score,
    history_limit: i32,
    unigram_history: LmHistory,
    unigram: Arc<LookaheadTable>,
    cache: HashMap<u64, Arc<LookaheadTable>>,
}

impl Lookahead {
    /// Build the batch request from the tree exits and precompute the
    /// unigram table. The end exit (null lemma) becomes the clamped end
    /// node instead of a request.
    pub fn new(
        structure: LookaheadStructure,
        tree: &LabelTree,
        lexicon: &Lexicon,
        lm: Arc<dyn LanguageModel>,
        scale: Score,
        history_limit: i32,
    ) -> Result<Self, NetworkError> {
        let mut requests = Vec::with_capacity(tree.all_exits().len());
        let mut end_node = INVALID_ID;
        for (idx, exit) in tree.all_exits().iter().enumerate() {
            match exit.lemma {
                None => {
                    if idx as u32 != tree.end_exit_id() {
                        return Err(NetworkError::ImageContents(
                            "exit without lemma that is not the end exit",
                        ));
                    }
                    end_node = structure.exit_node(idx as u32);
                }
                Some(lemma) => {
                    requests.push(BatchRequest {
                        tokens: lexicon.lemma(lemma).synt.clone(),
                        target: structure.exit_node(idx as u32),
                        offset: 0.0,
                    });
                }
            }
        }
        let batch = lm.compile_batch_request(requests);

        let unigram_history = lm.reduced_history(&lm.start_history(), 0);
        let mut lookahead = Self {
            structure,
            batch,
            end_node,
            lm,
            scale,
            history_limit,
            unigram_history: unigram_history.clone(),
            unigram: Arc::new(LookaheadTable { scores: Vec::new() }),
            cache: HashMap::new(),
        };
        lookahead.unigram = Arc::new(lookahead.compute(&unigram_history));
        info!(
            entries = lookahead.structure.n_entries(),
            requests = lookahead.batch.requests.len(),
            history_limit,
            "lm lookahead initialised"
        );
        Ok(lookahead)
    }

    #[inline]
    pub fn node_of(&self, tree_node: NodeId) -> LookaheadId {
        self.structure.node_of(tree_node)
    }

    pub fn structure(&self) -> &LookaheadStructure {
        &self.structure
    }

    /// Reduce a history to the configured lookahead order.
    pub fn reduced_history(&self, history: &LmHistory) -> LmHistory {
        if self.history_limit >= 0 {
            self.lm.reduced_history(history, self.history_limit)
        } else {
            history.clone()
        }
    }

    pub fn unigram_history(&self) -> &LmHistory {
        &self.unigram_history
    }

    pub fn unigram_table(&self) -> Arc<LookaheadTable> {
        Arc::clone(&self.unigram)
    }

    /// Score table for `history`, computed on demand and cached.
    pub fn table_for(&mut self, history: &LmHistory) -> Arc<LookaheadTable> {
        if *history == self.unigram_history {
            return Arc::clone(&self.unigram);
        }
        let key = history.hash_key();
        if let Some(table) = self.cache.get(&key) {
            return Arc::clone(table);
        }
        let table = Arc::new(self.compute(history));
        self.cache.insert(key, Arc::clone(&table));
        table
    }

    fn compute(&self, history: &LmHistory) -> LookaheadTable {
        let mut scores = Vec::new();
        self.structure
            .fill(&*self.lm, history, &self.batch, self.end_node, &mut scores);
        if self.scale != 1.0 {
            for score in &mut scores {
                if *score < INVALID_SCORE {
                    *score *= self.scale;
                }
            }
        }
        LookaheadTable { scores }
    }

    /// Drop cached tables (between corpora; the unigram table stays).
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
