//! HMM tree conversion.
//!
//! Converts a determinized, minimized tied-state graph into a label tree:
//! word-boundary transit states map onto root-type nodes, skip transitions
//! are discarded, TDP rows land in the 3-class penalty table.

use serde::Deserialize;
use tracing::debug;

use treebeam_core::{INVALID_ID, NodeId, PronId, Score};

use super::{LabelTree, TRANSITION_DEFAULT, TransitionPenalty, TreeBuilder};
use crate::NetworkError;

/// Word end attached to a tied state.
#[derive(Debug, Clone, Deserialize)]
pub struct StateGraphExit {
    pub pronunciation: PronId,
    pub transit_state: u32,
}

/// One tied HMM state.
#[derive(Debug, Clone, Deserialize)]
pub struct StateGraphState {
    /// Emission label symbol; absent on the root and pure transit states.
    #[serde(default)]
    pub label: Option<String>,
    /// Forward successors only (skips are discarded upstream).
    #[serde(default)]
    pub successors: Vec<u32>,
    #[serde(default)]
    pub exits: Vec<StateGraphExit>,
    /// Penalty class; absent means the default class.
    #[serde(default)]
    pub transition_class: Option<u32>,
}

/// Determinized tied-state graph, the input of HMM tree conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct StateGraph {
    pub root: u32,
    pub states: Vec<StateGraphState>,
    /// Uncoarticulated word-end states.
    #[serde(default)]
    pub word_boundary_states: Vec<u32>,
    /// Penalty rows indexed by `transition_class`, scaled upstream.
    #[serde(default)]
    pub transitions: Vec<(Score, Score, Score)>,
}

impl StateGraph {
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    fn state(&self, id: u32) -> Result<&StateGraphState, NetworkError> {
        self.states
            .get(id as usize)
            .ok_or(NetworkError::InvalidStateGraph {
                state: id,
                reason: "state id out of range",
            })
    }
}

impl TreeBuilder<'_> {
    /// Convert a tied-state graph into an HMM label tree.
    pub fn build_hmm(&self, graph: &StateGraph) -> Result<LabelTree, NetworkError> {
        let mut tree = LabelTree::empty(treebeam_core::LabelUnit::Hmm);
        tree.has_pronunciation = true;
        if self.options().skip_silence {
            tracing::warn!("skip-silence has no effect on HMM state trees");
        }

        let mut state_to_node: Vec<NodeId> = vec![INVALID_ID; graph.states.len()];
        let root = graph.state(graph.root).map(|_| graph.root)?;
        state_to_node[root as usize] = tree.root();

        let mut stack = vec![root];
        while let Some(state_id) = stack.pop() {
            let node = state_to_node[state_id as usize];
            debug_assert_ne!(node, INVALID_ID);
            let state = graph.state(state_id)?;

            for exit in &state.exits {
                let pron = self
                    .lexicon()
                    .pronunciations()
                    .get(exit.pronunciation as usize)
                    .ok_or(NetworkError::InvalidStateGraph {
                        state: state_id,
                        reason: "exit references an unknown pronunciation",
                    })?;
                graph.state(exit.transit_state)?;
                let mut transit_node = state_to_node[exit.transit_state as usize];
                if transit_node == INVALID_ID {
                    // transit roots carry no emission label
                    transit_node = tree.create_node(INVALID_ID);
                    state_to_node[exit.transit_state as usize] = transit_node;
                    stack.push(exit.transit_state);
                }
                tree.add_exit_to_node(node, Some(pron.id), Some(pron.lemma), transit_node, false);
            }

            for &succ_id in &state.successors {
                let succ = graph.state(succ_id)?;
                let symbol = succ.label.as_deref().ok_or(NetworkError::InvalidStateGraph {
                    state: succ_id,
                    reason: "non-root successor without an emission label",
                })?;
                let label = self
                    .scorer()
                    .label_indices()
                    .get(symbol)
                    .copied()
                    .ok_or_else(|| NetworkError::UnknownLabel {
                        symbol: symbol.to_owned(),
                        context: "state graph".to_owned(),
                    })?;

                let succ_node = state_to_node[succ_id as usize];
                if succ_node == INVALID_ID {
                    let new_node = tree.extend_label(node, label);
                    state_to_node[succ_id as usize] = new_node;
                    stack.push(succ_id);
                } else {
                    if tree.label(succ_node) != label {
                        return Err(NetworkError::InvalidStateGraph {
                            state: succ_id,
                            reason: "shared state reached with conflicting labels",
                        });
                    }
                    if !tree.successors(node).contains(&succ_node) {
                        tree.successors[node as usize].push(succ_node);
                    }
                }
            }
        }

        if !graph.word_boundary_states.is_empty() {
            for &state_id in &graph.word_boundary_states {
                let node = state_to_node
                    .get(state_id as usize)
                    .copied()
                    .filter(|&n| n != INVALID_ID)
                    .ok_or(NetworkError::InvalidStateGraph {
                        state: state_id,
                        reason: "word-boundary state unreachable from the root",
                    })?;
                tree.force_end_nodes.insert(node);
            }
            tree.force_end_nodes.insert(tree.root());
        }

        if self.options().use_transition_penalty {
            tree.use_transition_penalty = true;
            tree.transitions = graph
                .transitions
                .iter()
                .map(|&(l, f, e)| TransitionPenalty::new(l, f, e))
                .collect();
            if tree.transitions.is_empty() {
                return Err(NetworkError::InvalidStateGraph {
                    state: graph.root,
                    reason: "transition penalties requested but the graph has none",
                });
            }
            for (state_id, state) in graph.states.iter().enumerate() {
                let node = state_to_node[state_id];
                if node == INVALID_ID {
                    continue;
                }
                if let Some(class) = state.transition_class
                    && class != TRANSITION_DEFAULT
                {
                    if class as usize >= tree.transitions.len() {
                        return Err(NetworkError::InvalidStateGraph {
                            state: state_id as u32,
                            reason: "transition class out of range",
                        });
                    }
                    tree.node_transition.insert(node, class);
                }
            }
        }

        debug!(
            states = graph.states.len(),
            nodes = tree.num_nodes(),
            "converted tied-state graph to label tree"
        );
        if tree.num_nodes() <= 1 {
            return Err(NetworkError::EmptyTree);
        }
        Ok(tree)
    }
}
