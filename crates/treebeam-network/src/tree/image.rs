//! Label-tree image I/O.
//!
//! Payload order: numNodes, hasPronunciation, silence node, successor map,
//! node labels, node exit map, exits as (lemma-or-pron id, transit root),
//! optional forced-end set, optional transition tables. Scaled penalty
//! values are hard-coded into the cache; different scaling needs a rebuild.

use tracing::info;

use treebeam_core::{INVALID_ID, LabelScorer, Lexicon, SearchOptions};

use super::{LabelTree, TransitionPenalty};
use crate::NetworkError;
use crate::image::CacheArchive;

/// Archive entry of the label tree.
pub const TREE_IMAGE_ENTRY: &str = "label-tree.img";

/// Bumped whenever the payload layout changes.
pub const TREE_FORMAT_VERSION: u32 = 10;

/// Checksum over everything a cached tree depends on: the construction
/// options and the lexicon/scorer shapes.
pub fn tree_config_checksum(
    options: &SearchOptions,
    lexicon: &Lexicon,
    scorer: &dyn LabelScorer,
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[
        options.label_unit as u8,
        options.skip_unknown_label as u8,
        options.skip_silence as u8,
        options.use_transition_penalty as u8,
    ]);
    hasher.update(&(lexicon.lemmas().len() as u32).to_le_bytes());
    hasher.update(&(lexicon.pronunciations().len() as u32).to_le_bytes());
    hasher.update(&(scorer.num_classes() as u32).to_le_bytes());
    hasher.finalize()
}

impl LabelTree {
    pub fn write_image(
        &self,
        archive: &CacheArchive,
        config_checksum: u32,
    ) -> Result<(), NetworkError> {
        let mut out = archive.writer(TREE_IMAGE_ENTRY, TREE_FORMAT_VERSION, config_checksum);
        info!(root = %archive.root().display(), "writing label tree image");

        out.write_u32(self.num_nodes());
        out.write_bool(self.has_pronunciation);
        out.write_u32(self.silence);
        out.write_u32_rows(&self.successors);
        out.write_u32_slice(&self.node_labels);
        out.write_u32_rows(&self.node_exits);

        let exit_pairs: Vec<(u32, u32)> = self
            .exits
            .iter()
            .map(|e| {
                let id = if self.has_pronunciation {
                    e.pronunciation.unwrap_or(INVALID_ID)
                } else {
                    e.lemma.unwrap_or(INVALID_ID)
                };
                (id, e.transit_root)
            })
            .collect();
        out.write_u32_pairs(&exit_pairs);

        out.write_bool(!self.force_end_nodes.is_empty());
        if !self.force_end_nodes.is_empty() {
            let mut nodes: Vec<u32> = self.force_end_nodes.iter().copied().collect();
            nodes.sort_unstable();
            out.write_u32_slice(&nodes);
        }

        out.write_bool(self.use_transition_penalty);
        if self.use_transition_penalty {
            out.write_u32(self.transitions.len() as u32);
            for row in &self.transitions {
                out.write_f32(row.loop_);
                out.write_f32(row.forward);
                out.write_f32(row.exit);
            }
            let mut mapping: Vec<(u32, u32)> = self
                .node_transition
                .iter()
                .map(|(&n, &c)| (n, c))
                .collect();
            mapping.sort_unstable();
            out.write_u32_pairs(&mapping);
        }

        out.finish()?;
        Ok(())
    }

    pub fn read_image(
        archive: &CacheArchive,
        lexicon: &Lexicon,
        options: &SearchOptions,
        config_checksum: u32,
    ) -> Result<LabelTree, NetworkError> {
        let mut input = archive.reader(TREE_IMAGE_ENTRY, TREE_FORMAT_VERSION, config_checksum)?;

        let mut tree = LabelTree {
            unit: options.label_unit,
            silence: INVALID_ID,
            end_node: INVALID_ID,
            end_exit: INVALID_ID,
            use_expansion_penalty: true,
            ..LabelTree::default()
        };

        let num_nodes = input.read_u32()?;
        tree.has_pronunciation = input.read_bool()?;
        tree.silence = input.read_u32()?;
        tree.successors = input.read_u32_rows()?;
        tree.node_labels = input.read_u32_vec()?;
        tree.node_exits = input.read_u32_rows()?;
        if tree.successors.len() != num_nodes as usize
            || tree.node_labels.len() != num_nodes as usize
            || tree.node_exits.len() != num_nodes as usize
        {
            return Err(NetworkError::ImageContents("node section size mismatch"));
        }

        for (id, transit_root) in input.read_u32_pairs()? {
            let (pronunciation, lemma) = if tree.has_pronunciation {
                if id == INVALID_ID {
                    (None, None)
                } else {
                    let pron = lexicon
                        .pronunciations()
                        .get(id as usize)
                        .ok_or(NetworkError::ImageContents("dangling pronunciation id"))?;
                    (Some(pron.id), Some(pron.lemma))
                }
            } else if id == INVALID_ID {
                (None, None)
            } else {
                if lexicon.lemmas().get(id as usize).is_none() {
                    return Err(NetworkError::ImageContents("dangling lemma id"));
                }
                (None, Some(id))
            };
            tree.exits.push(super::Exit {
                pronunciation,
                lemma,
                transit_root,
            });
        }

        if input.read_bool()? {
            info!("reading forced end nodes");
            tree.force_end_nodes = input.read_u32_vec()?.into_iter().collect();
        }

        tree.use_transition_penalty = input.read_bool()?;
        if tree.use_transition_penalty {
            info!("reading label transition penalties");
            let rows = input.read_u32()? as usize;
            for _ in 0..rows {
                let loop_ = input.read_f32()?;
                let forward = input.read_f32()?;
                let exit = input.read_f32()?;
                tree.transitions.push(TransitionPenalty::new(loop_, forward, exit));
            }
            tree.node_transition = input.read_u32_pairs()?.into_iter().collect();
        }

        if !input.at_end() {
            return Err(NetworkError::ImageContents("trailing payload bytes"));
        }
        info!(nodes = num_nodes, exits = tree.exits.len(), "label tree image read");
        Ok(tree)
    }
}
