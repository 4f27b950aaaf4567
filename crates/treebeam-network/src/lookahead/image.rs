//! Lookahead-structure image I/O.
//!
//! Payload: numEntries, transitNodeEnd, tree-node map, exit map, successor
//! map stored in descending key order so a forward read restores the
//! reverse-topological push ordering.

use tracing::info;

use treebeam_core::LookaheadId;

use super::LookaheadStructure;
use crate::NetworkError;
use crate::image::CacheArchive;
use crate::tree::LabelTree;

/// Archive entry of the lookahead structure.
pub const LOOKAHEAD_IMAGE_ENTRY: &str = "lm-lookahead.img";

/// Bumped whenever the payload layout changes.
pub const LOOKAHEAD_FORMAT_VERSION: u32 = 10;

/// Checksum over what a cached lookahead depends on: the tree shape and
/// the lookahead history limit.
pub fn lookahead_config_checksum(tree: &LabelTree, history_limit: i32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tree.num_nodes().to_le_bytes());
    hasher.update(&(tree.all_exits().len() as u32).to_le_bytes());
    hasher.update(&history_limit.to_le_bytes());
    hasher.finalize()
}

impl LookaheadStructure {
    pub fn write_image(
        &self,
        archive: &CacheArchive,
        config_checksum: u32,
    ) -> Result<(), NetworkError> {
        let mut out = archive.writer(
            LOOKAHEAD_IMAGE_ENTRY,
            LOOKAHEAD_FORMAT_VERSION,
            config_checksum,
        );
        info!("writing lm-lookahead image");

        out.write_u32(self.n_entries);
        out.write_u32(self.transit_node_end);
        out.write_u32_slice(&self.node_id);
        out.write_u32_slice(&self.exit_to_node);

        out.write_u32(self.successors.len() as u32);
        for (&id, succs) in self.successors.iter().rev() {
            out.write_u32(id);
            out.write_u32_slice(succs);
        }

        out.finish()?;
        Ok(())
    }

    pub fn read_image(
        archive: &CacheArchive,
        config_checksum: u32,
    ) -> Result<LookaheadStructure, NetworkError> {
        let mut input = archive.reader(
            LOOKAHEAD_IMAGE_ENTRY,
            LOOKAHEAD_FORMAT_VERSION,
            config_checksum,
        )?;
        info!("reading lm-lookahead image");

        let n_entries = input.read_u32()?;
        let transit_node_end = input.read_u32()?;
        let node_id = input.read_u32_vec()?;
        let exit_to_node = input.read_u32_vec()?;

        let entries = input.read_u32()? as usize;
        let mut successors = std::collections::BTreeMap::new();
        let mut previous: Option<LookaheadId> = None;
        for _ in 0..entries {
            let id = input.read_u32()?;
            if let Some(prev) = previous
                && id >= prev
            {
                return Err(NetworkError::ImageContents(
                    "lookahead successor map not descending",
                ));
            }
            previous = Some(id);
            successors.insert(id, input.read_u32_vec()?);
        }
        if !input.at_end() {
            return Err(NetworkError::ImageContents("trailing payload bytes"));
        }

        let structure = LookaheadStructure {
            n_entries,
            transit_node_end,
            node_id,
            exit_to_node,
            successors,
        };
        info!(entries = n_entries, "lm-lookahead image read");
        Ok(structure)
    }
}
