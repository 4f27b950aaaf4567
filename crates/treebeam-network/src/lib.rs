//! Static search network for the treebeam decoder.
//!
//! This crate contains:
//! - The lexical prefix tree and its builders (`tree`)
//! - The compressed LM lookahead structure (`lookahead`)
//! - Versioned, checksummed on-disk images of both (`image`)
//! - Human-readable dumps (`dump`)

pub mod dump;
pub mod image;
pub mod lookahead;
pub mod tree;

pub use image::{CacheArchive, ImageError, ImageReader, ImageWriter};
pub use lookahead::{
    LOOKAHEAD_FORMAT_VERSION, LOOKAHEAD_IMAGE_ENTRY, Lookahead, LookaheadStructure,
    LookaheadTable, lookahead_config_checksum,
};
pub use tree::{
    Exit, LabelTree, StateGraph, StateGraphExit, StateGraphState, TREE_FORMAT_VERSION,
    TREE_IMAGE_ENTRY, TransitionPenalty, TreeBuilder, tree_config_checksum,
};

use tracing::{info, warn};

use treebeam_core::{LabelScorer, LanguageModel, Lexicon, LmHistory, SearchOptions};

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no labels in the tree")]
    EmptyTree,

    #[error("invalid label `{symbol}` ({context}) and no unknown label defined")]
    UnknownLabel { symbol: String, context: String },

    #[error("hmm label unit needs a tied-state graph")]
    HmmNeedsStateGraph,

    #[error("invalid state graph at state {state}: {reason}")]
    InvalidStateGraph { state: u32, reason: &'static str },

    #[error("inconsistent image contents: {0}")]
    ImageContents(&'static str),

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Read the tree image, or build from source and refresh the image.
///
/// A stale or corrupt image is recovered locally: it is discarded with a
/// warning and overwritten after the rebuild.
pub fn load_or_build_tree(
    archive: Option<&CacheArchive>,
    lexicon: &Lexicon,
    scorer: &dyn LabelScorer,
    options: &SearchOptions,
    state_graph: Option<&StateGraph>,
) -> Result<LabelTree, NetworkError> {
    let checksum = tree::tree_config_checksum(options, lexicon, scorer);
    if let Some(archive) = archive {
        match LabelTree::read_image(archive, lexicon, options, checksum) {
            Ok(tree) => return Ok(tree),
            Err(NetworkError::Image(ImageError::Missing(_))) => {}
            Err(err) => warn!(%err, "discarding stale label tree image"),
        }
    }

    let builder = TreeBuilder::new(lexicon, scorer, options);
    let tree = match state_graph {
        Some(graph) => builder.build_hmm(graph)?,
        None => builder.build()?,
    };
    info!(
        nodes = tree.num_nodes(),
        exits = tree.all_exits().len(),
        "label tree built"
    );

    if let Some(archive) = archive {
        match tree.write_image(archive, checksum) {
            Ok(()) => info!("writing network image succeeded"),
            Err(err) => warn!(%err, "writing network image failed"),
        }
    }
    Ok(tree)
}

/// Read the lookahead image, or build from the (already adjusted) tree and
/// refresh the image, then attach the runtime batch request and caches.
pub fn load_or_build_lookahead(
    archive: Option<&CacheArchive>,
    tree: &LabelTree,
    lexicon: &Lexicon,
    lm: std::sync::Arc<dyn LanguageModel>,
    scale: f32,
    history_limit: i32,
) -> Result<Lookahead, NetworkError> {
    let checksum = lookahead_config_checksum(tree, history_limit);
    let structure = match archive {
        Some(archive) => match LookaheadStructure::read_image(archive, checksum) {
            Ok(structure) => structure,
            Err(err) => {
                if !matches!(err, NetworkError::Image(ImageError::Missing(_))) {
                    warn!(%err, "discarding stale lm-lookahead image");
                }
                let structure = LookaheadStructure::build(tree)?;
                match structure.write_image(archive, checksum) {
                    Ok(()) => info!("writing lm-lookahead image succeeded"),
                    Err(err) => warn!(%err, "writing lm-lookahead image failed"),
                }
                structure
            }
        },
        None => LookaheadStructure::build(tree)?,
    };
    Lookahead::new(structure, tree, lexicon, lm, scale, history_limit)
}

/// Convenience: the reduced start history of a lookahead LM.
pub fn lookahead_start_history(lm: &dyn LanguageModel, history_limit: i32) -> LmHistory {
    if history_limit >= 0 {
        lm.reduced_history(&lm.start_history(), history_limit)
    } else {
        lm.start_history()
    }
}
