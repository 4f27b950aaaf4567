//! Runtime beam search for the treebeam decoder.
//!
//! The search space drives the static network from `treebeam-network`
//! under the scorer's synchronisation regime; the decoder wraps the
//! per-step loop and extracts the best path and lattice.

pub mod decoder;
pub mod histogram;
pub mod hyp;
pub mod instance;
pub mod space;
pub mod stats;
pub mod trace;

pub use decoder::{
    DecodeResult, Decoder, Lattice, LatticeArc, TracebackItem, build_lattice, traceback,
};
pub use histogram::Histogram;
pub use space::SearchSpace;
pub use stats::SearchStatistics;
pub use trace::{Trace, TraceRef};

use treebeam_network::NetworkError;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Configuration or environment error; fatal before any step runs.
    #[error("invalid search topology: {0}")]
    InvalidTopology(&'static str),

    #[error("scorer contract violation: {0}")]
    ScorerContract(String),

    #[error("no sentence end could be produced")]
    NoSentenceEnd,

    #[error(transparent)]
    Network(#[from] NetworkError),
}
