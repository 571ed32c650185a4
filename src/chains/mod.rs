//! The build-cache graph engine.
//!
//! [`CacheChains`] owns a content-addressed DAG of cache records. A solver
//! adds records keyed by [`crate::digest::output_key`], links them position
//! by position, and attaches result layer chains. [`CacheChains::marshal`]
//! snapshots the graph, severs accidental cycles, collapses semantically
//! equivalent sub-graphs onto shared canonical identities, and emits a
//! deterministically sorted [`crate::manifest::CacheConfig`] together with
//! the descriptor side table; [`parse`] performs the inverse.

mod graph;
mod marshal;
mod normalize;
mod parse;

pub use graph::{CacheChains, ChainsOptions, Item};
pub use parse::{parse, parse_config, ParseError};

use crate::digest::Digest;

/// Result type for graph and marshal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by graph mutation and marshalling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An item has a populated input position with zero links. Severed
    /// cycles commonly leave a record in this state.
    #[error("invalid incomplete links")]
    IncompleteLinks,

    /// `link_from` was called with a source owned by a different graph.
    #[error("source record {digest} belongs to a different graph")]
    ForeignItem { digest: Digest },

    /// The marshaller could not resolve a link source after recursion.
    #[error("invalid source record: {digest}")]
    MissingSourceRecord { digest: Digest },

    /// A result chain referenced a parent chain that was never registered.
    #[error("parent chain id not found")]
    MissingParentChain,
}
