//! buildcache-rs - Remote build-cache manifest engine.
//!
//! Converts an in-memory graph of build-cache records into a deterministic,
//! round-trippable manifest that can be pushed to a content-addressed
//! registry, and reconstructs the same graph from such a manifest.
//!
//! The heart of the crate is the [`chains::CacheChains`] graph: a
//! content-addressed DAG of cache records with typed multi-input links and
//! optional result layer chains. [`chains::CacheChains::marshal`] normalizes
//! the graph (collapsing equivalent sub-graphs and severing accidental
//! cycles) and emits a canonically sorted [`manifest::CacheConfig`];
//! [`chains::parse`] rebuilds an equivalent graph from those bytes.

pub mod chains;
pub mod content;
pub mod digest;
pub mod exporter;
pub mod manifest;
pub mod remote;
pub mod util;

pub use chains::{parse, parse_config, CacheChains, ChainsOptions, Error, Item, ParseError};
pub use content::{
    ByteStream, ContentError, ContentProvider, DescriptorProvider, DescriptorProviderPair,
    Ingester, MemoryContentStore, MultiProvider,
};
pub use digest::{output_key, Digest, DigestError, Index};
pub use exporter::{ExportError, Exporter, ExporterConfig, NoopProgress, ProgressSink, ProgressState};
pub use manifest::{CacheConfig, CacheInput, CacheLayer, CacheRecord, CacheResult};
pub use remote::{Descriptor, Remote};
