//! Content-store collaborator interfaces.
//!
//! The graph engine never fetches or stores bytes itself. It records which
//! provider can produce each referenced blob and hands those pairs to the
//! exporter alongside the marshalled config; the exporter copies blobs from
//! providers into an [`Ingester`].

mod memory;
mod multi_provider;

pub use memory::MemoryContentStore;
pub use multi_provider::MultiProvider;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::digest::Digest;
use crate::remote::Descriptor;

/// Result type for content-store operations.
pub type Result<T> = std::result::Result<T, ContentError>;

/// Errors surfaced by content-store collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content not found: {0}")]
    NotFound(Digest),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Async iterator over blob bytes.
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes>> + Send>>;

/// A source of content-addressed bytes referenced by descriptors.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Open a stream over the bytes of the given digest.
    ///
    /// Returns `ContentError::NotFound` if the provider does not hold the
    /// content.
    async fn fetch(&self, digest: &Digest) -> Result<ByteStream>;
}

/// A content-addressed blob sink.
#[async_trait]
pub trait Ingester: Send + Sync {
    /// Write a blob under the given digest.
    async fn write_blob(&self, digest: &Digest, data: Bytes, descriptor: &Descriptor)
        -> Result<()>;
}

/// A descriptor together with the provider that can fetch its bytes.
#[derive(Clone)]
pub struct DescriptorProviderPair {
    /// The layer descriptor.
    pub descriptor: Descriptor,
    /// Byte source for the descriptor's digest.
    pub provider: Arc<dyn ContentProvider>,
}

impl std::fmt::Debug for DescriptorProviderPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorProviderPair")
            .field("descriptor", &self.descriptor)
            .field("provider", &"<dyn ContentProvider>")
            .finish()
    }
}

/// Side table mapping layer blob digests to descriptor/provider pairs.
///
/// Returned by marshalling alongside the config, and consumed read-only by
/// the parser when reassembling layer chains.
pub type DescriptorProvider = HashMap<Digest, DescriptorProviderPair>;
