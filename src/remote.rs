//! Layer descriptor chains referencing registry content.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::content::ContentProvider;
use crate::digest::Digest;

/// Digest of the empty gzip layer.
///
/// Exporters that support empty-layer removal elide this blob from
/// marshalled layer chains; layer-store based consumers keep it.
pub const EMPTY_GZ_LAYER: &str =
    "sha256:4f4fb700ef54461cfa02571ae0db9a0dc1e0cdb5577484a6d75e68dc38e8acc1";

/// An OCI content descriptor: digest, size, and media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size of the referenced content in bytes.
    pub size: i64,
    /// Optional descriptor annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Create a descriptor with no annotations.
    pub fn new(digest: Digest, media_type: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: None,
        }
    }
}

/// An ordered chain of layer descriptors plus the provider that can fetch
/// their bytes.
///
/// The ordering encodes the parent relation: index `k` is the child of
/// index `k - 1`.
#[derive(Clone)]
pub struct Remote {
    /// The descriptor chain, parents first.
    pub descriptors: Vec<Descriptor>,
    /// Byte source for every descriptor in the chain.
    pub provider: Arc<dyn ContentProvider>,
}

impl Remote {
    /// Create a descriptor chain backed by `provider`.
    pub fn new(descriptors: Vec<Descriptor>, provider: Arc<dyn ContentProvider>) -> Self {
        Self {
            descriptors,
            provider,
        }
    }

    /// Whether this chain is a prefix of `main`.
    pub fn is_sub_chain_of(&self, main: &Remote) -> bool {
        if self.descriptors.len() > main.descriptors.len() {
            return false;
        }
        self.descriptors
            .iter()
            .zip(&main.descriptors)
            .all(|(a, b)| a.digest == b.digest)
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}
