//! In-memory content store for tests and small exports.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;

use crate::digest::Digest;
use crate::remote::Descriptor;

use super::{ByteStream, ContentError, ContentProvider, Ingester, Result};

/// An in-memory [`ContentProvider`] and [`Ingester`].
///
/// Blobs live in a map keyed by digest. Useful as the byte source behind
/// test chains and as the sink of small exports.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<Digest, (Descriptor, Bytes)>>,
}

impl MemoryContentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blob, deriving its descriptor from the raw bytes.
    pub fn add_blob(&self, media_type: &str, data: impl Into<Bytes>) -> Descriptor {
        let data = data.into();
        let digest = Digest::from_bytes(&data);
        let descriptor = Descriptor::new(digest.clone(), media_type, data.len() as i64);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest, (descriptor.clone(), data));
        descriptor
    }

    /// Whether a blob with the given digest is stored.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.lock().unwrap().contains_key(digest)
    }

    /// Read a stored blob's bytes.
    pub fn get(&self, digest: &Digest) -> Option<Bytes> {
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .map(|(_, data)| data.clone())
    }

    /// Read a stored blob's descriptor.
    pub fn descriptor(&self, digest: &Digest) -> Option<Descriptor> {
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .map(|(descriptor, _)| descriptor.clone())
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentProvider for MemoryContentStore {
    async fn fetch(&self, digest: &Digest) -> Result<ByteStream> {
        let data = self
            .get(digest)
            .ok_or_else(|| ContentError::NotFound(digest.clone()))?;
        Ok(Box::pin(stream::iter([Ok::<Bytes, ContentError>(data)])))
    }
}

#[async_trait]
impl Ingester for MemoryContentStore {
    async fn write_blob(
        &self,
        digest: &Digest,
        data: Bytes,
        descriptor: &Descriptor,
    ) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), (descriptor.clone(), data));
        Ok(())
    }
}
