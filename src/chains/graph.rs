//! Graph ownership, item handles, and link bookkeeping.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::digest::{Digest, Index};
use crate::remote::Remote;
use crate::util::ObservedMutex;

use super::{Error, Result};

/// Options for a cache graph.
#[derive(Debug, Clone)]
pub struct ChainsOptions {
    /// Whether marshalling elides the empty gzip layer sentinel. Image
    /// exporters remove empty layers; layer-store based consumers do not.
    pub empty_layer_removal_supported: bool,
}

impl Default for ChainsOptions {
    fn default() -> Self {
        Self {
            empty_layer_removal_supported: true,
        }
    }
}

/// Index of an item within its graph's arena. Stable for the lifetime of
/// the graph; links and backlinks refer to items by this index, so a link
/// target is valid exactly when its index is in range.
pub(super) type ItemId = usize;

/// A typed link: source item plus selector.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct Link {
    pub(super) src: ItemId,
    pub(super) selector: String,
}

/// A result chain and the time it was produced.
#[derive(Clone)]
pub(super) struct ItemResult {
    pub(super) created_at: DateTime<Utc>,
    pub(super) remote: Remote,
}

#[derive(Default)]
pub(super) struct ItemMeta {
    pub(super) result: Option<ItemResult>,
    pub(super) invalid: bool,
}

pub(super) struct ItemData {
    pub(super) id: ItemId,
    pub(super) digest: Digest,
    /// Link sets indexed by input position. Empty positions may exist only
    /// as holes of a still-being-built item; marshalling rejects them.
    pub(super) links: ObservedMutex<Vec<BTreeSet<Link>>>,
    /// Items that link to this one. Exact inverse of `links`, maintained
    /// under this item's own lock.
    pub(super) backlinks: Mutex<BTreeSet<ItemId>>,
    pub(super) meta: Mutex<ItemMeta>,
}

#[derive(Default)]
pub(super) struct ChainsState {
    pub(super) by_key: HashMap<Digest, ItemId>,
    pub(super) items: Vec<Arc<ItemData>>,
}

pub(super) struct ChainsInner {
    pub(super) options: ChainsOptions,
    pub(super) state: RwLock<ChainsState>,
}

/// A content-addressed graph of build-cache records.
///
/// The graph exclusively owns its items; [`Item`] handles are non-owning
/// references valid only against the graph that created them. Cloning the
/// handle shares the same graph.
#[derive(Clone)]
pub struct CacheChains {
    pub(super) inner: Arc<ChainsInner>,
}

impl CacheChains {
    /// Create an empty graph with default options.
    pub fn new() -> Self {
        Self::with_options(ChainsOptions::default())
    }

    /// Create an empty graph with the given options.
    pub fn with_options(options: ChainsOptions) -> Self {
        Self {
            inner: Arc::new(ChainsInner {
                options,
                state: RwLock::new(ChainsState::default()),
            }),
        }
    }

    /// The options this graph was created with.
    pub fn options(&self) -> &ChainsOptions {
        &self.inner.options
    }

    /// Add a record keyed by `key`.
    ///
    /// Idempotent: when an item with this digest already exists, the same
    /// item is returned.
    pub fn add(&self, key: Digest) -> Item {
        let mut state = self.inner.state.write().unwrap();
        if let Some(&id) = state.by_key.get(&key) {
            let data = Arc::clone(&state.items[id]);
            return Item {
                graph: Arc::clone(&self.inner),
                data,
            };
        }
        let id = state.items.len();
        let data = Arc::new(ItemData {
            id,
            digest: key.clone(),
            links: ObservedMutex::new(Vec::new()),
            backlinks: Mutex::new(BTreeSet::new()),
            meta: Mutex::new(ItemMeta::default()),
        });
        state.items.push(Arc::clone(&data));
        state.by_key.insert(key, id);
        Item {
            graph: Arc::clone(&self.inner),
            data,
        }
    }

    /// Number of records in the graph.
    pub fn len(&self) -> usize {
        self.inner.state.read().unwrap().items.len()
    }

    /// Whether the graph holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk every item and report any reference this graph does not own.
    ///
    /// Diagnostics only: violations are logged, nothing is repaired and
    /// nothing aborts. With the arena layout a reference is foreign exactly
    /// when its index is out of range.
    pub fn check_coherence(&self) {
        let state = self.inner.state.read().unwrap();
        let total = state.items.len();
        let mut mixed_links = 0usize;
        let mut mixed_backlinks = 0usize;
        for item in &state.items {
            {
                let links = item.links.lock(&format!("coherence-{}", item.digest));
                for set in links.iter() {
                    for link in set {
                        if link.src >= total {
                            mixed_links += 1;
                            error!(
                                digest = %item.digest,
                                source = link.src,
                                "link references an item outside this graph"
                            );
                        }
                    }
                }
            }
            for &bl in item.backlinks.lock().unwrap().iter() {
                if bl >= total {
                    mixed_backlinks += 1;
                    error!(
                        digest = %item.digest,
                        backlink = bl,
                        "backlink references an item outside this graph"
                    );
                }
            }
        }
        if mixed_links > 0 || mixed_backlinks > 0 {
            error!(
                links = mixed_links,
                backlinks = mixed_backlinks,
                items = total,
                "corrupted cache graph"
            );
        }
        info!(items = total, "cache graph coherence checked");
    }
}

impl Default for CacheChains {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to one record of a [`CacheChains`] graph.
#[derive(Clone)]
pub struct Item {
    pub(super) graph: Arc<ChainsInner>,
    pub(super) data: Arc<ItemData>,
}

impl Item {
    /// The record's cache key.
    pub fn digest(&self) -> &Digest {
        &self.data.digest
    }

    /// Link input position `input` of this record from `src`.
    ///
    /// Extends the position vector as needed. Duplicate links collapse and
    /// concurrent calls into the same position commute; the final set is
    /// the union. Fails with [`Error::ForeignItem`] when `src` is owned by
    /// a different graph.
    pub fn link_from(&self, src: &Item, input: Index, selector: &str) -> Result<()> {
        if !Arc::ptr_eq(&self.graph, &src.graph) {
            return Err(Error::ForeignItem {
                digest: src.digest().clone(),
            });
        }
        {
            let mut links = self
                .data
                .links
                .lock(&format!("link-from-{}", self.data.digest));
            while links.len() <= input {
                links.push(BTreeSet::new());
            }
            links[input].insert(Link {
                src: src.data.id,
                selector: selector.to_string(),
            });
        }
        // backlinks are updated under the source item's lock
        src.data.backlinks.lock().unwrap().insert(self.data.id);
        Ok(())
    }

    /// Set or replace this record's result chain.
    pub fn add_result(&self, created_at: DateTime<Utc>, remote: Remote) {
        let mut meta = self.data.meta.lock().unwrap();
        meta.result = Some(ItemResult { created_at, remote });
    }

    /// Exclude this record from marshalling, together with every record
    /// that needs it as an input.
    pub fn mark_invalid(&self) {
        self.data.meta.lock().unwrap().invalid = true;
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("digest", &self.data.digest)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::output_key;

    fn dgst(s: &str) -> Digest {
        Digest::from_bytes(s.as_bytes())
    }

    #[test]
    fn test_add_is_idempotent() {
        let cc = CacheChains::new();
        let key = output_key(&dgst("foo"), 0);
        let a = cc.add(key.clone());
        let b = cc.add(key.clone());
        assert_eq!(cc.len(), 1);
        assert_eq!(a.digest(), b.digest());
        assert!(Arc::ptr_eq(&a.data, &b.data));
    }

    #[test]
    fn test_link_from_foreign_item() {
        let cc = CacheChains::new();
        let other = CacheChains::new();
        let item = cc.add(dgst("item"));
        let foreign = other.add(dgst("foreign"));
        let err = item.link_from(&foreign, 0, "").unwrap_err();
        assert!(matches!(err, Error::ForeignItem { .. }));
    }

    #[test]
    fn test_link_from_maintains_backlinks() {
        let cc = CacheChains::new();
        let a = cc.add(dgst("a"));
        let b = cc.add(dgst("b"));
        a.link_from(&b, 0, "sel").unwrap();
        a.link_from(&b, 0, "sel").unwrap();

        let links = a.data.links.lock("test");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].len(), 1);
        drop(links);
        assert!(b.data.backlinks.lock().unwrap().contains(&a.data.id));
    }

    #[test]
    fn test_link_from_extends_positions() {
        let cc = CacheChains::new();
        let a = cc.add(dgst("a"));
        let b = cc.add(dgst("b"));
        a.link_from(&b, 2, "").unwrap();
        let links = a.data.links.lock("test");
        assert_eq!(links.len(), 3);
        assert!(links[0].is_empty());
        assert!(links[1].is_empty());
        assert_eq!(links[2].len(), 1);
    }

    #[test]
    fn test_check_coherence_smoke() {
        let cc = CacheChains::new();
        let a = cc.add(dgst("a"));
        let b = cc.add(dgst("b"));
        a.link_from(&b, 0, "").unwrap();
        cc.check_coherence();
    }
}
