//! Marshalling the normalized graph into its wire form.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::content::{DescriptorProvider, DescriptorProviderPair};
use crate::manifest::{CacheConfig, CacheInput, CacheLayer, CacheRecord, CacheResult};
use crate::remote::{Remote, EMPTY_GZ_LAYER};

use super::graph::CacheChains;
use super::normalize::{normalize, NodeId, NormalizeState, Workspace};
use super::{Error, Result};

struct MarshalState {
    layers: Vec<CacheLayer>,
    chains_by_id: HashMap<String, usize>,
    descriptors: DescriptorProvider,
    records: Vec<CacheRecord>,
    records_by_item: HashMap<NodeId, usize>,
    empty_layer_removal: bool,
}

impl CacheChains {
    /// Marshal the graph into its canonical wire form plus the descriptor
    /// side table.
    ///
    /// The graph is cloned into a workspace first; callers may keep adding
    /// records afterwards, and each marshal reflects the state at its own
    /// snapshot. Fails with [`Error::IncompleteLinks`] when any record has
    /// a populated input position with no links, which is also how a
    /// severed cycle surfaces.
    pub fn marshal(&self) -> Result<(CacheConfig, DescriptorProvider)> {
        let mut ws = self.snapshot();
        ws.propagate_invalid();
        ws.remove_loops();

        let mut norm = NormalizeState::new();
        normalize(&mut ws, &mut norm)?;

        let mut state = MarshalState {
            layers: Vec::new(),
            chains_by_id: HashMap::new(),
            descriptors: DescriptorProvider::new(),
            records: Vec::new(),
            records_by_item: HashMap::new(),
            empty_layer_removal: self.options().empty_layer_removal_supported,
        };
        for &id in &norm.canonical {
            marshal_item(id, &ws, &mut state)?;
        }

        let mut config = CacheConfig {
            layers: state.layers,
            records: state.records,
        };
        sort_config(&mut config);
        debug!(
            layers = config.layers.len(),
            records = config.records.len(),
            "marshalled cache config"
        );
        Ok((config, state.descriptors))
    }
}

/// Register the first `upto` descriptors of `remote` as layers, returning
/// the chain id of the deepest registered descriptor.
///
/// The chain id is the concatenation of the descriptor's digest and its
/// parent's chain id, so identical chains registered through different
/// records collapse onto one layer row. The empty gzip sentinel is skipped
/// when elision is enabled; the call then answers with the parent's id.
fn marshal_remote(remote: &Remote, upto: usize, state: &mut MarshalState) -> Result<String> {
    if upto == 0 {
        return Ok(String::new());
    }
    let parent_id = marshal_remote(remote, upto - 1, state)?;
    let descriptor = &remote.descriptors[upto - 1];

    if descriptor.digest.as_str() == EMPTY_GZ_LAYER && state.empty_layer_removal {
        return Ok(parent_id);
    }

    state.descriptors.insert(
        descriptor.digest.clone(),
        DescriptorProviderPair {
            descriptor: descriptor.clone(),
            provider: Arc::clone(&remote.provider),
        },
    );

    let id = format!("{}{}", descriptor.digest, parent_id);
    if state.chains_by_id.contains_key(&id) {
        return Ok(id);
    }

    let parent_index = if parent_id.is_empty() {
        -1
    } else {
        match state.chains_by_id.get(&parent_id) {
            Some(&index) => index as i64,
            None => return Err(Error::MissingParentChain),
        }
    };
    state.chains_by_id.insert(id.clone(), state.layers.len());
    state.layers.push(CacheLayer {
        blob: descriptor.digest.clone(),
        parent_index,
    });
    Ok(id)
}

/// Emit the record for `id`, recursing so every source is assigned its
/// record index first.
fn marshal_item(id: NodeId, ws: &Workspace, state: &mut MarshalState) -> Result<()> {
    if state.records_by_item.contains_key(&id) {
        return Ok(());
    }

    let node = &ws.nodes[id];
    let mut inputs: Vec<Vec<CacheInput>> = Vec::with_capacity(node.links.len());
    for set in &node.links {
        let mut position = Vec::with_capacity(set.len());
        for link in set {
            marshal_item(link.src, ws, state)?;
            let index = match state.records_by_item.get(&link.src) {
                Some(&index) => index,
                None => {
                    return Err(Error::MissingSourceRecord {
                        digest: ws.nodes[link.src].digest.clone(),
                    })
                }
            };
            position.push(CacheInput {
                selector: link.selector.clone(),
                link_index: index,
            });
        }
        inputs.push(position);
    }

    let mut results = Vec::new();
    if let Some(result) = &node.result {
        let chain_id = marshal_remote(&result.remote, result.remote.descriptors.len(), state)?;
        if !chain_id.is_empty() {
            let layer_index = state
                .chains_by_id
                .get(&chain_id)
                .copied()
                .ok_or(Error::MissingParentChain)?;
            results.push(CacheResult {
                layer_index,
                created_at: result.created_at,
            });
        }
    }

    state.records_by_item.insert(id, state.records.len());
    state.records.push(CacheRecord {
        digest: node.digest.clone(),
        inputs,
        results,
    });
    Ok(())
}

/// Reorder the config for determinism.
///
/// Layers sort by `(Blob, ParentIndex)`, records by the comparator below;
/// every index is then rewritten through the old-to-new maps, and each
/// input position is finally sorted by its rewritten link index.
fn sort_config(config: &mut CacheConfig) {
    let mut sorted_layers: Vec<usize> = (0..config.layers.len()).collect();
    sorted_layers.sort_by(|&a, &b| {
        let la = &config.layers[a];
        let lb = &config.layers[b];
        la.blob
            .cmp(&lb.blob)
            .then(la.parent_index.cmp(&lb.parent_index))
    });
    let mut layer_index = vec![0usize; sorted_layers.len()];
    for (new, &old) in sorted_layers.iter().enumerate() {
        layer_index[old] = new;
    }
    let layers: Vec<CacheLayer> = sorted_layers
        .iter()
        .map(|&old| {
            let mut layer = config.layers[old].clone();
            if layer.parent_index != -1 {
                layer.parent_index = layer_index[layer.parent_index as usize] as i64;
            }
            layer
        })
        .collect();

    let mut sorted_records: Vec<usize> = (0..config.records.len()).collect();
    sorted_records.sort_by(|&a, &b| compare_records(&config.records, a, b));
    let mut record_index = vec![0usize; sorted_records.len()];
    for (new, &old) in sorted_records.iter().enumerate() {
        record_index[old] = new;
    }
    let records: Vec<CacheRecord> = sorted_records
        .iter()
        .map(|&old| {
            let mut record = config.records[old].clone();
            for result in &mut record.results {
                result.layer_index = layer_index[result.layer_index];
            }
            for inputs in &mut record.inputs {
                for input in inputs.iter_mut() {
                    input.link_index = record_index[input.link_index];
                }
                inputs.sort_by_key(|input| input.link_index);
            }
            record
        })
        .collect();

    config.layers = layers;
    config.records = records;
}

/// Record comparator: digest, then input arity, then per-position size,
/// selector, and the digest of each link's source record. Tie-breakers
/// read the pre-rewrite indices.
fn compare_records(records: &[CacheRecord], a: usize, b: usize) -> Ordering {
    let ra = &records[a];
    let rb = &records[b];
    let ordering = ra
        .digest
        .cmp(&rb.digest)
        .then(ra.inputs.len().cmp(&rb.inputs.len()));
    if ordering != Ordering::Equal {
        return ordering;
    }
    for (ia, ib) in ra.inputs.iter().zip(&rb.inputs) {
        let ordering = ia.len().cmp(&ib.len());
        if ordering != Ordering::Equal {
            return ordering;
        }
        for (la, lb) in ia.iter().zip(ib) {
            let ordering = la
                .selector
                .cmp(&lb.selector)
                .then_with(|| records[la.link_index].digest.cmp(&records[lb.link_index].digest));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::{ChainsOptions, Error};
    use crate::content::MemoryContentStore;
    use crate::digest::{output_key, Digest};
    use crate::remote::Descriptor;
    use chrono::{DateTime, TimeZone, Utc};

    fn dgst(s: &str) -> Digest {
        Digest::from_bytes(s.as_bytes())
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    fn remote(names: &[&str]) -> Remote {
        let descriptors = names
            .iter()
            .map(|n| {
                Descriptor::new(
                    dgst(n),
                    "application/vnd.oci.image.layer.v1.tar+gzip",
                    0,
                )
            })
            .collect();
        Remote::new(descriptors, Arc::new(MemoryContentStore::new()))
    }

    fn add_records(cc: &CacheChains) {
        let foo = cc.add(output_key(&dgst("foo"), 0));
        let bar = cc.add(output_key(&dgst("bar"), 1));
        let baz = cc.add(output_key(&dgst("baz"), 0));

        baz.link_from(&foo, 0, "").unwrap();
        baz.link_from(&bar, 1, "sel0").unwrap();
        baz.add_result(ts(), remote(&["d0", "d1"]));
    }

    #[test]
    fn test_simple_marshal() {
        let cc = CacheChains::new();
        add_records(&cc);

        let (config, descriptors) = cc.marshal().unwrap();

        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.records.len(), 3);

        assert_eq!(config.layers[0].blob, dgst("d0"));
        assert_eq!(config.layers[0].parent_index, -1);
        assert_eq!(config.layers[1].blob, dgst("d1"));
        assert_eq!(config.layers[1].parent_index, 0);

        assert_eq!(config.records[0].digest, output_key(&dgst("baz"), 0));
        assert_eq!(config.records[0].inputs.len(), 2);
        assert_eq!(config.records[0].results.len(), 1);

        assert_eq!(config.records[1].digest, output_key(&dgst("foo"), 0));
        assert_eq!(config.records[1].inputs.len(), 0);
        assert_eq!(config.records[1].results.len(), 0);

        assert_eq!(config.records[2].digest, output_key(&dgst("bar"), 1));
        assert_eq!(config.records[2].inputs.len(), 0);
        assert_eq!(config.records[2].results.len(), 0);

        assert_eq!(config.records[0].results[0].layer_index, 1);
        assert_eq!(config.records[0].inputs[0][0].selector, "");
        assert_eq!(config.records[0].inputs[0][0].link_index, 1);
        assert_eq!(config.records[0].inputs[1][0].selector, "sel0");
        assert_eq!(config.records[0].inputs[1][0].link_index, 2);

        assert_eq!(descriptors.len(), 2);
        assert!(descriptors.contains_key(&dgst("d0")));
        assert!(descriptors.contains_key(&dgst("d1")));
    }

    #[test]
    fn test_marshal_fixpoint_under_readd() {
        let cc = CacheChains::new();
        add_records(&cc);
        let (config, _) = cc.marshal().unwrap();

        // adding the same records again produces nothing extra
        add_records(&cc);
        let (config2, _) = cc.marshal().unwrap();
        assert_eq!(config, config2);
        assert_eq!(
            serde_json::to_vec(&config).unwrap(),
            serde_json::to_vec(&config2).unwrap()
        );
    }

    #[test]
    fn test_extra_disjoint_record() {
        let cc = CacheChains::new();
        add_records(&cc);
        cc.add(output_key(&dgst("bay"), 0));

        let (config, _) = cc.marshal().unwrap();
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.records.len(), 4);
    }

    #[test]
    fn test_incomplete_links_rejected() {
        let cc = CacheChains::new();
        let items: Vec<_> = (1..=17).map(|i| cc.add(dgst(&format!("l{i}")))).collect();
        for pair in items.windows(2) {
            pair[0].link_from(&pair[1], 0, "").unwrap();
        }
        // a second head over l16 whose own linking closes a cycle back to
        // the bottom of the chain
        let head = cc.add(dgst("l17b"));
        items[15].link_from(&head, 0, "").unwrap();
        head.link_from(&items[0], 0, "").unwrap();
        items[0].add_result(ts(), remote(&["d0", "d1"]));

        let err = cc.marshal().unwrap_err();
        assert!(matches!(err, Error::IncompleteLinks));
    }

    #[test]
    fn test_determinism_under_link_order() {
        let build = |flipped: bool| {
            let cc = CacheChains::new();
            let foo = cc.add(output_key(&dgst("foo"), 0));
            let bar = cc.add(output_key(&dgst("bar"), 1));
            let baz = cc.add(output_key(&dgst("baz"), 0));
            if flipped {
                baz.link_from(&bar, 1, "sel0").unwrap();
                baz.link_from(&foo, 0, "").unwrap();
            } else {
                baz.link_from(&foo, 0, "").unwrap();
                baz.link_from(&bar, 1, "sel0").unwrap();
            }
            baz.add_result(ts(), remote(&["d0", "d1"]));
            let (config, _) = cc.marshal().unwrap();
            serde_json::to_vec(&config).unwrap()
        };
        assert_eq!(build(false), build(true));
    }

    #[test]
    fn test_isolated_records_marshal_sorted() {
        let cc = CacheChains::new();
        cc.add(output_key(&dgst("foo"), 0));
        cc.add(output_key(&dgst("baz"), 0));
        cc.add(output_key(&dgst("bar"), 1));

        let (config, descriptors) = cc.marshal().unwrap();
        assert!(config.layers.is_empty());
        assert!(descriptors.is_empty());
        assert_eq!(config.records.len(), 3);
        for pair in config.records.windows(2) {
            assert!(pair[0].digest < pair[1].digest);
        }
    }

    #[test]
    fn test_empty_layer_elision() {
        let cc = CacheChains::new();
        let item = cc.add(output_key(&dgst("foo"), 0));
        let sentinel = Descriptor::new(
            Digest::parse(EMPTY_GZ_LAYER).unwrap(),
            "application/vnd.oci.image.layer.v1.tar+gzip",
            0,
        );
        item.add_result(
            ts(),
            Remote::new(vec![sentinel], Arc::new(MemoryContentStore::new())),
        );

        let (config, _) = cc.marshal().unwrap();
        assert!(config.layers.is_empty());
        assert_eq!(config.records.len(), 1);
        assert!(config.records[0].results.is_empty());
    }

    #[test]
    fn test_empty_layer_kept_without_removal_support() {
        let cc = CacheChains::with_options(ChainsOptions {
            empty_layer_removal_supported: false,
        });
        let item = cc.add(output_key(&dgst("foo"), 0));
        let sentinel = Descriptor::new(
            Digest::parse(EMPTY_GZ_LAYER).unwrap(),
            "application/vnd.oci.image.layer.v1.tar+gzip",
            0,
        );
        item.add_result(
            ts(),
            Remote::new(vec![sentinel], Arc::new(MemoryContentStore::new())),
        );

        let (config, _) = cc.marshal().unwrap();
        assert_eq!(config.layers.len(), 1);
        assert_eq!(config.layers[0].blob.as_str(), EMPTY_GZ_LAYER);
        assert_eq!(config.records[0].results.len(), 1);
    }

    #[test]
    fn test_elision_inside_chain_reparents_children() {
        let cc = CacheChains::new();
        let item = cc.add(output_key(&dgst("foo"), 0));
        let mut r = remote(&["d0", "d1"]);
        r.descriptors.insert(
            1,
            Descriptor::new(
                Digest::parse(EMPTY_GZ_LAYER).unwrap(),
                "application/vnd.oci.image.layer.v1.tar+gzip",
                0,
            ),
        );
        item.add_result(ts(), r);

        let (config, _) = cc.marshal().unwrap();
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.layers[0].blob, dgst("d0"));
        assert_eq!(config.layers[0].parent_index, -1);
        assert_eq!(config.layers[1].blob, dgst("d1"));
        assert_eq!(config.layers[1].parent_index, 0);
    }

    #[test]
    fn test_invalid_record_excluded_with_dependents() {
        let cc = CacheChains::new();
        add_records(&cc);
        // baz links from foo; invalidating foo takes baz (and its result)
        // with it, leaving only bar
        cc.add(output_key(&dgst("foo"), 0)).mark_invalid();

        let (config, _) = cc.marshal().unwrap();
        assert!(config.layers.is_empty());
        assert_eq!(config.records.len(), 1);
        assert_eq!(config.records[0].digest, output_key(&dgst("bar"), 1));
    }

    #[test]
    fn test_shared_chain_prefix_collapses_layers() {
        let cc = CacheChains::new();
        let a = cc.add(output_key(&dgst("a"), 0));
        let b = cc.add(output_key(&dgst("b"), 0));
        a.add_result(ts(), remote(&["d0", "d1"]));
        b.add_result(ts(), remote(&["d0"]));

        let (config, _) = cc.marshal().unwrap();
        // the shared d0 chain registers once
        assert_eq!(config.layers.len(), 2);
    }
}
