//! Reconstructing a cache graph from its wire form.

use std::sync::Arc;

use crate::content::{DescriptorProvider, MultiProvider};
use crate::digest::Digest;
use crate::manifest::{CacheConfig, CacheLayer};
use crate::remote::Remote;

use super::graph::{CacheChains, Item};

/// Errors produced while decoding a cache config into a graph.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to decode cache config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid link index {index} in record {record}")]
    InvalidLinkIndex { record: usize, index: usize },

    #[error("record {record} references itself")]
    SelfReference { record: usize },

    #[error("looping record link at index {record}")]
    LoopingRecord { record: usize },

    #[error("invalid layer index {index}")]
    InvalidLayerIndex { index: i64 },

    #[error("invalid looping layer at index {index}")]
    LoopingLayer { index: usize },

    #[error("missing descriptor for blob {digest}")]
    MissingDescriptor { digest: Digest },

    #[error(transparent)]
    Chains(#[from] super::Error),
}

/// Decode `bytes` and add every record to `chains`.
///
/// The descriptor map is only read; reconstructed layer chains route each
/// blob fetch to the provider registered for its digest. A subsequent
/// `marshal` of the populated graph reproduces the input bytes.
pub fn parse(
    bytes: &[u8],
    descriptors: &DescriptorProvider,
    chains: &CacheChains,
) -> Result<(), ParseError> {
    let config: CacheConfig = serde_json::from_slice(bytes)?;
    parse_config(&config, descriptors, chains)
}

/// Add every record of an already-decoded config to `chains`.
pub fn parse_config(
    config: &CacheConfig,
    descriptors: &DescriptorProvider,
    chains: &CacheChains,
) -> Result<(), ParseError> {
    let mut parsed: Vec<Option<Item>> = vec![None; config.records.len()];
    let mut visiting = vec![false; config.records.len()];
    for index in 0..config.records.len() {
        parse_record(config, index, descriptors, chains, &mut parsed, &mut visiting)?;
    }
    Ok(())
}

fn parse_record(
    config: &CacheConfig,
    index: usize,
    descriptors: &DescriptorProvider,
    chains: &CacheChains,
    parsed: &mut Vec<Option<Item>>,
    visiting: &mut Vec<bool>,
) -> Result<Item, ParseError> {
    if let Some(item) = &parsed[index] {
        return Ok(item.clone());
    }
    if visiting[index] {
        return Err(ParseError::LoopingRecord { record: index });
    }
    visiting[index] = true;

    let record = &config.records[index];
    let item = chains.add(record.digest.clone());
    for (input, links) in record.inputs.iter().enumerate() {
        for link in links {
            if link.link_index == index {
                return Err(ParseError::SelfReference { record: index });
            }
            if link.link_index >= config.records.len() {
                return Err(ParseError::InvalidLinkIndex {
                    record: index,
                    index: link.link_index,
                });
            }
            let src = parse_record(config, link.link_index, descriptors, chains, parsed, visiting)?;
            item.link_from(&src, input, &link.selector)?;
        }
    }
    for result in &record.results {
        let mut visited = vec![false; config.layers.len()];
        let remote = remote_chain(&config.layers, result.layer_index, descriptors, &mut visited)?;
        item.add_result(result.created_at, remote);
    }

    visiting[index] = false;
    parsed[index] = Some(item.clone());
    Ok(item)
}

/// Reassemble the layer chain terminating at `index` by walking parent
/// links up to a root, reading descriptors from the side table.
fn remote_chain(
    layers: &[CacheLayer],
    index: usize,
    descriptors: &DescriptorProvider,
    visited: &mut Vec<bool>,
) -> Result<Remote, ParseError> {
    if index >= layers.len() {
        return Err(ParseError::InvalidLayerIndex {
            index: index as i64,
        });
    }
    if visited[index] {
        return Err(ParseError::LoopingLayer { index });
    }
    visited[index] = true;

    let layer = &layers[index];
    let pair = descriptors
        .get(&layer.blob)
        .ok_or_else(|| ParseError::MissingDescriptor {
            digest: layer.blob.clone(),
        })?;

    if layer.parent_index == -1 {
        return Ok(Remote::new(
            vec![pair.descriptor.clone()],
            Arc::clone(&pair.provider),
        ));
    }
    let parent_index = usize::try_from(layer.parent_index).map_err(|_| {
        ParseError::InvalidLayerIndex {
            index: layer.parent_index,
        }
    })?;
    let parent = remote_chain(layers, parent_index, descriptors, visited)?;
    let provider = MultiProvider::new(Some(Arc::clone(&parent.provider)));
    provider.add(pair.descriptor.digest.clone(), Arc::clone(&pair.provider));
    let mut chain = parent.descriptors;
    chain.push(pair.descriptor.clone());
    Ok(Remote::new(chain, Arc::new(provider)))
}
