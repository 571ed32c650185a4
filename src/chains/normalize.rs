//! Marshal-time normalization.
//!
//! Marshalling clones the live graph into a workspace of plain nodes, then
//! works entirely on the clone: invalid records are propagated to their
//! dependents, accidental cycles are severed, and every remaining node is
//! assigned a canonical identity so that two graphs holding the same
//! logical records marshal to byte-identical output.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use crate::digest::Digest;

use super::graph::{CacheChains, ItemResult, Link};
use super::{Error, Result};

/// Identity of a node in the workspace; identical to the arena index of
/// the item it was cloned from.
pub(super) type NodeId = usize;

/// One item, detached from the live graph.
pub(super) struct Node {
    pub(super) digest: Digest,
    pub(super) links: Vec<BTreeSet<Link>>,
    pub(super) backlinks: BTreeSet<NodeId>,
    pub(super) result: Option<ItemResult>,
    pub(super) invalid: bool,
}

/// The marshal workspace. Mutated freely; the live graph is untouched.
pub(super) struct Workspace {
    pub(super) nodes: Vec<Node>,
}

impl CacheChains {
    /// Clone every item into a workspace, holding each item's link lock
    /// only for the duration of its copy.
    pub(super) fn snapshot(&self) -> Workspace {
        let state = self.inner.state.read().unwrap();
        let nodes = state
            .items
            .iter()
            .map(|item| {
                let links = item.links.lock(&format!("marshal-{}", item.digest)).clone();
                let backlinks = item.backlinks.lock().unwrap().clone();
                let meta = item.meta.lock().unwrap();
                Node {
                    digest: item.digest.clone(),
                    links,
                    backlinks,
                    result: meta.result.clone(),
                    invalid: meta.invalid,
                }
            })
            .collect();
        Workspace { nodes }
    }
}

impl Workspace {
    /// Extend invalidity to every record that transitively depends on an
    /// invalid record, so a skipped record never leaves a dangling input.
    pub(super) fn propagate_invalid(&mut self) {
        let mut queue: Vec<NodeId> = (0..self.nodes.len())
            .filter(|&id| self.nodes[id].invalid)
            .collect();
        while let Some(id) = queue.pop() {
            let dependents: Vec<NodeId> = self.nodes[id].backlinks.iter().copied().collect();
            for dependent in dependents {
                if !self.nodes[dependent].invalid {
                    self.nodes[dependent].invalid = true;
                    queue.push(dependent);
                }
            }
        }
    }

    /// Sever every link that closes a dependency cycle.
    ///
    /// Depth-first walk over dependency links with grey/black marks: a link
    /// reaching a grey node closes a cycle and is dropped together with its
    /// backlink entry. Best effort; each severed link is logged, and a link
    /// that cannot be rescinded indicates prior corruption.
    pub(super) fn remove_loops(&mut self) {
        let mut marks = vec![Mark::White; self.nodes.len()];
        for id in 0..self.nodes.len() {
            if marks[id] == Mark::White {
                check_loops(self, &mut marks, id);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

fn check_loops(ws: &mut Workspace, marks: &mut Vec<Mark>, id: NodeId) {
    marks[id] = Mark::Grey;
    for position in 0..ws.nodes[id].links.len() {
        let links: Vec<Link> = ws.nodes[id].links[position].iter().cloned().collect();
        for link in links {
            match marks[link.src] {
                Mark::Grey => sever_link(ws, id, position, &link),
                Mark::White => check_loops(ws, marks, link.src),
                Mark::Black => {}
            }
        }
    }
    marks[id] = Mark::Black;
}

fn sever_link(ws: &mut Workspace, id: NodeId, position: usize, link: &Link) {
    let record = ws.nodes[id].digest.clone();
    let source = ws.nodes[link.src].digest.clone();
    warn!(record = %record, source = %source, "removing looping cache link");
    let removed_link = ws.nodes[id].links[position].remove(link);
    let removed_backlink = ws.nodes[link.src].backlinks.remove(&id);
    if !removed_link || !removed_backlink {
        warn!(record = %record, source = %source, "failed to remove looping cache link");
    }
}

/// A link as seen from its source: which digest links at which position
/// with which selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NLink {
    digest: Digest,
    input: usize,
    selector: String,
}

/// State shared across the normalization of all nodes.
pub(super) struct NormalizeState {
    /// Original node -> canonical node.
    added: HashMap<NodeId, NodeId>,
    /// Canonical identity -> node carrying it.
    by_key: HashMap<Digest, NodeId>,
    /// Canonical nodes in registration order.
    pub(super) canonical: Vec<NodeId>,
    /// For each canonical source, which identities reach it via which link.
    links: HashMap<NodeId, HashMap<NLink, BTreeSet<Digest>>>,
    /// Counter for synthetic identities.
    next: usize,
}

impl NormalizeState {
    pub(super) fn new() -> Self {
        Self {
            added: HashMap::new(),
            by_key: HashMap::new(),
            canonical: Vec::new(),
            links: HashMap::new(),
            next: 0,
        }
    }

    fn register(&mut self, identity: Digest, id: NodeId) {
        self.by_key.insert(identity, id);
        self.canonical.push(id);
    }
}

/// Normalize every valid node of the workspace.
pub(super) fn normalize(ws: &mut Workspace, state: &mut NormalizeState) -> Result<()> {
    for id in 0..ws.nodes.len() {
        if ws.nodes[id].invalid {
            continue;
        }
        normalize_item(id, ws, state)?;
    }
    Ok(())
}

fn normalize_item(id: NodeId, ws: &mut Workspace, state: &mut NormalizeState) -> Result<NodeId> {
    if let Some(&canonical) = state.added.get(&id) {
        return Ok(canonical);
    }

    // Base case: an item with no links is canonical under its own digest.
    if ws.nodes[id].links.is_empty() {
        let digest = ws.nodes[id].digest.clone();
        if let Some(&existing) = state.by_key.get(&digest) {
            state.added.insert(id, existing);
            return Ok(existing);
        }
        state.register(digest, id);
        state.added.insert(id, id);
        return Ok(id);
    }

    // Match search: identities already representing an equivalent
    // sub-graph. The first link initializes the candidate set; every
    // further link intersects it.
    let own_digest = ws.nodes[id].digest.clone();
    let mut matches: BTreeSet<Digest> = BTreeSet::new();
    let mut first = true;
    for input in 0..ws.nodes[id].links.len() {
        if ws.nodes[id].links[input].is_empty() {
            return Err(Error::IncompleteLinks);
        }
        let links: Vec<Link> = ws.nodes[id].links[input].iter().cloned().collect();
        for link in links {
            let src = normalize_item(link.src, ws, state)?;
            let nl = NLink {
                digest: own_digest.clone(),
                input,
                selector: link.selector.clone(),
            };
            let identities = state.links.get(&src).and_then(|m| m.get(&nl));
            if first {
                if let Some(identities) = identities {
                    matches = identities.clone();
                }
                first = false;
            } else {
                match identities {
                    Some(identities) => {
                        matches = matches.intersection(identities).cloned().collect();
                    }
                    None => matches.clear(),
                }
            }
        }
    }

    // Identity resolution: reuse the smallest matching identity, or mint a
    // synthetic one and rebuild this node's links from canonical sources.
    let original_links = ws.nodes[id].links.clone();
    let identity = match matches.iter().next() {
        Some(smallest) => smallest.clone(),
        None => {
            state.next += 1;
            let identity = Digest::from_bytes(state.next.to_string().as_bytes());
            state.register(identity.clone(), id);
            ws.nodes[id].links = vec![BTreeSet::new(); original_links.len()];
            identity
        }
    };

    let canonical = state.by_key[&identity];
    state.added.insert(id, canonical);

    for (input, set) in original_links.iter().enumerate() {
        for link in set {
            let src = normalize_item(link.src, ws, state)?;
            while ws.nodes[canonical].links.len() <= input {
                ws.nodes[canonical].links.push(BTreeSet::new());
            }
            ws.nodes[canonical].links[input].insert(Link {
                src,
                selector: link.selector.clone(),
            });
            let nl = NLink {
                digest: own_digest.clone(),
                input,
                selector: link.selector.clone(),
            };
            state
                .links
                .entry(src)
                .or_default()
                .entry(nl)
                .or_default()
                .insert(identity.clone());
        }
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::CacheChains;
    use crate::digest::Digest;

    fn dgst(s: &str) -> Digest {
        Digest::from_bytes(s.as_bytes())
    }

    fn chain(names: &[&str]) -> CacheChains {
        let cc = CacheChains::new();
        let items: Vec<_> = names.iter().map(|n| cc.add(dgst(n))).collect();
        for pair in items.windows(2) {
            pair[0].link_from(&pair[1], 0, "").unwrap();
        }
        cc
    }

    #[test]
    fn test_normalize_assigns_one_canonical_node_per_item() {
        let cc = chain(&["a", "b", "c"]);
        let mut ws = cc.snapshot();
        let mut state = NormalizeState::new();
        normalize(&mut ws, &mut state).unwrap();
        assert_eq!(state.canonical.len(), 3);
        // every node resolved, and resolved exactly once
        assert_eq!(state.added.len(), 3);
    }

    #[test]
    fn test_remove_loops_severs_cycle() {
        let cc = CacheChains::new();
        let a = cc.add(dgst("a"));
        let b = cc.add(dgst("b"));
        a.link_from(&b, 0, "").unwrap();
        b.link_from(&a, 0, "").unwrap();

        let mut ws = cc.snapshot();
        ws.remove_loops();
        let remaining: usize = ws
            .nodes
            .iter()
            .map(|n| n.links.iter().map(|s| s.len()).sum::<usize>())
            .sum();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_severed_cycle_leaves_incomplete_links() {
        let cc = CacheChains::new();
        let a = cc.add(dgst("a"));
        let b = cc.add(dgst("b"));
        a.link_from(&b, 0, "").unwrap();
        b.link_from(&a, 0, "").unwrap();

        let mut ws = cc.snapshot();
        ws.remove_loops();
        let mut state = NormalizeState::new();
        let err = normalize(&mut ws, &mut state).unwrap_err();
        assert!(matches!(err, Error::IncompleteLinks));
    }

    #[test]
    fn test_propagate_invalid_reaches_dependents() {
        let cc = chain(&["a", "b", "c"]);
        // "a" depends on "b" depends on "c"; invalidating "c" must take
        // both dependents with it
        cc.add(dgst("c")).mark_invalid();
        let mut ws = cc.snapshot();
        ws.propagate_invalid();
        assert!(ws.nodes.iter().all(|n| n.invalid));
    }

    #[test]
    fn test_propagate_invalid_spares_unrelated_records() {
        let cc = chain(&["a", "b"]);
        cc.add(dgst("lone"));
        cc.add(dgst("a")).mark_invalid();
        let mut ws = cc.snapshot();
        ws.propagate_invalid();
        // "a" is the dependent end; "b" and "lone" stay valid
        assert!(ws.nodes[0].invalid);
        assert!(!ws.nodes[1].invalid);
        assert!(!ws.nodes[2].invalid);
    }
}
