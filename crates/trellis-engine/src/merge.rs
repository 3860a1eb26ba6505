//! Merge independently fetched graph messages into one.
//!
//! Node identity is the id; the `name_based` rule widens it to
//! case-insensitive name matches. A node that links two previously separate
//! groups (one by id, one by name) collapses them into a single entity, so
//! the final node set does not depend on input order. Input order decides
//! only two things: which duplicate's attributes win a conflict (last seen)
//! and which id survives (first seen). The merged node unions its type set
//! and keeps its first non-empty name.
//!
//! Edges deduplicate on `(merged source id, merged target id, predicate)`
//! after node remapping; duplicates union their attributes.
//!
//! The merge is deterministic, commutative over message order for the final
//! node/edge sets, associative, and idempotent.

use std::collections::{HashMap, HashSet};

use trellis_model::{Edge, GraphMessage, Node};

use crate::plan::InterpreterOptions;

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageMerger {
    name_based: bool,
}

impl MessageMerger {
    pub fn new(name_based: bool) -> Self {
        Self { name_based }
    }

    pub fn from_options(options: &InterpreterOptions) -> Self {
        Self::new(options.name_based_merging)
    }

    /// Union `messages` into one message under the configured identity rule.
    pub fn merge(&self, messages: &[GraphMessage]) -> GraphMessage {
        let mut groups = NodeGroups::default();
        for message in messages {
            for node in &message.nodes {
                groups.absorb(node, self.name_based);
            }
        }

        let mut edges: Vec<Edge> = Vec::new();
        let mut edge_index: HashMap<(String, String, String), usize> = HashMap::new();
        let mut used_edge_ids: HashSet<String> = HashSet::new();
        for message in messages {
            for edge in &message.edges {
                let source_id = groups
                    .canonical_id(&edge.source_id)
                    .unwrap_or_else(|| edge.source_id.clone());
                let target_id = groups
                    .canonical_id(&edge.target_id)
                    .unwrap_or_else(|| edge.target_id.clone());
                let key = (source_id.clone(), target_id.clone(), edge.predicate.clone());
                match edge_index.get(&key) {
                    Some(&idx) => {
                        let kept = &mut edges[idx];
                        for (attr, value) in &edge.attributes {
                            kept.attributes.insert(attr.clone(), value.clone());
                        }
                    }
                    None => {
                        let id = claim_edge_id(&mut used_edge_ids, &edge.id);
                        edge_index.insert(key, edges.len());
                        edges.push(Edge {
                            id,
                            source_id,
                            target_id,
                            predicate: edge.predicate.clone(),
                            attributes: edge.attributes.clone(),
                        });
                    }
                }
            }
        }

        GraphMessage {
            nodes: groups.into_nodes(),
            edges,
        }
    }
}

/// Pick the incoming edge's id, or a deterministic `-N` suffix when a
/// distinct edge already claimed it.
fn claim_edge_id(used: &mut HashSet<String>, id: &str) -> String {
    if used.insert(id.to_string()) {
        return id.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{id}-{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Union-find over merged node groups, in first-seen order.
#[derive(Default)]
struct NodeGroups {
    /// Group storage; `None` once a group has been folded into an earlier one.
    nodes: Vec<Option<Node>>,
    parent: Vec<usize>,
    /// Every id ever seen -> the group it joined.
    by_id: HashMap<String, usize>,
    /// Lowercased name -> the group that first claimed it (name-based only).
    by_name: HashMap<String, usize>,
}

impl NodeGroups {
    fn find(&self, mut group: usize) -> usize {
        while self.parent[group] != group {
            group = self.parent[group];
        }
        group
    }

    /// Collapse two groups; the earlier-seen group survives and keeps its id.
    fn union(&mut self, a: usize, b: usize) -> usize {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return root_a;
        }
        let (keep, fold) = if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        self.parent[fold] = keep;
        if let Some(folded) = self.nodes[fold].take() {
            if let Some(target) = self.nodes[keep].as_mut() {
                target.types.extend(folded.types);
                if target.name.is_none() {
                    target.name = folded.name;
                }
                // The folded group was created later; it wins attribute conflicts.
                target.attributes.extend(folded.attributes);
            }
        }
        keep
    }

    fn absorb(&mut self, node: &Node, name_based: bool) {
        let id_group = self.by_id.get(&node.id).copied().map(|g| self.find(g));
        let name_key = node.name.as_ref().map(|name| name.to_lowercase());
        let name_group = if name_based {
            name_key
                .as_ref()
                .and_then(|key| self.by_name.get(key).copied())
                .map(|g| self.find(g))
        } else {
            None
        };

        let group = match (id_group, name_group) {
            (Some(a), Some(b)) => self.union(a, b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                let idx = self.nodes.len();
                self.nodes.push(Some(Node {
                    id: node.id.clone(),
                    types: Default::default(),
                    name: None,
                    attributes: Default::default(),
                }));
                self.parent.push(idx);
                idx
            }
        };

        if let Some(target) = self.nodes[group].as_mut() {
            target.types.extend(node.types.iter().cloned());
            if target.name.is_none() {
                target.name = node.name.clone();
            }
            for (attr, value) in &node.attributes {
                target.attributes.insert(attr.clone(), value.clone());
            }
        }

        self.by_id.entry(node.id.clone()).or_insert(group);
        if name_based {
            if let Some(key) = name_key {
                self.by_name.entry(key).or_insert(group);
            }
        }
    }

    /// The surviving id for any id seen during the merge.
    fn canonical_id(&self, id: &str) -> Option<String> {
        let group = self.find(*self.by_id.get(id)?);
        self.nodes[group].as_ref().map(|node| node.id.clone())
    }

    fn into_nodes(self) -> Vec<Node> {
        self.nodes.into_iter().flatten().collect()
    }
}
