//! The universal graph message.
//!
//! One shape serves as both the remote-call result from every knowledge
//! source and the final merged query answer: a set of typed nodes and a set
//! of directed, predicate-labelled edges between them. Node ids and edge
//! ids are unique within a message; edges must reference nodes present in
//! the same message.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Name;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),
    #[error("duplicate edge id: {0}")]
    DuplicateEdgeId(String),
    #[error("edge {edge} references missing node {node}")]
    MissingEndpoint { edge: String, node: String },
}

/// An entity in a graph message.
///
/// A node carries every type asserted for it as a set; merging unions the
/// sets rather than overwriting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub types: BTreeSet<Name>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, concept_type: impl Into<Name>) -> Self {
        let mut types = BTreeSet::new();
        types.insert(concept_type.into());
        Self {
            id: id.into(),
            types,
            name: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Case-insensitive membership test against the node's type set.
    pub fn has_type(&self, concept_type: &str) -> bool {
        self.types
            .iter()
            .any(|ty| ty.eq_ignore_ascii_case(concept_type))
    }
}

/// A directed, predicate-labelled connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub predicate: Name,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        predicate: impl Into<Name>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            predicate: predicate.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// A set of nodes and edges: the unit exchanged with every knowledge source
/// and the unit produced as the final answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMessage {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn nodes_of_type<'a>(&'a self, concept_type: &'a str) -> impl Iterator<Item = &'a Node> {
        self.nodes.iter().filter(move |node| node.has_type(concept_type))
    }

    /// Check the structural invariants: unique node ids, unique edge ids,
    /// and edge endpoints present in the node set.
    pub fn validate(&self) -> Result<(), MessageError> {
        let mut node_ids = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(MessageError::DuplicateNodeId(node.id.clone()));
            }
        }
        let mut edge_ids = HashSet::with_capacity(self.edges.len());
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(MessageError::DuplicateEdgeId(edge.id.clone()));
            }
            for endpoint in [&edge.source_id, &edge.target_id] {
                if !node_ids.contains(endpoint.as_str()) {
                    return Err(MessageError::MissingEndpoint {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
