//! Schema graph: which source can answer which triple.
//!
//! Built once per refresh cycle by asking every registered source for its
//! supported `(subject, predicate, object)` triples, tolerating per-source
//! failures, then folding the successes into an immutable route index. Each
//! triple is validated against the concept taxonomy before it is admitted;
//! unresolvable triples are dropped with a recorded [`LoadError`] rather
//! than crashing the build.
//!
//! Sources are fetched concurrently but folded in descriptor order, so the
//! resulting routes are deterministic: among sources registering the same
//! triple, discovery order wins and nothing else does.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};

use trellis_model::{ConceptTaxonomy, Edge, GraphMessage, Node};

use crate::error::LoadError;
use crate::sources::SchemaDiscovery;

/// One supported question shape as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTriple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl SchemaTriple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

/// A registered knowledge source: identifier plus endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub endpoint: String,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// A validated triple annotated with the source that registered it.
/// Subject, predicate and object are stored canonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaEdge {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub source: String,
}

/// Directed multigraph over concept types, immutable after construction.
#[derive(Debug, Default, Clone)]
pub struct SchemaGraph {
    edges: Vec<SchemaEdge>,
    routes: HashMap<String, Vec<String>>,
    types: BTreeSet<String>,
}

fn route_key(subject: &str, predicate: &str, object: &str) -> String {
    format!(
        "{}|{}|{}",
        subject.to_lowercase(),
        predicate.to_lowercase(),
        object.to_lowercase()
    )
}

impl SchemaGraph {
    /// Candidate sources for an exact triple, in discovery order.
    pub fn route(&self, subject: &str, predicate: &str, object: &str) -> &[String] {
        self.routes
            .get(&route_key(subject, predicate, object))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn edges(&self) -> &[SchemaEdge] {
        &self.edges
    }

    /// Concept types appearing in any admitted triple, sorted.
    pub fn concept_types(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Render the schema itself in the universal graph shape: one node per
    /// concept type, one edge per registered triple.
    pub fn to_message(&self) -> GraphMessage {
        let nodes = self
            .types
            .iter()
            .map(|ty| Node::new(ty.clone(), "concept_type").named(ty.clone()))
            .collect();
        let edges = self
            .edges
            .iter()
            .enumerate()
            .map(|(idx, edge)| {
                Edge::new(
                    format!("schema-{idx}"),
                    edge.subject.clone(),
                    edge.object.clone(),
                    edge.predicate.clone(),
                )
                .with_attribute("source", json!(edge.source))
            })
            .collect();
        GraphMessage { nodes, edges }
    }

    fn insert(&mut self, edge: SchemaEdge) {
        let sources = self
            .routes
            .entry(route_key(&edge.subject, &edge.predicate, &edge.object))
            .or_default();
        // A source re-registering an identical triple collapses to one entry.
        if sources.iter().any(|existing| *existing == edge.source) {
            return;
        }
        sources.push(edge.source.clone());
        self.types.insert(edge.subject.clone());
        self.types.insert(edge.object.clone());
        self.edges.push(edge);
    }
}

/// Fetch every source's supported triples and assemble the schema graph.
///
/// Sources are fetched concurrently; a per-source failure contributes one
/// [`LoadError`] and the source is otherwise absent. Construction never
/// aborts wholesale.
pub async fn build_schema_graph(
    discovery: Arc<dyn SchemaDiscovery>,
    taxonomy: &ConceptTaxonomy,
    sources: &[SourceDescriptor],
) -> (SchemaGraph, Vec<LoadError>) {
    let mut fetches = JoinSet::new();
    for (idx, descriptor) in sources.iter().enumerate() {
        let discovery = Arc::clone(&discovery);
        let source = descriptor.id.clone();
        fetches.spawn(async move { (idx, discovery.fetch_supported_triples(&source).await) });
    }

    let mut slots: Vec<Option<Result<Vec<SchemaTriple>, crate::error::SchemaFetchError>>> =
        sources.iter().map(|_| None).collect();
    while let Some(joined) = fetches.join_next().await {
        match joined {
            Ok((idx, result)) => slots[idx] = Some(result),
            Err(join_error) => warn!("schema fetch task aborted: {join_error}"),
        }
    }

    let mut graph = SchemaGraph::default();
    let mut errors = Vec::new();
    for (descriptor, slot) in sources.iter().zip(slots) {
        match slot {
            Some(Ok(triples)) => {
                for triple in triples {
                    match canonicalize(taxonomy, &triple) {
                        Ok((subject, predicate, object)) => graph.insert(SchemaEdge {
                            subject,
                            predicate,
                            object,
                            source: descriptor.id.clone(),
                        }),
                        Err(reason) => {
                            warn!(source = %descriptor.id, "dropped schema triple: {reason}");
                            errors.push(LoadError::new(&descriptor.id, reason));
                        }
                    }
                }
            }
            Some(Err(error)) => {
                warn!(source = %descriptor.id, "schema fetch failed: {error}");
                errors.push(LoadError::new(&descriptor.id, error.to_string()));
            }
            None => errors.push(LoadError::new(&descriptor.id, "schema fetch aborted")),
        }
    }

    info!(
        edges = graph.len(),
        sources = sources.len(),
        errors = errors.len(),
        "schema graph built"
    );
    (graph, errors)
}

fn canonicalize(
    taxonomy: &ConceptTaxonomy,
    triple: &SchemaTriple,
) -> Result<(String, String, String), String> {
    let context = || {
        format!(
            "{} -{}-> {}",
            triple.subject, triple.predicate, triple.object
        )
    };
    let subject = taxonomy
        .resolve(&triple.subject)
        .map_err(|error| format!("{}: {error}", context()))?
        .name
        .clone();
    let predicate = taxonomy
        .resolve_relation(&triple.predicate)
        .map_err(|error| format!("{}: {error}", context()))?
        .name
        .clone();
    let object = taxonomy
        .resolve(&triple.object)
        .map_err(|error| format!("{}: {error}", context()))?
        .name
        .clone();
    Ok((subject, predicate, object))
}
