//! Typed query plans and interpreter options.
//!
//! A plan is an ordered sequence of triple-shaped steps produced by the
//! query-language front end and consumed only by the statement executor.
//! Plans are plain serde data so they travel as JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A constraint attached to one step, forwarded to the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepFilter {
    /// Bind the step's subject to one specific identifier.
    Id { value: String },
    /// Bind the step's subject by display name.
    Name { value: String },
    /// Arbitrary attribute constraint.
    Attribute { key: String, value: Value },
}

/// One triple-shaped hop: subject concept type, predicate, object concept
/// type, plus optional filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<StepFilter>,
}

impl Step {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: StepFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Ordered sequence of steps; created fresh per query, never reused.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub steps: Vec<Step>,
}

impl QueryPlan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Configuration recognized by the executor and merger for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterOptions {
    /// Dispatch independent steps concurrently instead of sequentially.
    pub asynchronous: bool,
    /// Merge nodes whose names match case-insensitively, in addition to
    /// identical ids.
    pub name_based_merging: bool,
    /// Fill in missing node names through the name-resolution collaborator.
    pub resolve_names: bool,
    /// Remap source-local node ids to canonical curies through the
    /// id-resolution collaborator.
    pub dynamic_id_resolution: bool,
    /// Upper bound on concurrently dispatched steps when `asynchronous`.
    pub fan_out_limit: usize,
    /// Overall execution deadline; on expiry the partial result is returned.
    pub timeout_ms: Option<u64>,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            asynchronous: false,
            name_based_merging: false,
            resolve_names: false,
            dynamic_id_resolution: false,
            fan_out_limit: 4,
            timeout_ms: None,
        }
    }
}

impl InterpreterOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
