//! Error taxonomy for schema construction and query execution.
//!
//! Almost everything that can go wrong during a federated query is
//! *reported*, not thrown: per-step and per-source failures accumulate, in
//! order, next to whatever partial result exists, and the caller always gets
//! both. The only class that aborts an execution outright is [`PlanError`]:
//! structural problems with the plan itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed enumeration of non-fatal failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A query term matched no concept type or synonym.
    UnknownConcept,
    /// A query term matched no relation type or synonym.
    UnknownRelation,
    /// No source registered a triple that can answer a step.
    NoRoute,
    /// One remote call failed: timeout, transport, remote status, or a
    /// malformed payload.
    SourceInvocation,
    /// Every candidate source for a step failed, or the step was skipped
    /// because its upstream step produced no data.
    StepExhausted,
    /// The name-resolution collaborator could not fill in a node name.
    /// Warning severity.
    NameResolution,
    /// The id-resolution collaborator could not canonicalize a node id.
    /// Warning severity.
    IdResolution,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownConcept => "unknown_concept",
            ErrorKind::UnknownRelation => "unknown_relation",
            ErrorKind::NoRoute => "no_route",
            ErrorKind::SourceInvocation => "source_invocation",
            ErrorKind::StepExhausted => "step_exhausted",
            ErrorKind::NameResolution => "name_resolution",
            ErrorKind::IdResolution => "id_resolution",
        }
    }
}

/// One reported, non-fatal failure: a uniform `{kind, message, details}`
/// record appended to the execution context instead of being thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Resolver failures degrade the answer without failing any step.
    pub fn is_warning(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NameResolution | ErrorKind::IdResolution
        )
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// Structural problems with the plan itself: the only errors that abort a
/// whole execution instead of being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("query plan contains no steps")]
    EmptyPlan,
    #[error("first step cannot be resolved: {reason}")]
    FirstStepUnresolved { reason: String },
}

/// A per-source failure recorded while building the schema graph.
/// Construction proceeds; the failed source is simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadError {
    pub source: String,
    pub message: String,
}

impl LoadError {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.message)
    }
}

/// A remote knowledge-source call failed. Timeout, transport error, remote
/// error status and malformed payloads all surface as this one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInvocationError {
    pub source: String,
    pub message: String,
}

impl SourceInvocationError {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SourceInvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source {}: {}", self.source, self.message)
    }
}

impl std::error::Error for SourceInvocationError {}

/// A source failed to report its supported triples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaFetchError {
    pub source: String,
    pub message: String,
}

impl SchemaFetchError {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema fetch from {} failed: {}", self.source, self.message)
    }
}

impl std::error::Error for SchemaFetchError {}

/// A name- or id-resolution collaborator call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ResolverError(pub String);
