//! Collaborator seams: how the engine talks to the outside world.
//!
//! Four narrow async traits cover every remote dependency of the core:
//! source invocation, schema discovery, name resolution and id resolution.
//! [`BackplaneClient`] implements all four against a live backplane over
//! HTTP; [`MockBackplane`] scripts them in memory for tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use trellis_model::GraphMessage;

use crate::error::{ResolverError, SchemaFetchError, SourceInvocationError};
use crate::plan::StepFilter;
use crate::schema::SchemaTriple;

/// One triple-shaped question posed to a knowledge source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleQuestion {
    pub subject_type: String,
    pub predicate: String,
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<StepFilter>,
    /// Node ids bound by an upstream step; empty for root steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bound_ids: Vec<String>,
}

impl TripleQuestion {
    pub fn new(
        subject_type: impl Into<String>,
        predicate: impl Into<String>,
        object_type: impl Into<String>,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            predicate: predicate.into(),
            object_type: object_type.into(),
            filters: Vec::new(),
            bound_ids: Vec::new(),
        }
    }
}

/// Asks one knowledge source a triple-shaped question.
#[async_trait]
pub trait SourceInvoker: Send + Sync {
    async fn invoke(
        &self,
        source: &str,
        question: &TripleQuestion,
    ) -> Result<GraphMessage, SourceInvocationError>;
}

/// Asks one knowledge source which triples it can answer.
#[async_trait]
pub trait SchemaDiscovery: Send + Sync {
    async fn fetch_supported_triples(
        &self,
        source: &str,
    ) -> Result<Vec<SchemaTriple>, SchemaFetchError>;
}

/// Looks up display names for identifiers. Consulted only when the
/// `resolve_names` interpreter option is set.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve_name(&self, text: &str) -> Result<Vec<String>, ResolverError>;
}

/// Remaps ambiguous or source-local identifiers to canonical curies.
/// Consulted only when the `dynamic_id_resolution` interpreter option is set.
#[async_trait]
pub trait IdResolver: Send + Sync {
    async fn resolve_id(&self, raw_id: &str, type_hint: &str) -> Result<String, ResolverError>;
}

// ============================================================================
// HTTP backplane client
// ============================================================================

/// Reqwest-backed client for the coordinating backplane service.
///
/// Routes:
/// - `POST {base}/query/{source}` with a [`TripleQuestion`] body, returning
///   a [`GraphMessage`]
/// - `GET  {base}/schema/{source}`, returning a list of [`SchemaTriple`]s
/// - `GET  {base}/resolve/name?text=...`, returning candidate identifiers
/// - `GET  {base}/resolve/id?id=...&type=...`, returning one canonical curie
#[derive(Debug, Clone)]
pub struct BackplaneClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackplaneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Build with a per-request timeout on every backplane call.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn describe(error: &reqwest::Error) -> String {
        if error.is_timeout() {
            "request timed out".to_string()
        } else if error.is_connect() {
            format!("connection failed: {error}")
        } else {
            error.to_string()
        }
    }
}

#[async_trait]
impl SourceInvoker for BackplaneClient {
    async fn invoke(
        &self,
        source: &str,
        question: &TripleQuestion,
    ) -> Result<GraphMessage, SourceInvocationError> {
        let url = format!("{}/query/{}", self.base_url, source);
        let response = self
            .client
            .post(&url)
            .json(question)
            .send()
            .await
            .map_err(|error| SourceInvocationError::new(source, Self::describe(&error)))?
            .error_for_status()
            .map_err(|error| {
                SourceInvocationError::new(source, format!("remote error status: {error}"))
            })?;
        response.json::<GraphMessage>().await.map_err(|error| {
            SourceInvocationError::new(source, format!("malformed payload: {error}"))
        })
    }
}

#[async_trait]
impl SchemaDiscovery for BackplaneClient {
    async fn fetch_supported_triples(
        &self,
        source: &str,
    ) -> Result<Vec<SchemaTriple>, SchemaFetchError> {
        let url = format!("{}/schema/{}", self.base_url, source);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| SchemaFetchError::new(source, Self::describe(&error)))?
            .error_for_status()
            .map_err(|error| {
                SchemaFetchError::new(source, format!("remote error status: {error}"))
            })?;
        response.json::<Vec<SchemaTriple>>().await.map_err(|error| {
            SchemaFetchError::new(source, format!("malformed payload: {error}"))
        })
    }
}

#[async_trait]
impl NameResolver for BackplaneClient {
    async fn resolve_name(&self, text: &str) -> Result<Vec<String>, ResolverError> {
        let url = format!("{}/resolve/name", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("text", text)])
            .send()
            .await
            .map_err(|error| ResolverError(Self::describe(&error)))?
            .error_for_status()
            .map_err(|error| ResolverError(error.to_string()))?;
        response
            .json::<Vec<String>>()
            .await
            .map_err(|error| ResolverError(format!("malformed payload: {error}")))
    }
}

#[async_trait]
impl IdResolver for BackplaneClient {
    async fn resolve_id(&self, raw_id: &str, type_hint: &str) -> Result<String, ResolverError> {
        let url = format!("{}/resolve/id", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("id", raw_id), ("type", type_hint)])
            .send()
            .await
            .map_err(|error| ResolverError(Self::describe(&error)))?
            .error_for_status()
            .map_err(|error| ResolverError(error.to_string()))?;
        response
            .json::<String>()
            .await
            .map_err(|error| ResolverError(format!("malformed payload: {error}")))
    }
}

// ============================================================================
// Mock backplane for testing
// ============================================================================

/// Scriptable in-memory backplane.
///
/// Register triples and canned answers per source, inject schema-fetch or
/// invocation failures, and inspect the recorded invocation order afterward.
#[derive(Default)]
pub struct MockBackplane {
    triples: HashMap<String, Vec<SchemaTriple>>,
    answers: HashMap<(String, String), GraphMessage>,
    failing_schemas: HashMap<String, String>,
    failing_invocations: HashSet<String>,
    names: HashMap<String, Vec<String>>,
    curies: HashMap<String, String>,
    invocations: Mutex<Vec<(String, TripleQuestion)>>,
}

impl MockBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn triple_key(subject: &str, predicate: &str, object: &str) -> String {
        format!(
            "{}|{}|{}",
            subject.to_lowercase(),
            predicate.to_lowercase(),
            object.to_lowercase()
        )
    }

    /// Register a supported triple; the source answers it with an empty
    /// message unless [`answer_with`](Self::answer_with) scripts one.
    pub fn register_triple(&mut self, source: &str, subject: &str, predicate: &str, object: &str) {
        self.triples
            .entry(source.to_string())
            .or_default()
            .push(SchemaTriple::new(subject, predicate, object));
    }

    pub fn answer_with(
        &mut self,
        source: &str,
        subject: &str,
        predicate: &str,
        object: &str,
        message: GraphMessage,
    ) {
        self.answers.insert(
            (
                source.to_string(),
                Self::triple_key(subject, predicate, object),
            ),
            message,
        );
    }

    pub fn fail_schema(&mut self, source: &str, message: &str) {
        self.failing_schemas
            .insert(source.to_string(), message.to_string());
    }

    pub fn fail_invocation(&mut self, source: &str) {
        self.failing_invocations.insert(source.to_string());
    }

    pub fn resolve_name_to(&mut self, text: &str, candidates: Vec<String>) {
        self.names.insert(text.to_string(), candidates);
    }

    pub fn resolve_id_to(&mut self, raw_id: &str, curie: &str) {
        self.curies.insert(raw_id.to_string(), curie.to_string());
    }

    /// Invocations recorded so far, in call order.
    pub fn invocations(&self) -> Vec<(String, TripleQuestion)> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl SourceInvoker for MockBackplane {
    async fn invoke(
        &self,
        source: &str,
        question: &TripleQuestion,
    ) -> Result<GraphMessage, SourceInvocationError> {
        self.invocations
            .lock()
            .push((source.to_string(), question.clone()));
        if self.failing_invocations.contains(source) {
            return Err(SourceInvocationError::new(source, "request timed out"));
        }
        let key = (
            source.to_string(),
            Self::triple_key(
                &question.subject_type,
                &question.predicate,
                &question.object_type,
            ),
        );
        Ok(self.answers.get(&key).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SchemaDiscovery for MockBackplane {
    async fn fetch_supported_triples(
        &self,
        source: &str,
    ) -> Result<Vec<SchemaTriple>, SchemaFetchError> {
        if let Some(message) = self.failing_schemas.get(source) {
            return Err(SchemaFetchError::new(source, message.clone()));
        }
        Ok(self.triples.get(source).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl NameResolver for MockBackplane {
    async fn resolve_name(&self, text: &str) -> Result<Vec<String>, ResolverError> {
        self.names
            .get(text)
            .cloned()
            .ok_or_else(|| ResolverError(format!("no name candidates for {text}")))
    }
}

#[async_trait]
impl IdResolver for MockBackplane {
    async fn resolve_id(&self, raw_id: &str, _type_hint: &str) -> Result<String, ResolverError> {
        self.curies
            .get(raw_id)
            .cloned()
            .ok_or_else(|| ResolverError(format!("no canonical curie for {raw_id}")))
    }
}
