//! Trellis Engine: federated query planning and result aggregation
//!
//! This crate executes graph-shaped query plans over a federation of
//! independently hosted knowledge sources and merges the heterogeneous
//! answers into one coherent graph.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        QUERY EXECUTION PIPELINE                      │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   QueryPlan ──► Statement Executor ──► Message Merger ──► Answer     │
//! │                   │          ▲                                       │
//! │          route()  │          │ GraphMessage                          │
//! │                   ▼          │                                       │
//! │              Schema Graph    │                                       │
//! │                   ▲          │                                       │
//! │     supported     │          │ invoke()                              │
//! │     triples       │          │                                       │
//! │                 ┌─┴──────────┴─┐                                     │
//! │                 │  Backplane   │──► knowledge sources (N)            │
//! │                 └──────────────┘                                     │
//! │                                                                      │
//! │   Concept Taxonomy: validates and is-a-widens every term above       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failure semantics: per-source and per-step failures are recorded as
//! ordered [`RequestError`]s / [`LoadError`]s next to whatever partial data
//! exists; only structural plan problems abort. The caller always learns
//! whether an answer is complete, partial, or empty.
//!
//! The concept taxonomy and schema graph are built once (or per refresh
//! cycle) and shared read-only by all concurrent executions; refreshes are
//! copy-and-swap, never in-place.

pub mod error;
pub mod executor;
pub mod merge;
pub mod plan;
pub mod schema;
pub mod sources;

use std::sync::Arc;

use trellis_model::{ConceptTaxonomy, ConceptType, GraphMessage, TaxonomyError};

pub use error::{
    ErrorKind, LoadError, PlanError, RequestError, ResolverError, SchemaFetchError,
    SourceInvocationError,
};
pub use executor::{ExecutionContext, ExecutionOutcome, StatementExecutor, TerminalState};
pub use merge::MessageMerger;
pub use plan::{InterpreterOptions, QueryPlan, Step, StepFilter};
pub use schema::{build_schema_graph, SchemaEdge, SchemaGraph, SchemaTriple, SourceDescriptor};
pub use sources::{
    BackplaneClient, IdResolver, MockBackplane, NameResolver, SchemaDiscovery, SourceInvoker,
    TripleQuestion,
};

/// Facade over the core: one place to execute plans, merge external
/// messages, and inspect the vocabulary.
pub struct QueryEngine {
    taxonomy: Arc<ConceptTaxonomy>,
    schema: Arc<SchemaGraph>,
    executor: StatementExecutor,
}

impl QueryEngine {
    pub fn new(
        taxonomy: Arc<ConceptTaxonomy>,
        schema: Arc<SchemaGraph>,
        invoker: Arc<dyn SourceInvoker>,
        backplane: impl Into<String>,
    ) -> Self {
        let executor = StatementExecutor::new(
            Arc::clone(&taxonomy),
            Arc::clone(&schema),
            invoker,
            backplane,
        );
        Self {
            taxonomy,
            schema,
            executor,
        }
    }

    pub fn with_name_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.executor = self.executor.with_name_resolver(resolver);
        self
    }

    pub fn with_id_resolver(mut self, resolver: Arc<dyn IdResolver>) -> Self {
        self.executor = self.executor.with_id_resolver(resolver);
        self
    }

    /// Execute a query plan, best-effort with errors reported.
    pub async fn execute(
        &self,
        plan: &QueryPlan,
        options: InterpreterOptions,
    ) -> Result<ExecutionOutcome, PlanError> {
        self.executor.execute(plan, options).await
    }

    /// Merge externally supplied messages under the given options, outside
    /// any plan execution.
    pub fn merge_external(
        &self,
        messages: &[GraphMessage],
        options: &InterpreterOptions,
    ) -> GraphMessage {
        MessageMerger::from_options(options).merge(messages)
    }

    pub fn lookup_concept(&self, name: &str) -> Result<&ConceptType, TaxonomyError> {
        self.taxonomy.resolve(name)
    }

    pub fn concept_names(&self) -> Vec<String> {
        self.taxonomy.concept_names()
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.taxonomy.relation_names()
    }

    pub fn schema(&self) -> &SchemaGraph {
        &self.schema
    }
}
