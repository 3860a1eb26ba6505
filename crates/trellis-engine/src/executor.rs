//! Statement executor: walks a query plan across the schema graph.
//!
//! One [`ExecutionContext`] lives for exactly one query execution. Per step
//! the executor resolves the step's vocabulary, asks the schema graph for
//! candidate sources (widening through the is-a hierarchy when the exact
//! triple is unregistered), tries the candidates in route order, and merges
//! the first structurally valid answer into the running result graph.
//!
//! Failures are the normal case in a federation, so almost nothing aborts:
//! every failed attempt, unroutable step, or exhausted candidate list is
//! recorded as a [`RequestError`] and execution continues with whatever
//! steps do not depend on the lost data. Only structural plan problems
//! ([`PlanError`]) end an execution early.
//!
//! With the `asynchronous` option, steps whose producers have completed are
//! dispatched concurrently (bounded by `fan_out_limit`); results are always
//! recorded and merged in step order, so output is deterministic regardless
//! of completion order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use trellis_model::{ConceptTaxonomy, GraphMessage, TaxonomyError};

use crate::error::{ErrorKind, PlanError, RequestError};
use crate::merge::MessageMerger;
use crate::plan::{InterpreterOptions, QueryPlan, Step, StepFilter};
use crate::schema::SchemaGraph;
use crate::sources::{IdResolver, NameResolver, SourceInvoker, TripleQuestion};

/// How a query execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalState {
    /// Every step succeeded.
    Completed,
    /// At least one step failed but a non-empty result graph was produced.
    CompletedWithErrors,
    /// No step produced usable data.
    Failed,
}

/// What an execution hands back: the merged graph, the ordered error
/// report, and the terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub message: GraphMessage,
    pub errors: Vec<RequestError>,
    pub state: TerminalState,
}

/// Per-execution shared state: the accumulating result graph and the error
/// sequence, guarded by a single-writer critical section. The lock is never
/// held across a remote call.
pub struct ExecutionContext {
    pub id: Uuid,
    pub backplane: String,
    options: InterpreterOptions,
    merger: MessageMerger,
    inner: Mutex<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    result: GraphMessage,
    errors: Vec<RequestError>,
}

impl ExecutionContext {
    pub fn new(backplane: impl Into<String>, options: InterpreterOptions) -> Self {
        let merger = MessageMerger::from_options(&options);
        Self {
            id: Uuid::new_v4(),
            backplane: backplane.into(),
            options,
            merger,
            inner: Mutex::new(ContextInner::default()),
        }
    }

    pub fn options(&self) -> &InterpreterOptions {
        &self.options
    }

    pub fn record_error(&self, error: RequestError) {
        if error.is_warning() {
            debug!(execution = %self.id, "{error}");
        } else {
            warn!(execution = %self.id, "{error}");
        }
        self.inner.lock().errors.push(error);
    }

    pub fn record_errors(&self, errors: impl IntoIterator<Item = RequestError>) {
        for error in errors {
            self.record_error(error);
        }
    }

    /// Merge a step's answer into the running result graph.
    pub fn merge_result(&self, message: &GraphMessage) {
        let mut inner = self.inner.lock();
        let current = std::mem::take(&mut inner.result);
        inner.result = self.merger.merge(&[current, message.clone()]);
    }

    /// Ids of accumulated nodes carrying `concept_type`, for binding a
    /// downstream step to its upstream answers.
    pub fn bound_ids_for(&self, concept_type: &str) -> Vec<String> {
        self.inner
            .lock()
            .result
            .nodes_of_type(concept_type)
            .map(|node| node.id.clone())
            .collect()
    }

    pub fn into_parts(self) -> (GraphMessage, Vec<RequestError>) {
        let inner = self.inner.into_inner();
        (inner.result, inner.errors)
    }
}

#[derive(Debug, Clone)]
struct ResolvedStep {
    subject: String,
    predicate: String,
    object: String,
    filters: Vec<StepFilter>,
}

/// Everything one step attempt produced: its ordered errors and, on
/// success, the accepted (post-processed) message.
#[derive(Default)]
struct StepFetch {
    errors: Vec<RequestError>,
    message: Option<GraphMessage>,
}

/// The control core: interprets query plans against the schema graph.
///
/// The taxonomy and schema graph are shared read-only with every concurrent
/// execution; refreshing them is the owner's copy-and-swap concern.
#[derive(Clone)]
pub struct StatementExecutor {
    taxonomy: Arc<ConceptTaxonomy>,
    schema: Arc<SchemaGraph>,
    invoker: Arc<dyn SourceInvoker>,
    name_resolver: Option<Arc<dyn NameResolver>>,
    id_resolver: Option<Arc<dyn IdResolver>>,
    backplane: String,
}

impl StatementExecutor {
    pub fn new(
        taxonomy: Arc<ConceptTaxonomy>,
        schema: Arc<SchemaGraph>,
        invoker: Arc<dyn SourceInvoker>,
        backplane: impl Into<String>,
    ) -> Self {
        Self {
            taxonomy,
            schema,
            invoker,
            name_resolver: None,
            id_resolver: None,
            backplane: backplane.into(),
        }
    }

    pub fn with_name_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.name_resolver = Some(resolver);
        self
    }

    pub fn with_id_resolver(mut self, resolver: Arc<dyn IdResolver>) -> Self {
        self.id_resolver = Some(resolver);
        self
    }

    /// Execute a plan to completion, best-effort with errors reported.
    pub async fn execute(
        &self,
        plan: &QueryPlan,
        options: InterpreterOptions,
    ) -> Result<ExecutionOutcome, PlanError> {
        if plan.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        let deadline = options.timeout().map(|timeout| Instant::now() + timeout);
        let ctx = ExecutionContext::new(&self.backplane, options);
        debug!(execution = %ctx.id, steps = plan.len(), "executing plan");

        let mut resolved: Vec<Option<ResolvedStep>> = Vec::with_capacity(plan.len());
        for (idx, step) in plan.steps.iter().enumerate() {
            match self.resolve_step(step) {
                Ok(step) => resolved.push(Some(step)),
                Err(error) => {
                    if idx == 0 {
                        return Err(PlanError::FirstStepUnresolved {
                            reason: error.message,
                        });
                    }
                    ctx.record_error(error);
                    resolved.push(None);
                }
            }
        }

        let deps = dependencies(&resolved);
        let mut failed: Vec<bool> = resolved.iter().map(Option::is_none).collect();

        if ctx.options().asynchronous {
            self.run_concurrent(&ctx, &resolved, &deps, &mut failed, deadline)
                .await;
        } else {
            self.run_sequential(&ctx, &resolved, &deps, &mut failed, deadline)
                .await;
        }

        let all_succeeded = !failed.iter().any(|&step_failed| step_failed);
        let execution = ctx.id;
        let (message, errors) = ctx.into_parts();
        let state = if all_succeeded {
            TerminalState::Completed
        } else if !message.is_empty() {
            TerminalState::CompletedWithErrors
        } else {
            TerminalState::Failed
        };
        debug!(
            %execution,
            ?state,
            nodes = message.nodes.len(),
            edges = message.edges.len(),
            errors = errors.len(),
            "execution finished"
        );
        Ok(ExecutionOutcome {
            message,
            errors,
            state,
        })
    }

    async fn run_sequential(
        &self,
        ctx: &ExecutionContext,
        resolved: &[Option<ResolvedStep>],
        deps: &[Option<usize>],
        failed: &mut [bool],
        deadline: Option<Instant>,
    ) {
        for idx in 0..resolved.len() {
            if deadline_passed(deadline) {
                let remaining: Vec<usize> =
                    (idx..resolved.len()).filter(|&i| !failed[i]).collect();
                abandon(ctx, &remaining, failed);
                return;
            }
            let Some(step) = resolved[idx].as_ref() else {
                continue;
            };
            if skip_if_upstream_failed(ctx, idx, deps[idx], failed) {
                continue;
            }
            let bound_ids = deps[idx]
                .map(|_| ctx.bound_ids_for(&step.subject))
                .unwrap_or_default();
            let fetch = self
                .fetch_step(ctx.options().clone(), idx, step.clone(), bound_ids, deadline)
                .await;
            ctx.record_errors(fetch.errors);
            match fetch.message {
                Some(message) => ctx.merge_result(&message),
                None => failed[idx] = true,
            }
        }
    }

    async fn run_concurrent(
        &self,
        ctx: &ExecutionContext,
        resolved: &[Option<ResolvedStep>],
        deps: &[Option<usize>],
        failed: &mut [bool],
        deadline: Option<Instant>,
    ) {
        let fan_out = ctx.options().fan_out_limit.max(1);
        let mut done: Vec<bool> = resolved.iter().map(Option::is_none).collect();

        loop {
            if deadline_passed(deadline) {
                abandon_unfinished(ctx, &mut done, failed);
                return;
            }

            // Steps whose producer (if any) has finished are ready; a ready
            // step whose producer failed is skipped on the spot.
            let mut wave: Vec<usize> = Vec::new();
            let mut skipped = false;
            for idx in 0..resolved.len() {
                if done[idx] {
                    continue;
                }
                match deps[idx] {
                    Some(dep) if !done[dep] => {}
                    Some(dep) if failed[dep] => {
                        skip_if_upstream_failed(ctx, idx, Some(dep), failed);
                        done[idx] = true;
                        skipped = true;
                    }
                    _ => wave.push(idx),
                }
            }
            if wave.is_empty() {
                if skipped {
                    continue;
                }
                return;
            }

            for chunk in wave.chunks(fan_out) {
                let deadline_hit = self
                    .run_chunk(ctx, resolved, deps, failed, &mut done, chunk, deadline)
                    .await;
                if deadline_hit {
                    abandon_unfinished(ctx, &mut done, failed);
                    return;
                }
            }
        }
    }

    /// Dispatch one bounded chunk of ready steps concurrently, then record
    /// and merge the results in step order.
    #[allow(clippy::too_many_arguments)]
    async fn run_chunk(
        &self,
        ctx: &ExecutionContext,
        resolved: &[Option<ResolvedStep>],
        deps: &[Option<usize>],
        failed: &mut [bool],
        done: &mut [bool],
        chunk: &[usize],
        deadline: Option<Instant>,
    ) -> bool {
        let mut tasks = JoinSet::new();
        for &idx in chunk {
            let Some(step) = resolved[idx].clone() else {
                continue;
            };
            let bound_ids = deps[idx]
                .map(|_| ctx.bound_ids_for(&step.subject))
                .unwrap_or_default();
            let executor = self.clone();
            let options = ctx.options().clone();
            tasks.spawn(async move {
                (
                    idx,
                    executor
                        .fetch_step(options, idx, step, bound_ids, deadline)
                        .await,
                )
            });
        }

        let mut results: HashMap<usize, StepFetch> = HashMap::new();
        let mut deadline_hit = false;
        loop {
            let joined = match deadline {
                Some(at) => match timeout_at(at, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tasks.abort_all();
                        deadline_hit = true;
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((idx, fetch)) => {
                    results.insert(idx, fetch);
                }
                Err(join_error) => warn!("step task aborted: {join_error}"),
            }
        }

        for &idx in chunk {
            match results.remove(&idx) {
                Some(fetch) => {
                    ctx.record_errors(fetch.errors);
                    match fetch.message {
                        Some(message) => ctx.merge_result(&message),
                        None => failed[idx] = true,
                    }
                    done[idx] = true;
                }
                None if !deadline_hit => {
                    ctx.record_error(RequestError::new(
                        ErrorKind::StepExhausted,
                        format!("step {idx} task aborted"),
                    ));
                    failed[idx] = true;
                    done[idx] = true;
                }
                None => {}
            }
        }
        deadline_hit
    }

    /// Try a step's candidate sources in route order; the first structurally
    /// valid answer wins. The same source is never retried.
    async fn fetch_step(
        &self,
        options: InterpreterOptions,
        idx: usize,
        step: ResolvedStep,
        bound_ids: Vec<String>,
        deadline: Option<Instant>,
    ) -> StepFetch {
        let mut fetch = StepFetch::default();
        let candidates = self.candidate_sources(&step);
        if candidates.is_empty() {
            fetch.errors.push(RequestError::new(
                ErrorKind::NoRoute,
                format!(
                    "no source can answer {} -{}-> {}",
                    step.subject, step.predicate, step.object
                ),
            ));
            return fetch;
        }

        let question = TripleQuestion {
            subject_type: step.subject.clone(),
            predicate: step.predicate.clone(),
            object_type: step.object.clone(),
            filters: step.filters.clone(),
            bound_ids,
        };
        let attempts = candidates.len();
        for source in candidates {
            debug!(step = idx, source = %source, "invoking candidate source");
            let call = self.invoker.invoke(&source, &question);
            let result = match deadline {
                Some(at) => match timeout_at(at, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        fetch.errors.push(RequestError::new(
                            ErrorKind::StepExhausted,
                            format!("deadline reached while invoking {source} for step {idx}"),
                        ));
                        return fetch;
                    }
                },
                None => call.await,
            };
            match result {
                Err(error) => fetch
                    .errors
                    .push(RequestError::new(ErrorKind::SourceInvocation, error.to_string())),
                Ok(message) => {
                    if let Err(issue) = message.validate() {
                        fetch.errors.push(
                            RequestError::new(
                                ErrorKind::SourceInvocation,
                                format!("source {source} returned a structurally invalid message"),
                            )
                            .with_details(issue.to_string()),
                        );
                        continue;
                    }
                    let message = self
                        .post_process(&options, message, &mut fetch.errors)
                        .await;
                    fetch.message = Some(message);
                    return fetch;
                }
            }
        }
        fetch.errors.push(RequestError::new(
            ErrorKind::StepExhausted,
            format!("all {attempts} candidate source(s) failed for step {idx}"),
        ));
        fetch
    }

    /// Candidate sources for a step, in route order. When the exact triple
    /// is unregistered, widen through the is-a hierarchy nearest-first; the
    /// first registered combination wins.
    fn candidate_sources(&self, step: &ResolvedStep) -> Vec<String> {
        let exact = self
            .schema
            .route(&step.subject, &step.predicate, &step.object);
        if !exact.is_empty() {
            return exact.to_vec();
        }

        let subjects = self.with_ancestors(&step.subject);
        let objects = self.with_ancestors(&step.object);
        for subject in &subjects {
            for object in &objects {
                if subject == &step.subject && object == &step.object {
                    continue;
                }
                let found = self.schema.route(subject, &step.predicate, object);
                if !found.is_empty() {
                    debug!(
                        "widened {} -{}-> {} to {} -{}-> {}",
                        step.subject, step.predicate, step.object, subject, step.predicate, object
                    );
                    return found.to_vec();
                }
            }
        }
        Vec::new()
    }

    /// A concept type followed by its ancestors, nearest first.
    fn with_ancestors(&self, concept_type: &str) -> Vec<String> {
        let mut names = vec![concept_type.to_string()];
        if let Ok(walk) = self.taxonomy.ancestors(concept_type) {
            names.extend(walk.map(|concept| concept.name.clone()));
        }
        names
    }

    /// Apply the optional resolver passes to an accepted message before it
    /// is merged. Resolver failures degrade the answer, never the step.
    async fn post_process(
        &self,
        options: &InterpreterOptions,
        mut message: GraphMessage,
        errors: &mut Vec<RequestError>,
    ) -> GraphMessage {
        if options.resolve_names {
            if let Some(resolver) = &self.name_resolver {
                for node in &mut message.nodes {
                    if node.name.is_some() {
                        continue;
                    }
                    match resolver.resolve_name(&node.id).await {
                        Ok(candidates) => node.name = candidates.into_iter().next(),
                        Err(error) => errors.push(
                            RequestError::new(
                                ErrorKind::NameResolution,
                                format!("could not resolve a name for {}", node.id),
                            )
                            .with_details(error.to_string()),
                        ),
                    }
                }
            }
        }
        if options.dynamic_id_resolution {
            if let Some(resolver) = &self.id_resolver {
                let mut remap: HashMap<String, String> = HashMap::new();
                for node in &mut message.nodes {
                    let hint = node.types.iter().next().cloned().unwrap_or_default();
                    match resolver.resolve_id(&node.id, &hint).await {
                        Ok(curie) => {
                            if curie != node.id {
                                remap.insert(node.id.clone(), curie.clone());
                                node.id = curie;
                            }
                        }
                        Err(error) => errors.push(
                            RequestError::new(
                                ErrorKind::IdResolution,
                                format!("could not canonicalize {}", node.id),
                            )
                            .with_details(error.to_string()),
                        ),
                    }
                }
                if !remap.is_empty() {
                    for edge in &mut message.edges {
                        if let Some(canonical) = remap.get(&edge.source_id) {
                            edge.source_id = canonical.clone();
                        }
                        if let Some(canonical) = remap.get(&edge.target_id) {
                            edge.target_id = canonical.clone();
                        }
                    }
                }
            }
        }
        message
    }

    fn resolve_step(&self, step: &Step) -> Result<ResolvedStep, RequestError> {
        let subject = self
            .taxonomy
            .resolve(&step.subject)
            .map_err(vocabulary_error)?
            .name
            .clone();
        let predicate = self
            .taxonomy
            .resolve_relation(&step.predicate)
            .map_err(vocabulary_error)?
            .name
            .clone();
        let object = self
            .taxonomy
            .resolve(&step.object)
            .map_err(vocabulary_error)?
            .name
            .clone();
        Ok(ResolvedStep {
            subject,
            predicate,
            object,
            filters: step.filters.clone(),
        })
    }
}

fn vocabulary_error(error: TaxonomyError) -> RequestError {
    let kind = match error {
        TaxonomyError::UnknownRelation(_) => ErrorKind::UnknownRelation,
        _ => ErrorKind::UnknownConcept,
    };
    RequestError::new(kind, error.to_string())
}

/// Step `i` depends on the most recent earlier step whose object type is
/// `i`'s subject type: the chain shape of the query language.
fn dependencies(resolved: &[Option<ResolvedStep>]) -> Vec<Option<usize>> {
    (0..resolved.len())
        .map(|idx| {
            let step = resolved[idx].as_ref()?;
            (0..idx).rev().find(|&j| {
                resolved[j]
                    .as_ref()
                    .is_some_and(|earlier| earlier.object == step.subject)
            })
        })
        .collect()
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}

fn skip_if_upstream_failed(
    ctx: &ExecutionContext,
    idx: usize,
    dep: Option<usize>,
    failed: &mut [bool],
) -> bool {
    let Some(dep) = dep else {
        return false;
    };
    if !failed[dep] {
        return false;
    }
    ctx.record_error(RequestError::new(
        ErrorKind::StepExhausted,
        format!("step {idx} skipped: upstream step {dep} produced no data"),
    ));
    failed[idx] = true;
    true
}

fn abandon(ctx: &ExecutionContext, indexes: &[usize], failed: &mut [bool]) {
    if indexes.is_empty() {
        return;
    }
    ctx.record_error(RequestError::new(
        ErrorKind::StepExhausted,
        format!("execution deadline reached; {} step(s) abandoned", indexes.len()),
    ));
    for &idx in indexes {
        failed[idx] = true;
    }
}

fn abandon_unfinished(ctx: &ExecutionContext, done: &mut [bool], failed: &mut [bool]) {
    let remaining: Vec<usize> = (0..done.len()).filter(|&idx| !done[idx]).collect();
    for &idx in &remaining {
        done[idx] = true;
    }
    abandon(ctx, &remaining, failed);
}
