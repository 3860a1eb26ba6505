//! Tests for the statement executor

use std::sync::Arc;

use trellis_engine::{
    build_schema_graph, ErrorKind, InterpreterOptions, MockBackplane, PlanError, QueryEngine,
    QueryPlan, SchemaDiscovery, SourceDescriptor, SourceInvocationError, SourceInvoker, Step,
    TerminalState, TripleQuestion,
};
use trellis_model::{ConceptTaxonomy, ConceptType, Edge, GraphMessage, Node, RelationType};

fn taxonomy() -> Arc<ConceptTaxonomy> {
    Arc::new(
        ConceptTaxonomy::build(
            [
                ConceptType::new("named_thing"),
                ConceptType::new("chemical_substance")
                    .with_parent("named_thing")
                    .with_synonym("drug"),
                ConceptType::new("gene").with_parent("named_thing"),
                ConceptType::new("disease").with_parent("named_thing"),
            ],
            [
                RelationType::new("targets"),
                RelationType::new("treats"),
                RelationType::new("contributes_to"),
            ],
        )
        .expect("valid taxonomy"),
    )
}

fn chem_gene_answer() -> GraphMessage {
    GraphMessage {
        nodes: vec![
            Node::new("CHEBI:15365", "chemical_substance").named("aspirin"),
            Node::new("HGNC:9604", "gene").named("PTGS2"),
        ],
        edges: vec![Edge::new("e0", "CHEBI:15365", "HGNC:9604", "targets")],
    }
}

fn gene_disease_answer() -> GraphMessage {
    GraphMessage {
        nodes: vec![
            Node::new("HGNC:9604", "gene").named("PTGS2"),
            Node::new("MONDO:0005405", "disease").named("peptic ulcer"),
        ],
        edges: vec![Edge::new("e1", "HGNC:9604", "MONDO:0005405", "contributes_to")],
    }
}

/// Build a schema graph from the mock and wire an engine around it.
async fn engine(backplane: MockBackplane, source_ids: &[&str]) -> (QueryEngine, Arc<MockBackplane>) {
    let backplane = Arc::new(backplane);
    let taxonomy = taxonomy();
    let descriptors: Vec<SourceDescriptor> = source_ids
        .iter()
        .map(|id| SourceDescriptor::new(*id, format!("https://backplane.test/{id}")))
        .collect();
    let discovery: Arc<dyn SchemaDiscovery> = backplane.clone();
    let (schema, _load_errors) = build_schema_graph(discovery, &taxonomy, &descriptors).await;
    let engine = QueryEngine::new(
        taxonomy,
        Arc::new(schema),
        backplane.clone(),
        "https://backplane.test",
    )
    .with_name_resolver(backplane.clone())
    .with_id_resolver(backplane.clone());
    (engine, backplane)
}

// ============================================================================
// Terminal states
// ============================================================================

#[tokio::test]
async fn single_step_plan_completes() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.message.nodes.len(), 2);
    assert_eq!(outcome.message.edges.len(), 1);
    assert!(outcome.errors.is_empty());
}

#[tokio::test]
async fn unroutable_plan_fails_with_no_route() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "treats", "disease")]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Failed);
    assert!(outcome.message.is_empty());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, ErrorKind::NoRoute);
}

#[tokio::test]
async fn independent_step_survives_a_failed_leg() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    // First leg has no route; the second is independent and succeeds.
    let plan = QueryPlan::new(vec![
        Step::new("chemical_substance", "treats", "disease"),
        Step::new("chemical_substance", "targets", "gene"),
    ]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::CompletedWithErrors);
    assert_eq!(outcome.message.nodes.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, ErrorKind::NoRoute);
}

// ============================================================================
// Plan-structural errors (the only aborting class)
// ============================================================================

#[tokio::test]
async fn empty_plans_abort() {
    let (engine, _) = engine(MockBackplane::new(), &[]).await;
    let result = engine
        .execute(&QueryPlan::default(), InterpreterOptions::default())
        .await;
    assert_eq!(result.unwrap_err(), PlanError::EmptyPlan);
}

#[tokio::test]
async fn unresolvable_first_step_aborts() {
    let (engine, _) = engine(MockBackplane::new(), &[]).await;
    let plan = QueryPlan::new(vec![Step::new("phenotype", "targets", "gene")]);
    let result = engine.execute(&plan, InterpreterOptions::default()).await;
    assert!(matches!(
        result.unwrap_err(),
        PlanError::FirstStepUnresolved { .. }
    ));
}

#[tokio::test]
async fn unresolvable_later_step_is_recorded_not_fatal() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    let plan = QueryPlan::new(vec![
        Step::new("chemical_substance", "targets", "gene"),
        Step::new("gene", "causes", "disease"),
    ]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::CompletedWithErrors);
    assert_eq!(outcome.message.nodes.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, ErrorKind::UnknownRelation);
}

// ============================================================================
// Candidate failover
// ============================================================================

#[tokio::test]
async fn failover_tries_candidates_in_route_order() {
    let mut mock = MockBackplane::new();
    mock.register_triple("flaky_kp", "chemical_substance", "targets", "gene");
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.fail_invocation("flaky_kp");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    let (engine, backplane) = engine(mock, &["flaky_kp", "gene_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    // The step succeeded on the second candidate; the first attempt is
    // reported, never retried.
    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.message.nodes.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, ErrorKind::SourceInvocation);
    let sources: Vec<String> = backplane
        .invocations()
        .into_iter()
        .map(|(source, _)| source)
        .collect();
    assert_eq!(sources, ["flaky_kp", "gene_kp"]);
}

#[tokio::test]
async fn exhausted_candidates_fail_the_step_only() {
    let mut mock = MockBackplane::new();
    mock.register_triple("flaky_kp", "chemical_substance", "targets", "gene");
    mock.fail_invocation("flaky_kp");
    let (engine, _) = engine(mock, &["flaky_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Failed);
    let kinds: Vec<ErrorKind> = outcome.errors.iter().map(|error| error.kind).collect();
    assert_eq!(
        kinds,
        [ErrorKind::SourceInvocation, ErrorKind::StepExhausted]
    );
}

#[tokio::test]
async fn structurally_invalid_payloads_are_rejected() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    // Edge references a node missing from the payload.
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        GraphMessage {
            nodes: vec![Node::new("CHEBI:15365", "chemical_substance")],
            edges: vec![Edge::new("e0", "CHEBI:15365", "HGNC:9604", "targets")],
        },
    );
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Failed);
    let kinds: Vec<ErrorKind> = outcome.errors.iter().map(|error| error.kind).collect();
    assert_eq!(
        kinds,
        [ErrorKind::SourceInvocation, ErrorKind::StepExhausted]
    );
}

// ============================================================================
// Chained steps and dependency handling
// ============================================================================

#[tokio::test]
async fn downstream_steps_receive_bound_ids() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.register_triple("disease_kp", "gene", "contributes_to", "disease");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    mock.answer_with(
        "disease_kp",
        "gene",
        "contributes_to",
        "disease",
        gene_disease_answer(),
    );
    let (engine, backplane) = engine(mock, &["gene_kp", "disease_kp"]).await;

    let plan = QueryPlan::new(vec![
        Step::new("chemical_substance", "targets", "gene"),
        Step::new("gene", "contributes_to", "disease"),
    ]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    // Shared gene node merged: 3 nodes, 2 edges.
    assert_eq!(outcome.message.nodes.len(), 3);
    assert_eq!(outcome.message.edges.len(), 2);

    let invocations = backplane.invocations();
    assert_eq!(invocations.len(), 2);
    let (_, second_question) = &invocations[1];
    assert_eq!(second_question.bound_ids, ["HGNC:9604"]);
}

#[tokio::test]
async fn dependents_of_a_failed_step_are_skipped() {
    let mut mock = MockBackplane::new();
    mock.register_triple("disease_kp", "gene", "contributes_to", "disease");
    let (engine, backplane) = engine(mock, &["disease_kp"]).await;

    // Step 0 has no route; step 1 consumes its genes and must not run.
    let plan = QueryPlan::new(vec![
        Step::new("chemical_substance", "targets", "gene"),
        Step::new("gene", "contributes_to", "disease"),
    ]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Failed);
    assert!(outcome.message.is_empty());
    let kinds: Vec<ErrorKind> = outcome.errors.iter().map(|error| error.kind).collect();
    assert_eq!(kinds, [ErrorKind::NoRoute, ErrorKind::StepExhausted]);
    assert!(backplane.invocations().is_empty());
}

#[tokio::test]
async fn synonyms_resolve_in_plans() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    // "drug" is a synonym of chemical_substance; case is irrelevant.
    let plan = QueryPlan::new(vec![Step::new("Drug", "Targets", "GENE")]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.state, TerminalState::Completed);
}

#[tokio::test]
async fn unregistered_triples_widen_through_the_hierarchy() {
    let mut mock = MockBackplane::new();
    // The source only knows about the general named_thing form.
    mock.register_triple("general_kp", "named_thing", "targets", "gene");
    mock.answer_with(
        "general_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    let (engine, backplane) = engine(mock, &["general_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let outcome = engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    // The question still carries the specific type the plan asked for.
    let (_, question) = &backplane.invocations()[0];
    assert_eq!(question.subject_type, "chemical_substance");
}

// ============================================================================
// Concurrent dispatch
// ============================================================================

#[tokio::test]
async fn asynchronous_execution_matches_sequential_output() {
    fn seeded() -> MockBackplane {
        let mut mock = MockBackplane::new();
        mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
        mock.register_triple("disease_kp", "chemical_substance", "treats", "disease");
        mock.answer_with(
            "gene_kp",
            "chemical_substance",
            "targets",
            "gene",
            chem_gene_answer(),
        );
        mock.answer_with(
            "disease_kp",
            "chemical_substance",
            "treats",
            "disease",
            GraphMessage {
                nodes: vec![
                    Node::new("CHEBI:15365", "chemical_substance").named("aspirin"),
                    Node::new("MONDO:0008383", "disease").named("rheumatoid arthritis"),
                ],
                edges: vec![Edge::new("e2", "CHEBI:15365", "MONDO:0008383", "treats")],
            },
        );
        mock
    }

    let plan = QueryPlan::new(vec![
        Step::new("chemical_substance", "targets", "gene"),
        Step::new("chemical_substance", "treats", "disease"),
    ]);

    let (sequential_engine, _) = engine(seeded(), &["gene_kp", "disease_kp"]).await;
    let sequential = sequential_engine
        .execute(&plan, InterpreterOptions::default())
        .await
        .unwrap();

    let (concurrent_engine, _) = engine(seeded(), &["gene_kp", "disease_kp"]).await;
    let options = InterpreterOptions {
        asynchronous: true,
        fan_out_limit: 2,
        ..Default::default()
    };
    let concurrent = concurrent_engine.execute(&plan, options).await.unwrap();

    assert_eq!(concurrent.state, TerminalState::Completed);
    assert_eq!(concurrent.message, sequential.message);
}

#[tokio::test]
async fn concurrent_chains_still_bind_upstream_ids() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.register_triple("disease_kp", "gene", "contributes_to", "disease");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        chem_gene_answer(),
    );
    mock.answer_with(
        "disease_kp",
        "gene",
        "contributes_to",
        "disease",
        gene_disease_answer(),
    );
    let (engine, backplane) = engine(mock, &["gene_kp", "disease_kp"]).await;

    let plan = QueryPlan::new(vec![
        Step::new("chemical_substance", "targets", "gene"),
        Step::new("gene", "contributes_to", "disease"),
    ]);
    let options = InterpreterOptions {
        asynchronous: true,
        ..Default::default()
    };
    let outcome = engine.execute(&plan, options).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.message.nodes.len(), 3);
    let (_, second_question) = &backplane.invocations()[1];
    assert_eq!(second_question.bound_ids, ["HGNC:9604"]);
}

// ============================================================================
// Resolver passes
// ============================================================================

#[tokio::test]
async fn missing_names_are_filled_by_the_name_resolver() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        GraphMessage {
            nodes: vec![Node::new("CHEBI:15365", "chemical_substance")],
            edges: vec![],
        },
    );
    mock.resolve_name_to("CHEBI:15365", vec!["aspirin".to_string()]);
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let options = InterpreterOptions {
        resolve_names: true,
        ..Default::default()
    };
    let outcome = engine.execute(&plan, options).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.message.nodes[0].name.as_deref(), Some("aspirin"));
    assert!(outcome.errors.is_empty());
}

#[tokio::test]
async fn name_resolution_failures_are_warnings() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        GraphMessage {
            nodes: vec![Node::new("CHEBI:15365", "chemical_substance")],
            edges: vec![],
        },
    );
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let options = InterpreterOptions {
        resolve_names: true,
        ..Default::default()
    };
    let outcome = engine.execute(&plan, options).await.unwrap();

    // The step still completes; the miss is reported as a warning.
    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, ErrorKind::NameResolution);
    assert!(outcome.errors[0].is_warning());
}

#[tokio::test]
async fn dynamic_id_resolution_remaps_nodes_and_edges() {
    let mut mock = MockBackplane::new();
    mock.register_triple("gene_kp", "chemical_substance", "targets", "gene");
    mock.answer_with(
        "gene_kp",
        "chemical_substance",
        "targets",
        "gene",
        GraphMessage {
            nodes: vec![
                Node::new("kp-local-42", "chemical_substance").named("aspirin"),
                Node::new("HGNC:9604", "gene").named("PTGS2"),
            ],
            edges: vec![Edge::new("e0", "kp-local-42", "HGNC:9604", "targets")],
        },
    );
    mock.resolve_id_to("kp-local-42", "CHEBI:15365");
    mock.resolve_id_to("HGNC:9604", "HGNC:9604");
    let (engine, _) = engine(mock, &["gene_kp"]).await;

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let options = InterpreterOptions {
        dynamic_id_resolution: true,
        ..Default::default()
    };
    let outcome = engine.execute(&plan, options).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    assert!(outcome.message.node("CHEBI:15365").is_some());
    assert!(outcome.message.node("kp-local-42").is_none());
    assert_eq!(outcome.message.edges[0].source_id, "CHEBI:15365");
}

// ============================================================================
// Deadlines
// ============================================================================

/// Invoker that never answers inside the deadline.
struct StalledSource;

#[async_trait::async_trait]
impl SourceInvoker for StalledSource {
    async fn invoke(
        &self,
        _source: &str,
        _question: &TripleQuestion,
    ) -> Result<GraphMessage, SourceInvocationError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(GraphMessage::default())
    }
}

#[tokio::test(start_paused = true)]
async fn deadlines_abandon_in_flight_calls() {
    let mut mock = MockBackplane::new();
    mock.register_triple("slow_kp", "chemical_substance", "targets", "gene");
    let backplane = Arc::new(mock);
    let taxonomy = taxonomy();
    let discovery: Arc<dyn SchemaDiscovery> = backplane.clone();
    let (schema, _) = build_schema_graph(
        discovery,
        &taxonomy,
        &[SourceDescriptor::new("slow_kp", "https://backplane.test/slow_kp")],
    )
    .await;
    let engine = QueryEngine::new(
        taxonomy,
        Arc::new(schema),
        Arc::new(StalledSource),
        "https://backplane.test",
    );

    let plan = QueryPlan::new(vec![Step::new("chemical_substance", "targets", "gene")]);
    let options = InterpreterOptions {
        timeout_ms: Some(50),
        ..Default::default()
    };
    let outcome = engine.execute(&plan, options).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Failed);
    assert!(outcome
        .errors
        .iter()
        .any(|error| error.kind == ErrorKind::StepExhausted));
}
