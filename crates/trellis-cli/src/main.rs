//! Trellis CLI
//!
//! Command-line front end for the federated query engine:
//! - Build and inspect the schema graph across registered sources
//! - Execute query plans and print the merged result graph
//! - Merge externally produced graph messages
//! - List the concept/relation vocabulary
//!
//! All semantics live in the library crates; this binary is glue. Taxonomy
//! and source files are the serde form of the model types.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;

use trellis_engine::{
    build_schema_graph, BackplaneClient, InterpreterOptions, QueryEngine, QueryPlan, SchemaGraph,
    SourceDescriptor, TerminalState,
};
use trellis_model::{ConceptTaxonomy, ConceptType, GraphMessage, RelationType};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(
    author,
    version,
    about = "Trellis: graph-shaped queries over federated knowledge sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the schema graph across all registered sources and print it.
    Schema {
        #[command(flatten)]
        federation: FederationArgs,
        /// Print the schema graph as a JSON graph message instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Execute a query plan and print the merged result graph.
    Query {
        #[command(flatten)]
        federation: FederationArgs,
        /// Query plan JSON file.
        #[arg(short, long)]
        plan: PathBuf,
        /// Dispatch independent steps concurrently.
        #[arg(long)]
        asynchronous: bool,
        /// Merge nodes by case-insensitive name as well as id.
        #[arg(long)]
        name_merge: bool,
        /// Fill in missing node names via the backplane name resolver.
        #[arg(long)]
        resolve_names: bool,
        /// Remap source-local ids to canonical curies via the backplane.
        #[arg(long)]
        resolve_ids: bool,
        /// Overall execution deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Upper bound on concurrently dispatched steps.
        #[arg(long, default_value_t = 4)]
        fan_out: usize,
    },

    /// Merge graph message files into one message.
    Merge {
        /// Graph message JSON files, merged in the given order.
        files: Vec<PathBuf>,
        /// Merge nodes by case-insensitive name as well as id.
        #[arg(long)]
        name_merge: bool,
    },

    /// List concept types, sorted.
    Concepts {
        /// Taxonomy JSON file.
        #[arg(short, long)]
        taxonomy: PathBuf,
    },

    /// List relation types, sorted.
    Relations {
        /// Taxonomy JSON file.
        #[arg(short, long)]
        taxonomy: PathBuf,
    },
}

#[derive(Args)]
struct FederationArgs {
    /// Taxonomy JSON file: { "concepts": [...], "relations": [...] }.
    #[arg(short, long)]
    taxonomy: PathBuf,
    /// Source descriptor JSON file: [{ "id": ..., "endpoint": ... }, ...].
    #[arg(short, long)]
    sources: PathBuf,
    /// Backplane base URL.
    #[arg(short, long)]
    backplane: String,
}

#[derive(Deserialize)]
struct TaxonomyFile {
    #[serde(default)]
    concepts: Vec<ConceptType>,
    #[serde(default)]
    relations: Vec<RelationType>,
}

fn load_taxonomy(path: &Path) -> Result<ConceptTaxonomy> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading taxonomy file {}", path.display()))?;
    let file: TaxonomyFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    ConceptTaxonomy::build(file.concepts, file.relations).map_err(|error| anyhow!(error))
}

fn load_sources(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading sources file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn load_message(path: &Path) -> Result<GraphMessage> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading message file {}", path.display()))?;
    let message: GraphMessage =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    message
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(message)
}

async fn build_federation(
    federation: &FederationArgs,
) -> Result<(Arc<ConceptTaxonomy>, SchemaGraph, Arc<BackplaneClient>)> {
    let taxonomy = Arc::new(load_taxonomy(&federation.taxonomy)?);
    let sources = load_sources(&federation.sources)?;
    let client = Arc::new(BackplaneClient::new(&federation.backplane));
    let (schema, load_errors) = build_schema_graph(client.clone(), &taxonomy, &sources).await;
    if !load_errors.is_empty() {
        eprintln!(
            "{}",
            format!("{} source(s) failed to report:", load_errors.len()).yellow()
        );
        for error in &load_errors {
            eprintln!("  {}: {}", error.source.yellow(), error.message);
        }
    }
    Ok((taxonomy, schema, client))
}

async fn cmd_schema(federation: FederationArgs, json: bool) -> Result<()> {
    let (_, schema, _) = build_federation(&federation).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&schema.to_message())?);
    } else {
        for edge in schema.edges() {
            println!(
                "{} -{}-> {}  [{}]",
                edge.subject.cyan(),
                edge.predicate,
                edge.object.cyan(),
                edge.source.dimmed()
            );
        }
        println!(
            "{}",
            format!(
                "{} triple(s) across {} concept type(s)",
                schema.len(),
                schema.concept_types().count()
            )
            .bold()
        );
    }
    Ok(())
}

async fn cmd_query(
    federation: FederationArgs,
    plan: PathBuf,
    options: InterpreterOptions,
) -> Result<()> {
    let raw = fs::read_to_string(&plan)
        .with_context(|| format!("reading plan file {}", plan.display()))?;
    let plan: QueryPlan =
        serde_json::from_str(&raw).context("parsing query plan")?;

    let (taxonomy, schema, client) = build_federation(&federation).await?;
    let engine = QueryEngine::new(
        taxonomy,
        Arc::new(schema),
        client.clone(),
        &federation.backplane,
    )
    .with_name_resolver(client.clone())
    .with_id_resolver(client);

    let outcome = engine.execute(&plan, options).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.message)?);
    for error in &outcome.errors {
        let tag = if error.is_warning() { "warning:" } else { "error:" };
        eprintln!("{} {}", tag.yellow(), error);
    }
    match outcome.state {
        TerminalState::Completed => eprintln!("{}", "completed".green()),
        TerminalState::CompletedWithErrors => {
            eprintln!("{}", "completed with errors".yellow())
        }
        TerminalState::Failed => {
            eprintln!("{}", "failed".red());
            std::process::exit(1);
        }
    }
    Ok(())
}

fn cmd_merge(files: &[PathBuf], name_merge: bool) -> Result<()> {
    if files.is_empty() {
        return Err(anyhow!("no message files given"));
    }
    let messages = files
        .iter()
        .map(|path| load_message(path))
        .collect::<Result<Vec<_>>>()?;
    let options = InterpreterOptions {
        name_based_merging: name_merge,
        ..Default::default()
    };
    let merged =
        trellis_engine::MessageMerger::from_options(&options).merge(&messages);
    println!("{}", serde_json::to_string_pretty(&merged)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema { federation, json } => cmd_schema(federation, json).await,
        Commands::Query {
            federation,
            plan,
            asynchronous,
            name_merge,
            resolve_names,
            resolve_ids,
            timeout_ms,
            fan_out,
        } => {
            let options = InterpreterOptions {
                asynchronous,
                name_based_merging: name_merge,
                resolve_names,
                dynamic_id_resolution: resolve_ids,
                fan_out_limit: fan_out,
                timeout_ms,
            };
            cmd_query(federation, plan, options).await
        }
        Commands::Merge { files, name_merge } => cmd_merge(&files, name_merge),
        Commands::Concepts { taxonomy } => {
            let taxonomy = load_taxonomy(&taxonomy)?;
            for name in taxonomy.concept_names() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Relations { taxonomy } => {
            let taxonomy = load_taxonomy(&taxonomy)?;
            for name in taxonomy.relation_names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}
