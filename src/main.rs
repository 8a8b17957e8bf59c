//! # Topic Curator CLI (`curate`)
//!
//! The `curate` binary drives the ingestion engine. It provides commands
//! for database initialization, topic ingestion, and store inspection.
//!
//! ## Usage
//!
//! ```bash
//! curate --config ./config/curator.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `curate init` | Create the SQLite database and run schema migrations |
//! | `curate ingest <file>` | Classify and materialize a batch of topics |
//! | `curate list` | List stored documents |
//! | `curate get <id>` | Retrieve a document with chunk statistics |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use topic_curator::completion::CompletionClient;
use topic_curator::config::{load_config, Config};
use topic_curator::db;
use topic_curator::embedding::EmbeddingClient;
use topic_curator::ingest::{IngestOptions, IngestPipeline};
use topic_curator::migrate;
use topic_curator::models::Topic;
use topic_curator::store::DocumentStore;

/// Topic Curator — a similarity-driven ingestion engine for crawled
/// content fragments.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/curator.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "curate",
    about = "Topic Curator — similarity-driven ingestion into an embedded document store",
    version,
    long_about = "Topic Curator ingests content fragments extracted from crawled documents, \
    decides per fragment whether to create a new document or merge into an existing one \
    (consulting a completion service for the uncertain band), and materializes the result \
    as documents plus embedded chunks in SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/curator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, chunk_vectors). Idempotent.
    Init,

    /// Ingest a batch of topics from a JSON file.
    ///
    /// The file holds an array of topic objects (title, content,
    /// category, keywords, source_urls). Each topic is classified against
    /// the stored corpus and created or merged accordingly. Per-topic
    /// failures are reported, not fatal.
    Ingest {
        /// Path to the topics JSON file.
        topics_file: PathBuf,

        /// Classify and report without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Process at most N topics.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List stored documents.
    List,

    /// Show one document with its chunk statistics.
    Get {
        /// Document id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&config).await,
        Commands::Ingest {
            topics_file,
            dry_run,
            limit,
        } => run_ingest(&config, &topics_file, dry_run, limit).await,
        Commands::List => run_list(&config).await,
        Commands::Get { id } => run_get(&config, &id).await,
    }
}

async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("initialized {}", config.db.path.display());
    Ok(())
}

async fn open_store(config: &Config) -> Result<DocumentStore> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let model = config.embedding.model.clone().unwrap_or_default();
    let dims = config.embedding.dims.unwrap_or(0);
    Ok(DocumentStore::new(pool, model, dims))
}

async fn run_ingest(
    config: &Config,
    topics_file: &PathBuf,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<()> {
    let raw = std::fs::read_to_string(topics_file)
        .with_context(|| format!("Failed to read topics file: {}", topics_file.display()))?;
    let topics: Vec<Topic> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse topics file: {}", topics_file.display()))?;

    let store = open_store(config).await?;
    let embedding = std::sync::Arc::new(EmbeddingClient::from_config(&config.embedding)?);
    let completion = std::sync::Arc::new(CompletionClient::from_config(&config.completion)?);
    let pipeline = IngestPipeline::new(config, store, embedding, completion);

    let options = IngestOptions {
        dry_run,
        limit,
        cancel: None,
    };
    let report = pipeline.run(topics, &options).await?;

    if dry_run {
        println!("ingest {} (dry-run)", topics_file.display());
        println!("  topics: {}", report.topics_seen);
        for (title, decision) in &report.decisions {
            match &decision.target_document_id {
                Some(target) => println!(
                    "  {:?} -> merge into {} (similarity {:.3})",
                    title, target, decision.similarity
                ),
                None => println!(
                    "  {:?} -> create (similarity {:.3})",
                    title, decision.similarity
                ),
            }
        }
        println!("  llm verifications: {}", report.llm_verifications);
        return Ok(());
    }

    println!("ingest {}", topics_file.display());
    println!("  topics: {}", report.topics_seen);
    println!("  created: {}", report.created_count());
    println!("  merged: {}", report.merged_count());
    println!("  failed: {}", report.failed_count());
    for failure in &report.failed {
        println!(
            "    - {:?} ({}): {}",
            failure.topic_title, failure.stage, failure.reason
        );
    }
    println!("  llm verifications: {}", report.llm_verifications);
    if report.cancelled {
        println!("  cancelled before completion");
    }
    println!("ok");

    Ok(())
}

async fn run_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let summaries = store.list_summaries().await?;

    if summaries.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    for summary in &summaries {
        println!(
            "{}  [{}]  {} chunk(s)  updated {}  {}",
            summary.id,
            if summary.category.is_empty() {
                "-"
            } else {
                summary.category.as_str()
            },
            summary.chunk_count,
            summary.updated_at,
            summary.title
        );
    }

    Ok(())
}

async fn run_get(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config).await?;

    let Some(document) = store.get(id).await? else {
        println!("Document not found: {}", id);
        std::process::exit(1);
    };

    let chunks = store.get_chunks(id).await?;

    println!("id:        {}", document.id);
    println!("title:     {}", document.title);
    println!("category:  {}", document.category);
    println!("mode:      {}", document.mode);
    println!("created:   {}", document.created_at);
    println!("updated:   {}", document.updated_at);
    if !document.keywords.is_empty() {
        println!("keywords:  {}", document.keywords.join(", "));
    }
    println!("chunks:    {}", chunks.len());
    for chunk in &chunks {
        println!(
            "  [{}] {} tokens, embedding: {}",
            chunk.chunk_index,
            chunk.token_count,
            chunk
                .embedding
                .as_ref()
                .map(|e| format!("{} dims", e.len()))
                .unwrap_or_else(|| "missing".to_string())
        );
    }
    println!("merges:    {}", document.merge_history.len());
    for record in &document.merge_history {
        println!("  - {:?} at {}", record.topic_title, record.merged_at);
    }
    println!();
    println!("{}", document.summary);

    Ok(())
}
