//! # codeward CLI
//!
//! | Command | Description |
//! |---------|-------------|
//! | `codeward index <path>` | Bring the project's semantic index in sync with the tree |
//! | `codeward review <path>` | Index incrementally, then review the tree for security issues |
//! | `codeward projects` | List indexed projects |
//! | `codeward remove <project>` | Delete a project and everything indexed for it |
//!
//! Reports are printed to stdout as JSON; logs go to stderr (`RUST_LOG`
//! overrides the default `info` level).
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use codeward::analyzer::Analyzer;
use codeward::config::Config;
use codeward::context::ContextAssembler;
use codeward::db::Db;
use codeward::embedder::EmbeddingClient;
use codeward::embedder::ollama::OllamaEmbedder;
use codeward::indexer::fingerprint::project_key;
use codeward::indexer::{Chunker, FileLocks, IndexReport, Indexer, ScanResult, TreeSitterParser, scan};
use codeward::llm::ollama::OllamaCompletion;
use codeward::resilience::Endpoints;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "codeward",
    version,
    about = "Incremental semantic code index with retrieval-augmented security review"
)]
struct Cli {
    /// Path to the JSON configuration file. Missing file means defaults.
    #[arg(long, global = true, default_value = "codeward.json")]
    config: String,

    /// Project key to use instead of the one derived from the repository.
    #[arg(long, global = true)]
    project_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a source tree. Only changed files are re-embedded.
    Index {
        path: PathBuf,

        /// Re-embed every file, changed or not.
        #[arg(long)]
        force: bool,
    },

    /// Review a source tree for security issues.
    Review {
        path: PathBuf,

        /// Ask the model to confirm each finding in a second pass.
        #[arg(long)]
        validate: bool,

        /// Use the index as it is instead of syncing it first.
        #[arg(long)]
        skip_index: bool,
    },

    /// List indexed projects.
    Projects,

    /// Remove a project from the index.
    Remove { project: String },
}

/// Everything a command needs, wired from the configuration.
struct Pipeline {
    config: Config,
    db: Arc<TokioMutex<Db>>,
    endpoints: Endpoints,
    embedder: EmbeddingClient,
    locks: FileLocks,
}

impl Pipeline {
    fn open(config: Config) -> Result<Self> {
        let db = Db::open(
            &config.db_path,
            &config.embedding.model,
            config.embedding.dimensions,
        )
        .with_context(|| format!("Failed to open database {}", config.db_path))?;
        if db.was_reset() {
            warn!("Embedding model changed; the next index run re-embeds every file");
        }

        let endpoints = Endpoints::from_config(&config);
        let service = Arc::new(OllamaEmbedder::new(
            &config.llm.base_url,
            &config.embedding.model,
            config.embedding.dimensions,
        ));
        let embedder = EmbeddingClient::new(
            service,
            endpoints.embedding.clone(),
            config.embedding.batch_size,
        );

        Ok(Self {
            config,
            db: Arc::new(TokioMutex::new(db)),
            endpoints,
            embedder,
            locks: FileLocks::new(),
        })
    }

    fn indexer(&self) -> Result<Indexer> {
        let parser = TreeSitterParser::new().context("Failed to load Tree-sitter grammars")?;
        Ok(Indexer::new(
            self.db.clone(),
            self.embedder.clone(),
            Chunker::from_config(&self.config.chunking),
            Arc::new(parser),
            self.locks.clone(),
            self.config.analysis.batch_size,
        ))
    }

    fn analyzer(&self) -> Analyzer {
        let context = ContextAssembler::new(
            self.db.clone(),
            self.embedder.clone(),
            self.config.analysis.near_duplicate_threshold,
        );
        let llm = Arc::new(OllamaCompletion::new(
            &self.config.llm.base_url,
            &self.config.llm.analysis_model,
        ));
        Analyzer::new(
            llm,
            self.endpoints.analysis.clone(),
            context,
            self.config.analysis.clone(),
        )
    }

    fn scan(&self, root: &Path) -> Result<ScanResult> {
        let result = scan(root, &self.config.discovery.exclusions)?;
        info!(
            "Discovered {} source files under {} ({} unreadable)",
            result.files.len(),
            root.display(),
            result.failures.len()
        );
        Ok(result)
    }

    async fn index(
        &self,
        project_id: &str,
        root: &Path,
        scanned: &ScanResult,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let report = self
            .indexer()?
            .index(project_id, root, scanned, force, cancel)
            .await?;
        Ok(report)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if cli.project_id.is_some() {
        config.project_id = cli.project_id.clone();
    }
    let pipeline = Pipeline::open(config)?;

    match cli.command {
        Commands::Index { path, force } => {
            let root = path
                .canonicalize()
                .with_context(|| format!("Cannot access {}", path.display()))?;
            let project_id = project_key(&root, pipeline.config.project_id.as_deref());
            let cancel = cancel_on_ctrl_c();

            let scanned = pipeline.scan(&root)?;
            let report = pipeline
                .index(&project_id, &root, &scanned, force, &cancel)
                .await?;
            print_json(&report)?;
            if report.aborted {
                bail!("Indexing of {project_id} was aborted");
            }
        }
        Commands::Review {
            path,
            validate,
            skip_index,
        } => {
            let root = path
                .canonicalize()
                .with_context(|| format!("Cannot access {}", path.display()))?;
            let project_id = project_key(&root, pipeline.config.project_id.as_deref());
            let cancel = cancel_on_ctrl_c();

            let scanned = pipeline.scan(&root)?;
            if !skip_index {
                let report = pipeline
                    .index(&project_id, &root, &scanned, false, &cancel)
                    .await?;
                if report.aborted {
                    print_json(&report)?;
                    bail!("Indexing of {project_id} was aborted; not reviewing");
                }
            }

            let validate = validate || pipeline.config.analysis.validate_findings;
            let report = pipeline
                .analyzer()
                .review(&project_id, &scanned.files, validate, &cancel)
                .await;
            print_json(&report)?;
            if report.metadata.aborted {
                bail!("Review of {project_id} was aborted");
            }
        }
        Commands::Projects => {
            let projects = pipeline.db.lock().await.list_projects()?;
            print_json(&projects)?;
        }
        Commands::Remove { project } => {
            let removed = pipeline.db.lock().await.delete_project(&project)?;
            if !removed {
                bail!("No project named {project}");
            }
            info!("Removed project {project}");
        }
    }

    Ok(())
}
