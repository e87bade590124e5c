//! `librarian` command-line entrypoint.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `librarian serve` | Start the HTTP API and background workers |
//! | `librarian ingest <dir>` | Submit every file under a directory and wait for the jobs |
//! | `librarian search "<query>"` | Search the index (optionally ingesting a directory first) |
//! | `librarian generate "<prompt>"` | Route a prompt through the provider chain |

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use librarian::{
    api,
    config::{self, Config},
    jobs::JobStatus,
    logging,
    retrieval::SearchQuery,
    service::{Librarian, LibrarianApi, ServiceError, SubmitRequest},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use uuid::Uuid;
use walkdir::WalkDir;

/// Document ingestion, indexing, and retrieval.
#[derive(Parser)]
#[command(name = "librarian", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API with background workers.
    Serve,
    /// Submit every file under a directory and wait until all jobs settle.
    Ingest {
        /// Directory (or single file) to ingest.
        path: PathBuf,
        #[command(flatten)]
        options: IngestOptions,
    },
    /// Search indexed chunks.
    Search {
        /// Free-text query.
        query: String,
        /// Number of hits.
        #[arg(short, long, default_value_t = 5)]
        k: usize,
        /// Keep only chunks with an entity of this type (repeatable).
        #[arg(long = "entity-type")]
        entity_types: Vec<String>,
        /// Ingest this directory before searching.
        #[arg(long)]
        from: Option<PathBuf>,
        /// Blend in keyword matches; weight of the vector score in `[0, 1]`.
        #[arg(long)]
        hybrid: Option<f32>,
        /// Answer the query with the provider chain instead of listing hits.
        #[arg(long)]
        answer: bool,
    },
    /// Route a prompt through the provider chain.
    Generate {
        /// Prompt text.
        prompt: String,
    },
}

#[derive(Args, Clone)]
struct IngestOptions {
    /// Chunk size in characters (defaults to `DEFAULT_CHUNK_SIZE`).
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Chunk overlap in characters (defaults to `DEFAULT_CHUNK_OVERLAP`).
    #[arg(long)]
    chunk_overlap: Option<usize>,
    /// Minimum entity confidence (defaults to `DEFAULT_CONFIDENCE_THRESHOLD`).
    #[arg(long)]
    confidence_threshold: Option<f32>,
    /// Store a summary for every document.
    #[arg(long)]
    summarize: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_config();
    logging::init_tracing();
    let mut config = config::get_config().clone();
    // Paths named on the command line are readable even outside LIBRARIAN_DOCUMENT_ROOT.
    if let Some(path) = ingest_path(&cli.command) {
        let path = std::fs::canonicalize(path)
            .with_context(|| format!("{} does not exist", path.display()))?;
        config.document_root = match path.parent() {
            Some(parent) if path.is_file() => parent.to_path_buf(),
            _ => path,
        };
    }
    let librarian = Arc::new(
        Librarian::from_config(&config)
            .await
            .context("failed to assemble librarian")?,
    );

    match cli.command {
        Commands::Serve => serve(&config, librarian).await,
        Commands::Ingest { path, options } => {
            let ids = ingest(&librarian, &path, &options).await?;
            print_statuses(&librarian, &ids).await
        }
        Commands::Search {
            query,
            k,
            entity_types,
            from,
            hybrid,
            answer,
        } => {
            if let Some(path) = from {
                let options = IngestOptions {
                    chunk_size: None,
                    chunk_overlap: None,
                    confidence_threshold: None,
                    summarize: false,
                };
                ingest(&librarian, &path, &options).await?;
            }
            let query = SearchQuery {
                text: query,
                k,
                entity_types,
                document_ids: Vec::new(),
                hybrid,
            };
            if answer {
                let answer = librarian.answer(query).await?;
                println!("{}", answer.text);
                for (rank, source) in answer.sources.iter().enumerate() {
                    println!("  [{}] {} ({})", rank + 1, source.document_id, source.chunk_id);
                }
            } else {
                for hit in librarian.search(query).await? {
                    println!("{:.4}\t{}\t{}", hit.score, hit.document_id, hit.chunk_id);
                }
            }
            Ok(())
        }
        Commands::Generate { prompt } => {
            let generated = librarian.generate(prompt, None).await?;
            println!("{}", generated.text);
            Ok(())
        }
    }
}

fn ingest_path(command: &Commands) -> Option<&Path> {
    match command {
        Commands::Ingest { path, .. }
        | Commands::Search {
            from: Some(path), ..
        } => Some(path.as_path()),
        _ => None,
    }
}

async fn serve(config: &Config, librarian: Arc<Librarian>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = librarian.spawn_workers(shutdown_rx);
    let app = api::create_router(librarian.clone());

    let (listener, port) = bind_listener(config)
        .await
        .context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server terminated unexpectedly")?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

async fn bind_listener(config: &Config) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}

/// Submit every regular file under `path`, run workers until all jobs are terminal.
async fn ingest(
    librarian: &Arc<Librarian>,
    path: &Path,
    options: &IngestOptions,
) -> Result<Vec<Uuid>> {
    let path = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("{} does not exist", path.display()))?;

    let mut ids = Vec::new();
    for entry in WalkDir::new(&path).follow_links(true) {
        let entry = entry.with_context(|| format!("failed to walk {}", path.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let document_ref = entry.path().to_string_lossy().into_owned();
        let submitted = librarian
            .submit(SubmitRequest {
                document_ref: Some(document_ref.clone()),
                text: None,
                chunk_size: options.chunk_size,
                chunk_overlap: options.chunk_overlap,
                confidence_threshold: options.confidence_threshold,
                entity_types: Vec::new(),
                summarize: options.summarize,
            })
            .await;
        let id = match submitted {
            Ok(id) => id,
            Err(ServiceError::InvalidRequest(reason)) => {
                tracing::warn!(document = %document_ref, %reason, "Skipped document");
                continue;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to submit {document_ref}"));
            }
        };
        tracing::debug!(job_id = %id, document = %document_ref, "Submitted");
        ids.push(id);
    }
    tracing::info!(jobs = ids.len(), "Submitted documents");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = librarian.spawn_workers(shutdown_rx);
    let poll = config::get_config().worker_poll_interval;
    loop {
        let mut settled = true;
        for id in &ids {
            if !librarian.status(*id).await?.status.is_terminal() {
                settled = false;
                break;
            }
        }
        if settled {
            break;
        }
        tokio::time::sleep(poll).await;
    }
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(ids)
}

async fn print_statuses(librarian: &Librarian, ids: &[Uuid]) -> Result<()> {
    let mut failed = 0usize;
    for id in ids {
        let snapshot = librarian.status(*id).await?;
        let detail = match (&snapshot.result, &snapshot.error) {
            (Some(result), _) => format!(
                "{} chunks, {} entities",
                result.chunk_count, result.entity_count
            ),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        if snapshot.status != JobStatus::Succeeded {
            failed += 1;
        }
        println!(
            "{}\t{}\t{}\t{}",
            snapshot.status, snapshot.attempt, snapshot.document_ref, detail
        );
    }
    if failed > 0 {
        bail!("{failed} of {} documents did not succeed", ids.len());
    }
    Ok(())
}
