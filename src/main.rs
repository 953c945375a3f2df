//! CLI entry point for the mem-oracle documentation oracle.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use mem_oracle::config;
use mem_oracle::ingest::{IndexRequest, Oracle, RecoveryOptions, RefreshOptions};
use mem_oracle::search::SearchRequest;
use mem_oracle::{rpc, server};

#[derive(Parser)]
#[command(
    name = "mem-oracle",
    about = "A local documentation oracle: crawl docs sites and answer queries with hybrid retrieval",
    version
)]
struct Cli {
    /// Data directory (default: ~/.mem-oracle)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP worker API
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Serve the JSON-RPC tool protocol on stdin/stdout
    Mcp,

    /// Index a documentation site
    Index {
        /// Base URL (scheme + host), e.g. https://docs.example.com
        base_url: String,

        /// Seed path, e.g. /docs/intro
        seed: String,

        /// Display name (defaults to the host)
        #[arg(long)]
        name: Option<String>,

        /// Allowed path prefixes (defaults to the seed's directory)
        #[arg(long)]
        allowed_path: Vec<String>,

        /// Index the seed page before returning
        #[arg(long)]
        wait: bool,
    },

    /// Search indexed documentation
    Search {
        /// Search query
        query: String,

        /// Restrict to specific docset ids
        #[arg(long)]
        docset: Vec<String>,

        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show docsets and their index status
    Status,

    /// Queue docsets for re-crawl
    Refresh {
        /// Docset id (omit to refresh all)
        docset: Option<String>,

        /// Refresh even recently-updated docsets
        #[arg(long)]
        force: bool,

        /// Discard content hashes so every page re-embeds
        #[arg(long)]
        full: bool,
    },

    /// Delete a docset and everything under it
    Delete {
        /// Docset id
        docset: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mem_oracle=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(cli.data_dir)?;
    if let Commands::Serve { port: Some(port) } = &cli.command {
        cfg.worker.port = *port;
    }
    let oracle = Oracle::open(cfg).await?;

    match cli.command {
        Commands::Serve { .. } => {
            oracle.recover_from_crash(RecoveryOptions::default()).await?;
            server::run_server(oracle).await?;
        }
        Commands::Mcp => {
            oracle.recover_from_crash(RecoveryOptions::default()).await?;
            rpc::run_stdio(oracle).await?;
        }
        Commands::Index {
            base_url,
            seed,
            name,
            allowed_path,
            wait,
        } => {
            let (docset, seed_indexed) = oracle
                .index_docset(
                    IndexRequest {
                        base_url,
                        seed_path: seed,
                        name,
                        allowed_paths: if allowed_path.is_empty() {
                            None
                        } else {
                            Some(allowed_path)
                        },
                    },
                    wait,
                )
                .await?;
            println!("docset: {}", docset.id);
            println!("status: {}", docset.status.as_str());
            println!("seed indexed: {}", seed_indexed);
            if wait {
                // Give the background crawl a chance to drain before exit.
                oracle.wait_for_crawl(&docset.id, Duration::from_secs(600)).await;
                let status = oracle.store().get_index_status(&docset.id).await?;
                println!(
                    "pages: {} indexed, {} skipped, {} errors, {} chunks",
                    status.indexed_pages, status.skipped_pages, status.error_pages, status.total_chunks
                );
            }
        }
        Commands::Search { query, docset, top_k } => {
            let response = oracle
                .search(SearchRequest {
                    query,
                    docset_ids: if docset.is_empty() { None } else { Some(docset) },
                    top_k,
                    ..Default::default()
                })
                .await?;

            if response.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in response.results.iter().enumerate() {
                println!("{}. [{:.3}] {}", i + 1, hit.score, hit.url);
                if let Some(heading) = &hit.heading {
                    println!("    section: {}", heading);
                }
                let preview: String = hit.content.chars().take(160).collect();
                println!("    excerpt: \"{}\"", preview.replace('\n', " "));
                println!();
            }
            println!("total chars: {}", response.total_chars);
        }
        Commands::Status => {
            let docsets = oracle.store().list_docsets().await?;
            if docsets.is_empty() {
                println!("No docsets indexed yet.");
                return Ok(());
            }
            for docset in docsets {
                let status = oracle.store().get_index_status(&docset.id).await?;
                println!(
                    "{} [{}] {} — {}/{} pages indexed, {} pending, {} errors, {} chunks",
                    docset.name,
                    docset.id,
                    docset.status.as_str(),
                    status.indexed_pages,
                    status.total_pages,
                    status.pending_pages,
                    status.error_pages,
                    status.total_chunks,
                );
            }
        }
        Commands::Refresh { docset, force, full } => {
            let options = RefreshOptions {
                force,
                full_reindex: full,
                ..Default::default()
            };
            let plans = match docset {
                Some(id) => match oracle.refresh_docset(&id, &options).await? {
                    Some(plan) => vec![plan],
                    None => anyhow::bail!("docset not found: {}", id),
                },
                None => oracle.refresh_all(&options).await?,
            };
            for plan in plans {
                if plan.skipped {
                    println!("{}: up to date, skipped", plan.docset_id);
                } else {
                    println!(
                        "{}: {} refresh, {} pages queued ({} hashes preserved, {} cleared)",
                        plan.docset_id, plan.mode, plan.pages_queued, plan.preserved_hashes, plan.cleared_hashes
                    );
                }
            }
        }
        Commands::Delete { docset } => {
            if oracle.delete_docset(&docset).await? {
                println!("deleted {}", docset);
            } else {
                anyhow::bail!("docset not found: {}", docset);
            }
        }
    }

    Ok(())
}
