//! # Lightning Serve CLI (`lightning-serve`)
//!
//! ## Usage
//!
//! ```bash
//! lightning-serve --config ./config/lightning.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lightning-serve serve` | Start the HTTP server |
//! | `lightning-serve bench` | Drive load against a running server |
//!
//! ## Examples
//!
//! ```bash
//! # Offline demo: no config file, hashing embedder, extractive answers
//! lightning-serve serve
//!
//! # 500 queries, 32 in flight, against a local server
//! lightning-serve bench --url http://127.0.0.1:8000 --queries 500 --concurrency 32
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lightning_serve::bench::{self, BenchOptions};
use lightning_serve::config::{self, Config};
use lightning_serve::server;

const DEFAULT_CONFIG: &str = "./config/lightning.toml";

/// Lightning Serve: a retrieval-augmented inference gateway.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lightning.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "lightning-serve", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist the built-in offline defaults
    /// are used. An explicitly given path must exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves document ingestion, queries,
    /// metrics and health endpoints until Ctrl-C.
    Serve,

    /// Send queries to a running server and report latency percentiles,
    /// throughput, error rate and cache-hit rate.
    Bench {
        /// Base URL of the server.
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        url: String,

        /// Total number of queries to send.
        #[arg(long, default_value_t = 200)]
        queries: usize,

        /// Maximum queries in flight at once.
        #[arg(long, default_value_t = 16)]
        concurrency: usize,

        /// Passages to retrieve per query.
        #[arg(long)]
        top_k: Option<usize>,

        /// Query text; repeat to cycle through several. Defaults to a
        /// built-in set.
        #[arg(long = "query")]
        query_texts: Vec<String>,

        /// Per-request timeout in seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

fn load(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        info!(path = %path.display(), "config file not found, using defaults");
        let config = Config::default();
        config::validate(&config)?;
        return Ok(config);
    }
    config::load_config(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let cfg = load(&cli.config)?;
            server::run_server(&cfg).await?;
        }
        Commands::Bench {
            url,
            queries,
            concurrency,
            top_k,
            query_texts,
            timeout_secs,
        } => {
            let texts = if query_texts.is_empty() {
                bench::DEFAULT_QUERIES.iter().map(|q| q.to_string()).collect()
            } else {
                query_texts
            };
            let options = BenchOptions {
                url,
                queries: texts,
                total: queries,
                concurrency,
                top_k,
                timeout: Duration::from_secs(timeout_secs),
            };
            info!(url = %options.url, total = options.total, concurrency, "starting benchmark");
            let report = bench::run_bench(&options).await?;
            println!("{}", report);
        }
    }

    Ok(())
}
