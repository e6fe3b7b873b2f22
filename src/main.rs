//! Binary entry point for bookshelf.
//!
//! Runs the HTTP service and a few maintenance commands against the
//! configured store.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use bookshelf::config::{BookshelfConfig, StoreBackend};
use bookshelf::http;
use bookshelf::observability::{self, InitOptions};
use bookshelf::storage::{MemoryStore, RedisStore};
use bookshelf::{BookStore, ConnectionManager, KeyValueStore, ReconnectPolicy};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Bookshelf - a small record-keeping service for books.
#[derive(Parser)]
#[command(name = "bookshelf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service.
    Serve {
        /// Address to bind.
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to bind.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check that the store is reachable.
    Ping,

    /// Remove ordering-index entries whose record no longer exists.
    Reconcile,

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BookshelfConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let expose_metrics = matches!(cli.command, Commands::Serve { .. });
    if let Err(e) = observability::init(
        &config.logging,
        &config.metrics,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: expose_metrics,
        },
    ) {
        eprintln!("Failed to initialize observability: {e}");
        return ExitCode::FAILURE;
    }
    for warning in &config.load_warnings {
        tracing::warn!(%warning, "Configuration problem ignored");
    }

    match run_command(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command against the configured backend.
async fn run_command(command: Commands, config: BookshelfConfig) -> anyhow::Result<()> {
    if matches!(command, Commands::Config) {
        cmd_config(&config);
        return Ok(());
    }

    match config.store.backend {
        StoreBackend::Redis => {
            let store =
                RedisStore::from_config(&config.store).context("invalid Redis configuration")?;
            run_with_store(store, command, config).await
        },
        StoreBackend::Memory => run_with_store(MemoryStore::new(), command, config).await,
    }
}

async fn run_with_store<S: KeyValueStore>(
    store: S,
    command: Commands,
    config: BookshelfConfig,
) -> anyhow::Result<()> {
    let manager = Arc::new(ConnectionManager::new(
        store,
        ReconnectPolicy::from(config.reconnect),
    ));

    let result = match command {
        Commands::Serve { host, port } => cmd_serve(&manager, config, host, port).await,
        Commands::Ping => cmd_ping(&manager, &config).await,
        Commands::Reconcile => cmd_reconcile(&manager).await,
        Commands::Config => {
            cmd_config(&config);
            Ok(())
        },
    };

    manager.shutdown().await;
    result
}

async fn cmd_serve<S: KeyValueStore>(
    manager: &Arc<ConnectionManager<S>>,
    mut config: BookshelfConfig,
    host: Option<IpAddr>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    manager.spawn_supervisor();
    match manager.ensure_healthy().await {
        Ok(()) => tracing::info!(store = %config.store.display_target(), "Store reachable"),
        Err(e) => tracing::warn!(
            store = %config.store.display_target(),
            error = %e,
            "Store not reachable at startup, retrying in background"
        ),
    }

    let books = Arc::new(BookStore::new(Arc::clone(manager)));
    http::serve(books, &config.server, http::shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn cmd_ping<S: KeyValueStore>(
    manager: &Arc<ConnectionManager<S>>,
    config: &BookshelfConfig,
) -> anyhow::Result<()> {
    let target = config.store.display_target();
    manager
        .ensure_healthy()
        .await
        .with_context(|| format!("store at {target} is unreachable"))?;
    println!("PONG from {target}");
    Ok(())
}

async fn cmd_reconcile<S: KeyValueStore>(
    manager: &Arc<ConnectionManager<S>>,
) -> anyhow::Result<()> {
    let books = BookStore::new(Arc::clone(manager));
    let pruned = books
        .reconcile()
        .await
        .context("failed to reconcile the ordering index")?;

    if pruned.is_empty() {
        println!("No orphaned index entries");
    } else {
        for id in &pruned {
            println!("pruned {id}");
        }
        println!("Removed {} orphaned index entries", pruned.len());
    }
    Ok(())
}

fn cmd_config(config: &BookshelfConfig) {
    println!("[store]");
    println!("backend = \"{}\"", config.store.backend.as_str());
    println!("target = \"{}\"", config.store.display_target());
    println!(
        "password = {}",
        if config.store.password.is_some() {
            "\"<redacted>\""
        } else {
            "\"<unset>\""
        }
    );
    println!("timeout_ms = {}", config.store.timeout.as_millis());
    println!();
    println!("[server]");
    println!("host = \"{}\"", config.server.host);
    println!("port = {}", config.server.port);
    println!("max_body_bytes = {}", config.server.max_body_bytes);
    println!();
    println!("[reconnect]");
    println!("interval_secs = {}", config.reconnect.interval.as_secs());
    println!("max_attempts = {}", config.reconnect.max_attempts);
    println!();
    println!("[logging]");
    println!("format = \"{}\"", config.logging.format.as_str());
    println!("filter = \"{}\"", config.logging.filter);
    println!();
    println!("[metrics]");
    println!("enabled = {}", config.metrics.enabled);
    println!("port = {}", config.metrics.port);
}
