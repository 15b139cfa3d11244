//! clipcache - short-form video preview daemon
//!
//! Watches chat messages for short-form video links, re-hosts a capped,
//! web-friendly clip for each from a size-bounded disk cache, and posts the
//! clip's link back to the channel.

mod cache;
mod chat;
mod config;
mod fetch;
mod ipc;
mod pipeline;

use anyhow::{anyhow, Context, Result};
use std::env;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cache::{spawn_sweeper, sweep, ArtifactStore, CacheStore};
use chat::{DiscordClient, LinkDetector, MessageHandler, Publisher};
use config::Config;
use fetch::YtDlpFetcher;
use ipc::IpcServer;
use pipeline::Pipeline;

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run the bot (default)
    Run,
    /// Run one eviction sweep now
    Sweep,
    /// Resolve a single link and print its preview URL
    Fetch { url: String },
    /// List stored clips
    List,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"clipcache - Short-form video preview bot

USAGE:
    clipcache [run]          # Run the bot (default)
    clipcache sweep          # Evict old clips now if over budget
    clipcache fetch <url>    # Fetch one link and print its preview URL
    clipcache list           # List stored clips, newest first
    clipcache help

ENVIRONMENT:
    DISCORD_TOKEN                 Bot token (required for run)
    PREVIEW_DIR                   Clip directory (required)
    PREVIEW_BASE_URL              Public URL prefix for clips (required)
    PREVIEW_MAX_BYTES             Store budget in bytes (default 10000000000)
    PREVIEW_TARGET_FRACTION       Fraction of budget kept after eviction (default 0.8)
    PREVIEW_SWEEP_INTERVAL_SECS   Seconds between sweeps (default 3600)
    PREVIEW_FETCH_TIMEOUT_SECS    Wall-clock limit per fetch (default 300)
    PREVIEW_YTDLP_BIN             yt-dlp executable (default yt-dlp)
    PREVIEW_SOCKET                Event socket path (default $XDG_RUNTIME_DIR/clipcache.sock)
    RUST_LOG                      Log filter (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Run);
    }

    match args[1].as_str() {
        "run" => Ok(Command::Run),
        "sweep" => Ok(Command::Sweep),
        "fetch" => {
            let url = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: clipcache fetch <url>"))?;
            Ok(Command::Fetch { url: url.clone() })
        }
        "list" => Ok(Command::List),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let token = config.require_token()?;
    let store = CacheStore::open(&config.preview_dir)?;
    // Any fetch older than the timeout has been killed already
    store.cleanup(config.fetch_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fetcher = YtDlpFetcher::new(&config.ytdlp_program, config.fetch_timeout)
        .with_shutdown(shutdown_rx.clone());
    let pipeline = Arc::new(Pipeline::new(store.clone(), Arc::new(fetcher)));

    // Identifies the bot and proves the token works
    let discord = DiscordClient::new(token)?;
    let bot = match discord.current_user().await {
        Ok(user) => user,
        Err(e) => {
            error!(error = %e, "Failed to connect to Discord");
            return Err(e.into());
        }
    };

    let handler = Arc::new(MessageHandler::new(
        pipeline,
        Arc::new(discord) as Arc<dyn Publisher>,
        LinkDetector::new()?,
        config.preview_base_url.clone(),
        bot.id,
    ));

    let sweeper = spawn_sweeper(
        Arc::new(store),
        config.capacity,
        config.sweep_interval,
        shutdown_rx.clone(),
    );

    let mut server = IpcServer::new(handler, config.capacity, config.socket_path.clone());
    if let Err(e) = server.start() {
        error!(error = %e, "Failed to start event socket");
        return Err(e);
    }
    let server_handle = tokio::spawn(async move { server.run(shutdown_rx).await });

    info!("Bot is now running. Press Ctrl+C to exit.");

    wait_for_signal().await?;

    info!("Received shutdown signal, stopping...");
    // Cancels in-flight fetches and the sweeper timer
    let _ = shutdown_tx.send(true);

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Event socket error"),
        Err(e) => error!(error = %e, "Event socket task panicked"),
    }
    if let Err(e) = sweeper.await {
        error!(error = %e, "Sweeper task panicked");
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn fetch_one(config: Config, url: &str) -> Result<()> {
    let store = CacheStore::open(&config.preview_dir)?;
    let fetcher = YtDlpFetcher::new(&config.ytdlp_program, config.fetch_timeout);
    let pipeline = Pipeline::new(store, Arc::new(fetcher));

    let artifact = pipeline
        .resolve_preview(url)
        .await
        .with_context(|| format!("No preview for {}", url))?;
    println!("{}", artifact.public_url(&config.preview_base_url));
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = CacheStore::open(&config.preview_dir)?;
    let mut artifacts = store.list_all().context("Failed to list preview store")?;
    if artifacts.is_empty() {
        println!("No clips stored.");
        return Ok(());
    }

    artifacts.sort_by(|a, b| b.modified.cmp(&a.modified));
    println!("Clips in {}:", store.root().display());
    let now = SystemTime::now();
    let total: u64 = artifacts.iter().map(|a| a.size).sum();
    for artifact in &artifacts {
        let age = now
            .duration_since(artifact.modified)
            .unwrap_or_default()
            .as_secs();
        println!("  {:<16} {:>12} bytes  {:>8}s ago", artifact.name, artifact.size, age);
    }
    println!(
        "{} clips, {} of {} bytes",
        artifacts.len(),
        total,
        config.capacity.max_bytes
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    match command {
        Command::Run => run(config).await,
        Command::Sweep => {
            let store = CacheStore::open(&config.preview_dir)?;
            let report = sweep(&store, &config.capacity)?;
            println!(
                "Store held {} bytes; removed {} clips ({} bytes)",
                report.total_before,
                report.removed.len(),
                report.freed
            );
            Ok(())
        }
        Command::Fetch { url } => fetch_one(config, &url).await,
        Command::List => list(&config),
        Command::Help => Ok(()),
    }
}
