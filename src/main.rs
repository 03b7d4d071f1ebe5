// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::ProgressBar;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use assetsync::{AssetCache, CacheEvent, CacheInspection, SyncConfig, SyncError, SyncReport};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error, or a cache that failed verification
    pub const ERROR: i32 = 1;
    /// Data error - the origin served a malformed version, manifest or image
    pub const DATA_ERR: i32 = 65;
    /// Service unavailable - origin unreachable or refusing requests
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Internal software error - a background task died
    pub const SOFTWARE: i32 = 70;
    /// I/O error - the cache directory could not be read or written
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - cache locked, or some assets need another sync
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
mod spinner {
    use colored::Colorize;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ");
        // The template is a literal; fall back to the default look if it ever fails.
        match style.clone().template("{spinner:.cyan} {msg}") {
            Ok(styled) => spinner.set_style(styled),
            Err(_) => spinner.set_style(style),
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    pub fn finish_success(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("{} {}", "[OK]".green(), message);
    }

    pub fn finish_warning(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("{} {}", "[!]".yellow(), message);
    }

    pub fn finish_error(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        eprintln!("{} {}", "[X]".red(), message);
    }
}

#[derive(Parser)]
#[command(name = "assetsync")]
#[command(version = VERSION)]
#[command(about = "Keep a local image asset cache in sync with a remote catalog.")]
#[command(long_about = "assetsync - Local image asset cache\n\n\
    Sync with an origin:   assetsync sync --origin https://cdn.example.com/game\n\
    Check the cache:       assetsync verify\n\
    Show cache state:      assetsync status (or: assetsync s)\n\
    Write a config file:   assetsync init --origin https://cdn.example.com/game\n\n\
    Settings are read from ~/.assetsync/config.json; flags override them.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.assetsync/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode: warnings and errors only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: per-asset debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download new and changed assets, delete orphans, load the rest
    Sync {
        /// Base URL of the remote catalog
        #[arg(long)]
        origin: Option<String>,

        /// Cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Downloads in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Attempts per asset before it is left for the next sync
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Print the sync report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that every asset in the local manifest is on disk
    Verify {
        /// Cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Write a config file so later commands need no flags
    Init {
        /// Base URL of the remote catalog
        #[arg(long)]
        origin: String,

        /// Cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Replace an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Show the local version, asset count and any interrupted sync
    #[command(alias = "s")]
    Status {
        /// Cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_directive = if verbose {
        "assetsync=debug"
    } else if quiet {
        "assetsync=warn"
    } else {
        "assetsync=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.command {
        // Init must work even when the existing file is unreadable.
        Commands::Init { .. } => SyncConfig::default(),
        _ => match SyncConfig::load(cli.config.as_deref()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{} {:#}", "[X]".red(), e);
                return Ok(CONFIG);
            }
        },
    };

    match cli.command {
        Commands::Sync { origin, cache_dir, concurrency, max_attempts, json } => {
            if let Some(origin) = origin {
                config.origin = origin;
            }
            if let Some(dir) = cache_dir {
                config.cache_dir = dir;
            }
            if let Some(n) = concurrency {
                config.max_concurrent_downloads = n;
            }
            if let Some(n) = max_attempts {
                config.max_download_attempts = n;
            }

            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(handle_sync(config, json, cli.quiet))
        }
        Commands::Verify { cache_dir } => {
            Ok(handle_verify(&cache_dir.unwrap_or(config.cache_dir), cli.quiet))
        }
        Commands::Status { cache_dir, json } => {
            handle_status(&cache_dir.unwrap_or(config.cache_dir), json)
        }
        Commands::Init { origin, cache_dir, force } => {
            handle_init(cli.config.as_deref(), &origin, cache_dir.as_deref(), force)
        }
    }
}

async fn handle_sync(config: SyncConfig, json: bool, quiet: bool) -> Result<i32> {
    let cache = match AssetCache::with_http(config) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            return Ok(exit_code_for(&e));
        }
    };

    let progress = (!json && !quiet).then(|| spinner::create("Checking catalog version..."));
    let tracker = progress
        .clone()
        .map(|pb| tokio::spawn(track_progress(cache.subscribe(), pb)));

    let result = cache.sync().await;
    if let Some(tracker) = tracker {
        tracker.abort();
    }

    match result {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if let Some(pb) = &progress {
                print_summary(pb, &report);
            } else if report.is_degraded() {
                eprintln!(
                    "{} {} assets failed; rerun to retry them",
                    "[!]".yellow(),
                    report.failures.len()
                );
            }
            Ok(if report.is_degraded() { TEMP_FAIL } else { SUCCESS })
        }
        Err(e) => {
            match &progress {
                Some(pb) => spinner::finish_error(pb, &format!("Sync failed: {}", e)),
                None => eprintln!("{} Sync failed: {}", "[X]".red(), e),
            }
            Ok(exit_code_for(&e))
        }
    }
}

async fn track_progress(mut events: broadcast::Receiver<CacheEvent>, pb: ProgressBar) {
    let mut queued = 0u64;
    let mut finished = 0u64;
    loop {
        match events.recv().await {
            Ok(CacheEvent::Queued { .. }) => queued += 1,
            Ok(CacheEvent::Finished { stage, path }) => {
                finished += 1;
                pb.set_message(format!("[{}/{}] {} {}", finished, queued, stage, path));
            }
            Ok(CacheEvent::Retrying { path, attempt, delay_ms, .. }) => {
                pb.set_message(format!(
                    "{} retrying {} in {} (attempt {})",
                    "[!]".yellow(),
                    path,
                    format_duration(Duration::from_millis(delay_ms)),
                    attempt + 1
                ));
            }
            Ok(CacheEvent::Failed { .. }) => finished += 1,
            Ok(CacheEvent::Ready) | Ok(CacheEvent::SyncFailed { .. }) => break,
            Ok(CacheEvent::Started { .. }) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_summary(pb: &ProgressBar, report: &SyncReport) {
    let elapsed = format_duration(Duration::from_millis(report.elapsed_ms));
    let headline = if report.short_circuited {
        format!("Version {} unchanged, loaded {} assets from disk in {}", report.version, report.loaded, elapsed)
    } else {
        format!("Synced version {} in {}", report.version, elapsed)
    };

    if report.is_degraded() {
        spinner::finish_warning(pb, &headline);
    } else {
        spinner::finish_success(pb, &headline);
    }

    if report.recovered {
        println!("     {}", "resumed an interrupted sync".dimmed());
    }
    if !report.short_circuited {
        println!(
            "     downloaded {}, loaded {}, deleted {}",
            report.downloaded.to_string().cyan(),
            report.loaded.to_string().cyan(),
            report.deleted.to_string().cyan()
        );
    }
    if report.is_degraded() {
        println!(
            "     {} assets failed and will be retried on the next sync:",
            report.failures.len().to_string().yellow()
        );
        for failure in &report.failures {
            println!(
                "       - {} ({}, {} attempts): {}",
                failure.path.bold(),
                failure.stage,
                failure.attempts,
                failure.reason.dimmed()
            );
        }
    }
}

fn handle_init(path: Option<&Path>, origin: &str, cache_dir: Option<&Path>, force: bool) -> Result<i32> {
    let Some(path) = path.map(Path::to_path_buf).or_else(SyncConfig::default_path) else {
        eprintln!("{} No home directory; pass --config to choose a file", "[X]".red());
        return Ok(CONFIG);
    };
    if path.exists() && !force {
        eprintln!(
            "{} {} already exists; pass --force to replace it",
            "[!]".yellow(),
            path.display()
        );
        return Ok(CONFIG);
    }

    let mut config = SyncConfig::default();
    config.origin = origin.trim_end_matches('/').to_string();
    if let Some(dir) = cache_dir {
        config.cache_dir = dir.to_path_buf();
    }
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "[X]".red(), e);
        return Ok(CONFIG);
    }

    config.save(&path)?;
    println!("{} Wrote {}", "[OK]".green(), path.display());
    println!("     origin:    {}", config.origin.cyan());
    println!("     cache dir: {}", config.cache_dir.display());
    Ok(SUCCESS)
}

fn handle_verify(cache_dir: &Path, quiet: bool) -> i32 {
    let inspection = CacheInspection::read(cache_dir);

    if inspection.intact {
        if !quiet {
            println!(
                "{} {} assets present in {}",
                "[OK]".green(),
                inspection.listed,
                cache_dir.display()
            );
        }
        return SUCCESS;
    }

    if inspection.version.is_none() {
        println!(
            "{} No completed sync recorded in {}",
            "[!]".yellow(),
            cache_dir.display()
        );
    }
    if !inspection.missing.is_empty() {
        println!(
            "{} {} of {} assets missing:",
            "[X]".red(),
            inspection.missing.len(),
            inspection.listed
        );
        for path in &inspection.missing {
            println!("       - {}", path);
        }
    }
    ERROR
}

fn handle_status(cache_dir: &Path, json: bool) -> Result<i32> {
    let inspection = CacheInspection::read(cache_dir);
    if json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
        return Ok(SUCCESS);
    }

    println!("{}", "Asset cache".bold());
    println!("  Directory:   {}", cache_dir.display());
    match &inspection.version {
        Some(marker) => {
            let synced = marker
                .synced_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("  Version:     {} (synced {})", marker.version.cyan(), synced);
        }
        None => println!("  Version:     {}", "none".dimmed()),
    }
    println!("  Assets:      {}", inspection.listed);
    if !inspection.missing.is_empty() {
        println!("  Missing:     {}", inspection.missing.len().to_string().red());
    }
    if inspection.interrupted {
        println!("  {}", "An interrupted sync will resume on the next run".yellow());
    }
    Ok(SUCCESS)
}

fn exit_code_for(err: &SyncError) -> i32 {
    match err {
        SyncError::Config(_) => CONFIG,
        SyncError::Transport { .. } | SyncError::Status { .. } | SyncError::TooLarge { .. } => {
            SERVICE_UNAVAILABLE
        }
        SyncError::Parse { .. } | SyncError::Decode { .. } | SyncError::InvalidManifest(_) => DATA_ERR,
        SyncError::Io { .. } => IO_ERR,
        SyncError::Lock(_) | SyncError::Busy(_) => TEMP_FAIL,
        SyncError::Task(_) => SOFTWARE,
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs >= 1 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
