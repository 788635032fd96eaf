use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod chart;
mod collector;
mod config;
mod errlog;
mod error;
mod probe;
mod sample;
mod schedule;
mod shell;
mod stats;
mod store;

use collector::Collector;
use config::AppConfig;
use errlog::ErrorLog;
use probe::CloudflareProbe;
use sample::Sample;
use stats::Degraded;
use store::SampleStore;

const DEBUG_LOG_NAME: &str = "speedlog_debug.log";

#[derive(Parser, Debug)]
#[command(author, version, about = "Internet speed logger with hour-of-day charts", long_about = None)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/speedlog/config.toml)
    #[arg(short = 'C', long, global = true)]
    config: Option<PathBuf>,

    /// Sample log file
    #[arg(short, long, global = true)]
    data: Option<PathBuf>,

    /// Chart output file (.png or .svg)
    #[arg(long, global = true)]
    chart: Option<PathBuf>,

    /// Error log file
    #[arg(long, global = true)]
    error_log: Option<PathBuf>,

    /// Auto-test interval in minutes (1-120)
    #[arg(short, long, global = true)]
    interval: Option<u32>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run one speed test and record it
    Measure,
    /// Statistics for the most recent stored sample
    Stats,
    /// Render the hour-of-day scatter chart
    Plot,
    /// Print stored samples
    History {
        /// Only the last N samples
        #[arg(short = 'n', long)]
        last: Option<usize>,
    },
    /// Show the effective configuration
    Config {
        /// Write a config file with every default spelled out
        #[arg(long)]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(long)]
        force: bool,
    },
    /// Interactive terminal UI (the default)
    Tui,
}

fn init_logging(args: &Args, tui: bool) -> Result<()> {
    let default_level = if args.quiet { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if tui {
        // The terminal belongs to ratatui, so logs go to a file.
        let path = std::env::temp_dir().join(DEBUG_LOG_NAME);
        let file = File::create(&path)
            .with_context(|| format!("creating debug log {}", path.display()))?;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Command::Tui);
    let tui = matches!(command, Command::Tui);
    init_logging(&args, tui)?;

    let config_path = args.config.clone().unwrap_or_else(AppConfig::config_path);

    if let Command::Config { init: true, force } = command {
        return write_config_template(&config_path, force);
    }

    let config_file_exists = config_path.exists();
    let mut config = AppConfig::load_or_default(&config_path);

    // First interactive run: leave a template behind so there is something
    // to edit (and watch) while the UI is up.
    if tui && !config_file_exists && args.config.is_none() {
        match config.save(&config_path) {
            Ok(()) => tracing::info!("Wrote default config to {}", config_path.display()),
            Err(e) => tracing::warn!("Could not write default config: {}", e),
        }
    }

    if config.merge_with_args(&args) {
        tracing::debug!("Command-line overrides applied");
    }

    match command {
        Command::Measure => measure(&config, args.json),
        Command::Stats => show_stats(&config, args.json),
        Command::Plot => plot(&config, args.json),
        Command::History { last } => history(&config, last, args.json),
        Command::Config { .. } => show_config(&config, &config_path, args.json),
        Command::Tui => {
            let runtime = tokio::runtime::Runtime::new()?;
            let result = shell::run(&runtime, config, config_path, args.quiet);
            // Let in-flight tests finish their appends briefly, then drop them.
            runtime.shutdown_timeout(std::time::Duration::from_secs(2));
            result
        }
    }
}

fn measure(config: &AppConfig, json: bool) -> Result<()> {
    let errlog = ErrorLog::new(&config.storage.error_log);
    let store = Arc::new(SampleStore::new(&config.storage.data_file));
    let collector = Collector::new(CloudflareProbe::new(&config.probe)?, Arc::clone(&store));

    if !json {
        eprintln!("Testing internet speed, please wait...");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let sample = match runtime.block_on(collector.collect()) {
        Ok(sample) => sample,
        Err(e) => {
            errlog.record(format!("Speed test failed: {}", e));
            bail!(
                "an error occurred during the speed test; check {}",
                errlog.path().display()
            );
        }
    };

    let snapshot = stats::aggregate(&store, &sample);
    if snapshot.is_degraded() {
        tracing::info!("Partial statistics: {:?}", snapshot.degraded);
    }
    if let Some(Degraded::Unreadable(reason)) = &snapshot.degraded {
        errlog.record(format!("Error reading/parsing data: {}", reason));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot);
    }
    Ok(())
}

fn show_stats(config: &AppConfig, json: bool) -> Result<()> {
    let store = SampleStore::new(&config.storage.data_file);
    let samples = load_readable(&store)?;
    let latest = samples
        .last()
        .ok_or_else(|| anyhow!("no readable samples in {}", store.path().display()))?;

    let snapshot = stats::aggregate(&store, latest);
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot);
    }
    Ok(())
}

/// Records that parse. Damaged lines are reported on stderr and skipped.
fn load_readable(store: &SampleStore) -> Result<Vec<Sample>> {
    let (samples, skipped) = store
        .load_lossy()
        .with_context(|| format!("reading {}", store.path().display()))?;
    if !skipped.is_empty() {
        eprintln!(
            "Skipped {} unreadable record(s) in {}",
            skipped.len(),
            store.path().display()
        );
    }
    Ok(samples)
}

fn plot(config: &AppConfig, json: bool) -> Result<()> {
    let errlog = ErrorLog::new(&config.storage.error_log);
    let store = SampleStore::new(&config.storage.data_file);

    match chart::render(&store, &config.chart, &config.storage.chart_file) {
        Ok(rendered) => {
            if json {
                let summary = serde_json::json!({
                    "path": rendered.path,
                    "points": rendered.points,
                    "mean_download_mbps": rendered.mean_download,
                    "mean_upload_mbps": rendered.mean_upload,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Scatter plot saved to {} ({} samples)",
                    rendered.path.display(),
                    rendered.points
                );
            }
            Ok(())
        }
        Err(e) => {
            errlog.record(format!("Failed to generate plot: {}", e));
            Err(e.into())
        }
    }
}

fn history(config: &AppConfig, last: Option<usize>, json: bool) -> Result<()> {
    let store = SampleStore::new(&config.storage.data_file);
    let samples = load_readable(&store)?;
    let skip = last.map_or(0, |n| samples.len().saturating_sub(n));
    let shown = &samples[skip..];

    if json {
        println!("{}", serde_json::to_string_pretty(shown)?);
        return Ok(());
    }

    for (i, sample) in shown.iter().enumerate() {
        if i > 0 {
            println!();
        }
        println!("{}", sample);
    }
    Ok(())
}

fn show_config(config: &AppConfig, path: &Path, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        println!("# {}", path.display());
        print!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

fn write_config_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    AppConfig::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
