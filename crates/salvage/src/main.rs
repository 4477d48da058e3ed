//! `salvage`: recycle chunks of a target build from installed builds.
//!
//! # Usage
//!
//! ```text
//! salvage scan -c salvage.toml                   # what can be recycled
//! salvage scan -t new.manifest -i /games/1.9=old.manifest
//! salvage recycle -c salvage.toml                # replay the installer's reads
//! salvage recycle --overflow-dir /tmp/salvage    # spill booted chunks to disk
//! ```

mod config;
mod pipeline;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use config::{CliConfig, InstalledSection};
use pipeline::Pipeline;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "salvage",
    version,
    about = "Recycle chunks of a patch target from previously installed builds"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the target build manifest.
    #[arg(short, long, global = true)]
    target: Option<PathBuf>,

    /// Installed build as `<root>=<manifest>`. Can be given multiple
    /// times; replaces the configured list.
    #[arg(short, long, global = true)]
    installed: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report which target chunks the installed builds can produce.
    Scan,

    /// Replay the target's chunk references through the install source.
    Recycle {
        /// Override the in-memory store size (in chunks).
        #[arg(short, long)]
        memory_chunks: Option<usize>,

        /// Directory for chunks booted out of memory.
        #[arg(short, long)]
        overflow_dir: Option<PathBuf>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    // CLI args override config file values.
    if let Some(target) = cli.target {
        config.builds.target = Some(target);
    }
    if !cli.installed.is_empty() {
        config.builds.installed = cli
            .installed
            .iter()
            .map(|s| parse_installed(s))
            .collect::<Result<_>>()?;
    }

    match cli.command {
        Commands::Scan => cmd_scan(&config),
        Commands::Recycle {
            memory_chunks,
            overflow_dir,
        } => {
            if memory_chunks.is_some() {
                config.store.memory_chunks = memory_chunks;
            }
            if overflow_dir.is_some() {
                config.store.overflow_dir = overflow_dir;
            }
            cmd_recycle(&config)
        }
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Parse `<root>=<manifest>`.
fn parse_installed(s: &str) -> Result<InstalledSection> {
    let Some((root, manifest)) = s.split_once('=') else {
        bail!("expected <root>=<manifest>, got {s:?}");
    };
    if root.is_empty() || manifest.is_empty() {
        bail!("expected <root>=<manifest>, got {s:?}");
    }
    Ok(InstalledSection {
        root: PathBuf::from(root),
        manifest: PathBuf::from(manifest),
    })
}

// -----------------------------------------------------------------------
// salvage scan
// -----------------------------------------------------------------------

fn cmd_scan(config: &CliConfig) -> Result<()> {
    let pipeline = Pipeline::build(config)?;
    let report = pipeline.scan();

    println!("Required chunks: {}", report.required);
    for (root, producible) in &report.per_build {
        println!("  {} producible={producible}", root.display());
    }
    let percent = if report.required == 0 {
        0.0
    } else {
        report.available as f64 * 100.0 / report.required as f64
    };
    println!(
        "Recyclable: {} chunks ({percent:.1}%), {:.1} MB",
        report.available,
        report.available_bytes as f64 / 1_048_576.0,
    );
    Ok(())
}

// -----------------------------------------------------------------------
// salvage recycle
// -----------------------------------------------------------------------

fn cmd_recycle(config: &CliConfig) -> Result<()> {
    info!(
        batch_min = config.batch_fetch_minimum(),
        batch_max = config.batch_fetch_maximum(),
        memory_chunks = config.memory_chunks(),
        "starting recycle"
    );
    let pipeline = Pipeline::build(config)?;
    let report = pipeline.recycle();
    let stats = report.stats;

    println!("References:      {}", report.references);
    println!("  served:        {}", report.served);
    println!("  missing:       {}", report.missing);
    println!("  mismatched:    {}", report.mismatched);
    println!("Install source:");
    println!("  batches:       {}", stats.batches);
    println!("  recycled:      {}", stats.chunks_recycled);
    println!("  failed:        {}", stats.chunks_failed);
    println!("  reads:         {}", stats.fragment_reads);
    println!("  bytes read:    {}", stats.bytes_read);
    println!("Store:");
    println!("  booted:        {}", report.booted);
    println!("  cleaned:       {}", report.cleaned);
    println!("  lost:          {}", report.lost);

    if report.mismatched > 0 {
        bail!("{} recycled chunks did not match the target", report.mismatched);
    }
    Ok(())
}
