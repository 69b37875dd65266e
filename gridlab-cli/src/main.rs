//! GridLab CLI: fetch datasets, inspect manifests, merge per-phase tables.
//!
//! Commands:
//! - `fetch`: load one (dataset, season) and print a summary or the rows
//! - `manifest`: show discovered release assets for a dataset
//! - `merged`: load a merge group and print rows joined on season|week|team
//! - `datasets`: list registered datasets and merge groups

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gridlab_core::data::{season_label, HttpTransport, Row};
use gridlab_core::{AcquisitionConfig, AcquisitionService};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridlab", about = "GridLab CLI: tiered sports-statistics acquisition")]
struct Cli {
    /// TOML configuration file. Environment overrides still apply.
    #[arg(long, global = true, env = "GRIDLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG takes precedence).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a dataset for one season and summarize it.
    Fetch {
        /// Dataset name (see `gridlab datasets`).
        dataset: String,

        /// Season year, or `all`. Defaults to the configured current season.
        #[arg(long)]
        season: Option<String>,

        /// Print rows as JSON lines instead of a summary.
        #[arg(long, default_value_t = false)]
        rows: bool,

        /// Maximum rows printed with --rows.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the discovered manifest and the candidate chain for a dataset.
    Manifest {
        dataset: String,

        /// Season whose candidates are listed.
        #[arg(long)]
        season: Option<String>,
    },
    /// Load a merge group and print rows joined on season|week|team.
    Merged {
        /// Merge group (or single dataset) name.
        group: String,

        #[arg(long)]
        season: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List registered datasets and merge groups.
    Datasets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    let current = config.season.current_season;
    let transport = Arc::new(HttpTransport::new()?);
    let service = AcquisitionService::new(config, transport)?;

    match cli.command {
        Commands::Fetch {
            dataset,
            season,
            rows,
            limit,
        } => run_fetch(&service, &dataset, parse_season(season.as_deref(), current)?, rows, limit).await,
        Commands::Manifest { dataset, season } => {
            run_manifest(&service, &dataset, parse_season(season.as_deref(), current)?).await
        }
        Commands::Merged { group, season, limit } => {
            run_merged(&service, &group, parse_season(season.as_deref(), current)?, limit).await
        }
        Commands::Datasets => {
            run_datasets(&service);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<AcquisitionConfig> {
    let mut config = match path {
        Some(path) => AcquisitionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AcquisitionConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// `None` → current season; `all` → the ALL key.
fn parse_season(arg: Option<&str>, current: i32) -> Result<Option<i32>> {
    match arg {
        None => Ok(Some(current)),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
        Some(s) => match s.parse::<i32>() {
            Ok(year) if (1920..=2100).contains(&year) => Ok(Some(year)),
            _ => bail!("invalid season '{s}': expected a year or 'all'"),
        },
    }
}

async fn run_fetch(service: &AcquisitionService, name: &str, season: Option<i32>, rows: bool, limit: usize) -> Result<()> {
    let dataset = service.load_dataset(name, season).await?;

    if rows {
        for row in dataset.rows.iter().take(limit) {
            println!("{}", serde_json::to_string(row)?);
        }
        return Ok(());
    }

    let columns = dataset.rows.first().map(|r| r.len()).unwrap_or(0);
    println!("Dataset:  {}", dataset.name);
    println!("Season:   {}", season_label(dataset.season));
    println!("Rows:     {}", dataset.len());
    println!("Columns:  {columns}");
    println!("Origin:   {:?}", dataset.source.origin);
    println!("Source:   {}", dataset.source.url);
    println!("Checksum: {}", dataset.checksum);
    Ok(())
}

async fn run_manifest(service: &AcquisitionService, name: &str, season: Option<i32>) -> Result<()> {
    let manifest = service.manifest(name).await?;

    println!("Dataset: {}  (tag {})", manifest.dataset, manifest.tag);
    println!("Source:  {}", manifest.source);
    if let Some(error) = &manifest.error {
        println!("Error:   {error}");
    }
    println!();
    println!("{:<8} {:<40} {:>12} {:<20}", "Season", "Asset", "Size", "Updated");
    println!("{}", "-".repeat(84));
    for entry in &manifest.entries {
        println!(
            "{:<8} {:<40} {:>12} {:<20}",
            season_label(entry.season),
            entry.name,
            format_size(entry.size),
            entry.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Candidates for season {}:", season_label(season));
    for (i, candidate) in service.candidates(name, season).await?.iter().enumerate() {
        println!("  {}. {:?}  {}", i + 1, candidate.origin, candidate.url);
    }
    Ok(())
}

async fn run_merged(service: &AcquisitionService, group: &str, season: Option<i32>, limit: usize) -> Result<()> {
    let merged = service.load_merged_by_key(group, season).await?;
    eprintln!("{} keys", merged.len());
    for (key, row) in merged.iter().take(limit) {
        println!("{key}\t{}", render_row(row)?);
    }
    Ok(())
}

fn run_datasets(service: &AcquisitionService) {
    let registry = service.registry();
    println!("{:<14} {:<14} {:<10} {:>8}  {}", "Dataset", "Tag", "Class", "Min rows", "Decode");
    println!("{}", "-".repeat(64));
    for spec in registry.specs() {
        println!(
            "{:<14} {:<14} {:<10} {:>8}  {:?}",
            spec.name,
            spec.provider_tag,
            format!("{:?}", spec.class),
            spec.min_rows,
            spec.decode
        );
    }
    println!();
    for group in registry.merge_group_names() {
        if let Ok(members) = registry.merge_group(group) {
            println!("{group}: {}", members.join(", "));
        }
    }
}

fn render_row(row: &Row) -> Result<String> {
    Ok(serde_json::to_string(row)?)
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
