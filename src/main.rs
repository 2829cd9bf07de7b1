mod config;
mod db;
mod discovery;
mod error;
mod fetch;
mod journal;
mod persist;
mod render;
mod report;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::{ArtifactNaming, Settings};
use crate::discovery::DiscoveryOptions;
use crate::error::PipelineError;
use crate::fetch::FetchOptions;
use crate::persist::{PersistOutcome, RunInput, RunReport};
use crate::render::ChromeRenderer;

#[derive(Parser)]
#[command(name = "licitar", about = "Archive tender pages as HTML and screenshots, with run history in SQLite")]
struct Cli {
    /// Settings file (default: ./licitar.toml if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover tender pages, archive them and record the run
    Run {
        /// Site root to start discovery from
        #[arg(long)]
        root_url: Option<String>,
        /// Max detail pages to fetch
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Stop fetching new pages after this many seconds
        #[arg(long, value_name = "SECS")]
        deadline: Option<u64>,
        /// Artifact file naming
        #[arg(long, value_enum)]
        naming: Option<ArtifactNaming>,
    },
    /// Create the database schema and check its integrity
    Init {
        /// Delete the existing database first
        #[arg(long)]
        force: bool,
    },
    /// Show aggregate statistics
    Stats,
    /// Most recent runs
    Runs {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Most recent licitaciones with their run
    Licitaciones {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Details and metrics of the most recent run
    Last,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let result = dispatch(cli).await;

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), PipelineError> {
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            root_url,
            limit,
            deadline,
            naming,
        } => {
            if let Some(url) = root_url {
                settings.root_url = url;
            }
            if let Some(naming) = naming {
                settings.artifact_naming = naming;
            }
            run_pipeline(&settings, limit, deadline.map(Duration::from_secs)).await
        }
        Commands::Init { force } => {
            init_store(&settings.db_file(), force)?;
            Ok(())
        }
        Commands::Stats => {
            let conn = db::open_read_only(&settings.db_file())?;
            println!("{}", report::stats(&db::get_stats(&conn)?));
            Ok(())
        }
        Commands::Runs { limit } => {
            let conn = db::open_read_only(&settings.db_file())?;
            let rows = db::fetch_recent_runs(&conn, limit)?;
            println!("{}", report::runs(&rows, limit));
            Ok(())
        }
        Commands::Licitaciones { limit } => {
            let conn = db::open_read_only(&settings.db_file())?;
            let rows = db::fetch_recent_licitaciones(&conn, limit)?;
            println!("{}", report::licitaciones(&rows, limit));
            Ok(())
        }
        Commands::Last => {
            let conn = db::open_read_only(&settings.db_file())?;
            let last = db::fetch_last_run(&conn)?;
            println!("{}", report::last(last.as_ref()));
            Ok(())
        }
    }
}

/// Discovery, then fetch, then persistence; each stage feeds the next.
async fn run_pipeline(
    settings: &Settings,
    limit: Option<usize>,
    deadline: Option<Duration>,
) -> Result<(), PipelineError> {
    let started_at = Utc::now();
    let deadline = deadline.map(|d| tokio::time::Instant::now() + d);
    let renderer = ChromeRenderer::from_settings(settings);

    info!("Stage 1/3: discovery from {}", settings.root_url);
    let found = discovery::discover(&renderer, &DiscoveryOptions::from_settings(settings)).await?;
    println!(
        "Discovered {} licitaciones across {} listing pages",
        found.total_links, found.page_count
    );

    let mut urls = found.all_links();
    if let Some(n) = limit {
        urls.truncate(n);
    }

    info!("Stage 2/3: fetching {} pages", urls.len());
    let run_stamp = started_at.format("%Y%m%dT%H%M%S").to_string();
    let opts = FetchOptions::from_settings(settings, run_stamp, deadline);
    let fetched = fetch::fetch_all(&renderer, &urls, &opts).await?;
    println!(
        "Fetched {} of {} pages ({} dropped)",
        fetched.pages.len(),
        urls.len(),
        fetched.failures.len()
    );

    info!("Stage 3/3: persisting run");
    let input = RunInput {
        discovery: &found,
        pages: &fetched.pages,
        failures: &fetched.failures,
        started_at,
    };
    match persist::persist_with_fallback(settings, &input) {
        PersistOutcome::Committed(report) => {
            print_summary(&report);
            Ok(())
        }
        PersistOutcome::Degraded { report, cause } => {
            print_summary(&report);
            Err(PipelineError::Degraded {
                run_id: report.run_id,
                cause: format!("{:#}", cause),
            })
        }
        PersistOutcome::Failed(e) => Err(PipelineError::Persistence(e)),
    }
}

fn print_summary(r: &RunReport) {
    let m = &r.metrics;
    println!(
        "Run {} {}: {} licitaciones, {} html, {} png, {} dropped in {}",
        r.run_id,
        r.status,
        m.paginas_exitosas,
        m.archivos_html_creados,
        m.archivos_png_creados,
        m.paginas_descartadas,
        format_duration(Duration::from_secs_f64(r.duration_secs))
    );
}

fn init_store(path: &Path, force: bool) -> anyhow::Result<()> {
    if force && path.exists() {
        std::fs::remove_file(path).with_context(|| format!("Failed to delete {:?}", path))?;
        for suffix in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(side));
        }
        println!("Deleted existing database {:?}", path);
    }

    let conn = db::connect(path)?;
    db::init_schema(&conn)?;
    let s = db::inspect_schema(&conn)?;

    println!("Database ready at {:?}", path);
    println!("Tables:       {}", s.tables.join(", "));
    println!("Views:        {}", s.views.join(", "));
    println!("Indexes:      {}", s.indexes.join(", "));
    println!("Integrity:    {}", s.integrity);
    println!("Foreign keys: {}", if s.foreign_keys { "on" } else { "off" });
    println!("SQLite:       {}", s.sqlite_version);
    let size = std::fs::metadata(path)?.len();
    println!("Size:         {:.1} KB", size as f64 / 1024.0);
    Ok(())
}

/// `12.3s`, `4m 05s`, `1h 02m 03s`.
fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    match (total / 3600, total % 3600 / 60, total % 60) {
        (0, 0, _) => format!("{:.1}s", d.as_secs_f64()),
        (0, m, s) => format!("{}m {:02}s", m, s),
        (h, m, s) => format!("{}h {:02}m {:02}s", h, m, s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_read_naturally() {
        assert_eq!(format_duration(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m 05s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["licitar", "runs"]).unwrap();
        assert!(matches!(cli.command, Commands::Runs { limit: 10 }));
        let cli = Cli::try_parse_from(["licitar", "licitaciones", "--config", "x.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Licitaciones { limit: 20 }));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(Cli::try_parse_from(["licitar", "export"]).is_err());
    }
}
