use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use muni_panel::{PipelineConfig, RunSummary};

#[derive(Parser)]
#[command(name = "muni-panel")]
#[command(author, version, about = "Municipal finance panel pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert delimited legacy exports into canonical CSV
    Convert {
        /// Directory of raw source files
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for the canonical CSV tree
        #[arg(short, long)]
        output: PathBuf,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Extract cleaned per-year tables from canonical CSV
    Extract {
        /// Directory of canonical CSV files, one subdirectory per year
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for the cleaned tables
        #[arg(short, long)]
        output: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Build category panels, provider map and master panel from cleaned tables
    Finalize {
        /// Directory of cleaned tables
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory; final tables go to its `final/` subdirectory
        #[arg(short, long)]
        output: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// First panel year, overrides the configuration
        #[arg(long)]
        first_year: Option<i64>,

        /// Last panel year, overrides the configuration
        #[arg(long)]
        last_year: Option<i64>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Report municipalities missing from some years of a master panel
    Coverage {
        /// Master panel CSV
        #[arg(short, long)]
        master: PathBuf,

        /// Output CSV
        #[arg(short, long, default_value = "inconsistent_munis.csv")]
        output: PathBuf,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run every stage from raw sources to final outputs
    Run {
        /// Directory of raw source files
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for raw, clean and final trees
        #[arg(short, long)]
        output: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// First panel year, overrides the configuration
        #[arg(long)]
        first_year: Option<i64>,

        /// Last panel year, overrides the configuration
        #[arg(long)]
        last_year: Option<i64>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            output,
            verbose,
        } => {
            setup_logging(verbose);
            let result = muni_panel::convert(&input, &output)?;
            info!(
                "Converted {} files into {:?} ({} skipped)",
                result.converted.len(),
                output,
                result.skipped.len()
            );
            Ok(())
        }
        Commands::Extract {
            input,
            output,
            config,
            verbose,
        } => {
            setup_logging(verbose);
            let config = load_config(config.as_deref(), None, None)?;
            let extracted = muni_panel::extract(&input, &output, &config)?;
            info!(
                "Cleaned tables for {} categories written to {:?}",
                extracted.tables.len(),
                output
            );
            Ok(())
        }
        Commands::Finalize {
            input,
            output,
            config,
            first_year,
            last_year,
            verbose,
        } => {
            setup_logging(verbose);
            let config = load_config(config.as_deref(), first_year, last_year)?;
            let summary = muni_panel::finalize(&input, &output, &config)?;
            report(&summary);
            Ok(())
        }
        Commands::Coverage {
            master,
            output,
            verbose,
        } => {
            setup_logging(verbose);
            let report = muni_panel::coverage(&master, &output)?;
            info!(
                "{} municipalities with incomplete coverage written to {:?}",
                report.height(),
                output
            );
            Ok(())
        }
        Commands::Run {
            input,
            output,
            config,
            first_year,
            last_year,
            verbose,
        } => {
            setup_logging(verbose);
            let config = load_config(config.as_deref(), first_year, last_year)?;
            let summary = muni_panel::run(&input, &output, &config)?;
            report(&summary);
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(
    path: Option<&Path>,
    first_year: Option<i64>,
    last_year: Option<i64>,
) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(year) = first_year {
        config.first_year = year;
    }
    if let Some(year) = last_year {
        config.last_year = year;
    }
    if config.first_year > config.last_year {
        anyhow::bail!(
            "first year {} is after last year {}",
            config.first_year,
            config.last_year
        );
    }
    info!("Panel years {}..={}", config.first_year, config.last_year);
    Ok(config)
}

fn report(summary: &RunSummary) {
    for (category, counts) in &summary.categories {
        info!(
            "{}: {} rows ({} before amalgamation)",
            category, counts.rows, counts.rows_before_amalgamation
        );
    }
    info!(
        "Complete: master panel has {} rows for {} municipalities, {} with incomplete coverage",
        summary.master_rows,
        summary.master_municipalities,
        summary.coverage_gaps.len()
    );
}
