use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "cev")]
#[command(about = "Campus events pipeline: scrape, load, serve")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the upstream events API into a snapshot file.
    Scrape {
        /// Override the snapshot output path.
        output: Option<PathBuf>,
    },
    /// Load a snapshot file into the database.
    Load {
        /// Override the snapshot input path.
        snapshot: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run migrations, the bootstrap gate, then the REST backend.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape { output } => {
            let mut config = cev_scraper::ScraperConfig::from_env()?;
            if let Some(output) = output {
                config.snapshot_path = output;
            }
            let summary = cev_scraper::run_scrape(&config).await?;
            println!(
                "scrape complete: run_id={} pages={} records={} skipped={} deduped={} written={} path={}",
                summary.run_id,
                summary.pages_fetched,
                summary.records_fetched,
                summary.skipped_missing_ids,
                summary.duplicates_collapsed,
                summary.events_written,
                summary.output_path.display()
            );
        }
        Commands::Load { snapshot } => {
            let mut config = cev_loader::LoaderConfig::from_env();
            if let Some(snapshot) = snapshot {
                config.snapshot_path = snapshot;
            }
            let pool = cev_loader::connect(&config.database_url).await?;
            cev_loader::run_migrations(&pool).await?;
            let report = cev_loader::load_snapshot(&pool, &config.snapshot_path).await?;
            println!(
                "load complete: orgs_created={} events_created={} events_updated={} failed={}",
                report.organizations_created,
                report.events_created,
                report.events_updated,
                report.events_failed
            );
            if !report.is_complete() {
                anyhow::bail!("{} events failed to load", report.events_failed);
            }
        }
        Commands::Migrate => {
            let config = cev_loader::LoaderConfig::from_env();
            let pool = cev_loader::connect(&config.database_url).await?;
            cev_loader::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let config = cev_loader::LoaderConfig::from_env();
            let pool = cev_loader::connect(&config.database_url).await?;
            cev_loader::run_migrations(&pool).await?;
            cev_loader::bootstrap(&pool, &config.snapshot_path).await?;

            let port = std::env::var("CEV_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(cev_web::DEFAULT_PORT);
            cev_web::serve(cev_web::AppState::new(pool), port).await?;
        }
    }

    Ok(())
}
