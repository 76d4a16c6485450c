use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "txscout")]
#[command(about = "Tenant scraper orchestration and incremental transaction sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the scraper API.
    Serve,
    /// Run one sync pass; this is the entry point of every execution unit.
    Run,
    /// Apply database migrations.
    Migrate,
    /// Load and summarize a scraper type catalog.
    CheckTypes {
        #[arg(default_value = "scraper_types.yaml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => txscout_web::serve_from_env().await?,
        Commands::Run => match txscout_sync::run_from_env().await {
            Ok(outcome) => info!(
                submitted = outcome.submitted,
                bootstrapped = outcome.bootstrapped,
                watermark = ?outcome.watermark,
                "run finished"
            ),
            Err(err) => {
                error!(error = %format!("{err:#}"), "run failed");
                return Err(err);
            }
        },
        Commands::Migrate => {
            let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
            let pool = sqlx::PgPool::connect(&database_url)
                .await
                .context("connecting to database")?;
            txscout_storage::migrate(&pool).await?;
            info!("migrations applied");
        }
        Commands::CheckTypes { path } => {
            let catalog = txscout_core::ScraperTypeCatalog::load(&path)?;
            for scraper_type in catalog.types() {
                let parameters = scraper_type
                    .parameters
                    .iter()
                    .map(|p| format!("{}:{:?}", p.id, p.param_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{} ({}) [{}]", scraper_type.id, scraper_type.display_name, parameters);
            }
        }
    }

    Ok(())
}
