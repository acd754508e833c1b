use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nhf_storage::ArticleStore;
use nhf_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nhf-cli")]
#[command(about = "News Headline Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every source, sleep, repeat until Ctrl-C.
    Scrape,
    /// Run a single ingestion tick and print its summary.
    ScrapeOnce,
    /// Serve `POST /articles/find`.
    Serve,
    /// Create the schema; `--reset` also empties the article table.
    Migrate {
        #[arg(long)]
        reset: bool,
    },
    /// Print stored articles whose header contains any keyword, newest first.
    Search {
        #[arg(required = true)]
        keywords: Vec<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<ArticleStore> {
    ArticleStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening article store {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let ticks = nhf_sync::run_forever_from_env().await?;
            info!(ticks, "ingestion stopped");
        }
        Commands::ScrapeOnce => {
            let summary = nhf_sync::run_once_from_env().await?;
            println!(
                "scrape complete: run_id={} sources={} failed_sources={} candidates={} inserted={} duplicates={}",
                summary.run_id,
                summary.sources,
                summary.failed_sources,
                summary.candidates,
                summary.inserted,
                summary.duplicates
            );
        }
        Commands::Serve => {
            nhf_web::serve_from_env().await?;
        }
        Commands::Migrate { reset } => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            if reset {
                let removed = store.reset().await?;
                println!("reset {}: removed {removed} articles", config.database_url);
            } else {
                println!(
                    "migrated {}: {} articles stored",
                    config.database_url,
                    store.count().await?
                );
            }
            store.close().await;
        }
        Commands::Search { keywords } => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            let articles = nhf_web::search_articles(&store, &keywords).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "articles": articles }))?
            );
            store.close().await;
        }
    }

    Ok(())
}
