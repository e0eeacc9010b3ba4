use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use okiprop_core::{Listing, ListingId};
use okiprop_storage::{PropertyStore, StorageError};
use okiprop_sync::SyncConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "okiprop-cli")]
#[command(about = "Okinawa property listing tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled search, reconcile, write the report and notify.
    Sync {
        /// Run date (YYYY-MM-DD). Defaults to today in local time.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Price history of one listing.
    History { id: String },
    /// Active listings, cheapest first.
    Active {
        #[arg(long = "type")]
        property_type: Option<String>,
    },
    /// Listings that dropped out of their search results.
    Inactive,
    /// Listings first seen on a date.
    New {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Rebuild the report from stored listings without fetching.
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn print_listing(listing: &Listing) {
    println!(
        "{}\t{}\t{}万円\t{}㎡\t{}\t{}\t{}",
        listing.id,
        listing.property_type,
        listing.price,
        listing.size,
        listing.title,
        listing.last_seen,
        listing.url
    );
}

async fn open_store() -> Result<PropertyStore> {
    let config = SyncConfig::from_env();
    PropertyStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))
}

async fn run(command: Commands) -> Result<i32> {
    match command {
        Commands::Sync { date } => {
            let summary = okiprop_sync::run_sync_once_from_env(date.unwrap_or_else(today)).await?;
            println!(
                "sync {}: run_id={} touched={} price_changes={} failures={} report={}",
                summary.status.as_str(),
                summary.run_id,
                summary.touched(),
                summary.price_change_count(),
                summary.failures.len(),
                summary.report_path.as_deref().unwrap_or("-")
            );
            return Ok(summary.status.exit_code());
        }
        Commands::Migrate => {
            let store = open_store().await?;
            store.close().await;
            println!("database schema is up to date");
        }
        Commands::History { id } => {
            let store = open_store().await?;
            let id = ListingId::from_stored(id);
            let points = store.history_for(&id).await?;
            for point in &points {
                println!("{}\t{}万円", point.date, point.price);
            }
            if points.is_empty() {
                eprintln!("no history for {id}");
            }
            store.close().await;
        }
        Commands::Active { property_type } => {
            let store = open_store().await?;
            let listings = match property_type {
                Some(property_type) => store.list_active_by_type(&property_type).await?,
                None => store.list_active().await?,
            };
            for listing in &listings {
                print_listing(listing);
            }
            store.close().await;
        }
        Commands::Inactive => {
            let store = open_store().await?;
            for listing in store.list_inactive().await? {
                print_listing(&listing);
            }
            store.close().await;
        }
        Commands::New { date } => {
            let store = open_store().await?;
            for listing in store.list_first_seen_on(date.unwrap_or_else(today)).await? {
                print_listing(&listing);
            }
            store.close().await;
        }
        Commands::Report { date } => {
            let written = okiprop_sync::write_report_from_env(date.unwrap_or_else(today)).await?;
            println!(
                "{}",
                serde_json::json!({
                    "parquet": written.parquet_path.display().to_string(),
                    "daily_brief": written.brief_path.display().to_string(),
                    "manifest": written.manifest_path.display().to_string(),
                })
            );
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match run(cli.command.unwrap_or(Commands::Sync { date: None })).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            if err.chain().any(|cause| cause.is::<StorageError>()) {
                3
            } else {
                1
            }
        }
    };
    ExitCode::from(code as u8)
}
