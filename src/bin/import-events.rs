//! Backfill the payment event table from a CSV export of webhook deliveries.
//!
//! Usage: import-events <FILE> [--dry-run]
//!   FILE       : CSV with a header row (timestamp, status, payer_email, ...)
//!   --dry-run  : Parse and report without writing

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use sitehub_api::db::{
    self,
    schema::{ensure_schema, PAYMENT_EVENTS},
    Fields, PgTableStore, TableStore,
};

#[derive(Parser)]
#[command(name = "import-events", about = "Import payment events from a CSV export")]
struct Args {
    /// CSV file to import
    file: PathBuf,

    /// Parse and report without writing
    #[arg(long)]
    dry_run: bool,
}

/// Map a CSV header to a declared event column. Case, spaces and separators
/// are ignored, so `payerEmail`, `Payer Email` and `payer_email` all match.
fn column_for(header: &str) -> Option<&'static str> {
    let squash = |s: &str| -> String {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect()
    };
    let wanted = squash(header);
    PAYMENT_EVENTS
        .columns
        .iter()
        .copied()
        .find(|column| squash(column) == wanted)
}

fn read_events(path: &PathBuf) -> anyhow::Result<Vec<Fields>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("cannot open {}", path.display()))?;

    let columns: Vec<Option<&'static str>> = reader.headers()?.iter().map(column_for).collect();
    for (header, column) in reader.headers()?.iter().zip(&columns) {
        if column.is_none() {
            tracing::warn!("ignoring unknown column '{header}'");
        }
    }

    let mut events = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("bad CSV record at row {}", line + 2))?;
        let fields: Fields = columns
            .iter()
            .zip(record.iter())
            .filter_map(|(column, value)| Some(((*column)?.to_string(), value.trim().to_string())))
            .filter(|(_, value)| !value.is_empty())
            .collect();
        if !fields.is_empty() {
            events.push(fields);
        }
    }
    Ok(events)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let events = read_events(&args.file)?;
    tracing::info!("Read {} events from {}", events.len(), args.file.display());

    if args.dry_run {
        tracing::info!("Dry run, nothing written");
        return Ok(());
    }

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;
    let pool = db::create_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let store = PgTableStore::new(pool, false);
    ensure_schema(&store).await?;

    let mut written = 0usize;
    for event in &events {
        match store.append(PAYMENT_EVENTS.name, event).await {
            Ok(_) => written += 1,
            Err(e) => tracing::error!("Failed to append event {event:?}: {e}"),
        }
    }

    tracing::info!("Imported {written}/{} events", events.len());
    Ok(())
}
