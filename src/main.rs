use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use metadata_backfill::backfill::{
    self,
    config::{BackfillConfig, BatchMode, DEFAULT_DISTRIBUTION_CHANNEL, DEFAULT_METADATA_UUID},
};
use metadata_backfill::util::env as env_util;

#[derive(Parser, Debug)]
#[command(
    name = "backfill",
    version,
    about = "Backfill the manual-insertion metadata tag for customers missing it"
)]
struct Cli {
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
    /// Schema to operate on (defaults to env BACKFILL_SCHEMA, else public)
    #[arg(long)]
    schema: Option<String>,
    /// Transaction scope: roll back everything on failure, or skip and continue
    #[arg(long, value_enum, default_value = "best-effort")]
    batch_mode: BatchMode,
    /// Metadata kind UUID to backfill (defaults to the manual-insertion tag)
    #[arg(long)]
    metadata_uuid: Option<Uuid>,
    /// Distribution channel filter (default: 12, manual insertions)
    #[arg(long)]
    channel: Option<i32>,
    /// Maximum number of candidates to process (default: all)
    #[arg(long)]
    limit: Option<i64>,
    /// Write selected candidates as JSON lines to this file
    #[arg(long)]
    outfile: Option<String>,
    /// When set, only logs candidates without mutating the database
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let database_url = match cli.db_url {
        Some(url) => url,
        None => env_util::db_url().context("set DATABASE_URL / DB_URL or pass --db-url")?,
    };
    let metadata_uuid = match cli.metadata_uuid {
        Some(uuid) => uuid,
        None => match env_util::env_opt("METADATA_UUID") {
            Some(raw) => raw.parse().context("METADATA_UUID is not a valid UUID")?,
            None => DEFAULT_METADATA_UUID,
        },
    };

    let cfg = BackfillConfig {
        database_url,
        schema: cli
            .schema
            .or_else(|| env_util::env_opt("BACKFILL_SCHEMA"))
            .unwrap_or_else(|| "public".to_string()),
        metadata_uuid,
        distribution_channel: cli.channel.unwrap_or_else(|| {
            env_util::env_parse("DISTRIBUTION_CHANNEL", DEFAULT_DISTRIBUTION_CHANNEL)
        }),
        batch_mode: cli.batch_mode,
        limit: cli.limit.or_else(|| env_util::env_parse_opt("BACKFILL_LIMIT")),
        outfile: cli.outfile.or_else(|| env_util::env_opt("BACKFILL_OUTFILE")),
        dry_run: cli.dry_run,
    };

    // Exit code policy: completing with skipped duplicates is still success
    // (the summary and a warning carry the detail); fatal errors exit non-zero.
    backfill::run(cfg).await?;
    Ok(())
}
