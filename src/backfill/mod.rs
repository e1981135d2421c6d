//! One-shot customer metadata backfill: selector feeds applier feeds reporter.

pub mod applier;
pub mod config;
pub mod report;
pub mod selector;

use anyhow::{Context, Result};
use tracing::info;

use crate::util::db::Db;
use crate::util::env as env_util;
use applier::PgWriter;
use config::BackfillConfig;
use report::{print_summary, RunSummary};
use selector::Candidate;

/// Run the whole backfill once. The summary prints on every exit path past
/// candidate selection, including an aborted batch.
pub async fn run(cfg: BackfillConfig) -> Result<RunSummary> {
    info!(
        schema = %cfg.schema,
        db = %env_util::redact_dsn(&cfg.database_url),
        batch_mode = ?cfg.batch_mode,
        dry_run = cfg.dry_run,
        "starting metadata backfill"
    );
    let db = Db::connect(&cfg.database_url, &cfg.schema)
        .await
        .context("could not connect to database")?;

    let candidates = selector::fetch_candidates(&db, &cfg).await?;
    if candidates.is_empty() {
        println!("no customers found that match the criteria");
        return Ok(RunSummary::new(0));
    }
    println!("found {} customers without metadata", candidates.len());

    if let Some(path) = &cfg.outfile {
        write_candidates_file(path, &candidates)?;
    }

    let mut summary = RunSummary::new(candidates.len());
    if cfg.dry_run {
        info!("dry run; no metadata written");
        print_summary(&summary);
        return Ok(summary);
    }

    let mut writer = PgWriter::new(&db);
    let outcome = applier::apply(&mut writer, &cfg, &candidates, &mut summary).await;
    print_summary(&summary);
    outcome?;
    Ok(summary)
}

fn write_candidates_file(path: &str, candidates: &[Candidate]) -> Result<()> {
    use std::io::Write as _;
    let mut f = std::fs::File::create(path)
        .with_context(|| format!("failed to create outfile {path}"))?;
    for cand in candidates {
        writeln!(f, "{}", serde_json::to_string(cand)?)?;
    }
    info!(path = %path, count = candidates.len(), "candidates written to file");
    Ok(())
}
