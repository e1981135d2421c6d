use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backfill::config::BackfillConfig;
use crate::util::db::Db;

/// A customer eligible for the metadata backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub customer_uuid: Uuid,
    pub identifier: String,
}

/// Customers reached through a manual-insertion distribution that are not
/// soft-deleted, carry a non-empty identifier, and have no metadata row for
/// the configured kind yet. Read-only; an empty result is not an error.
///
/// DISTINCT because a customer with several qualifying interactions must
/// still yield exactly one candidate. Tables are unqualified; the schema is
/// applied via search_path at connect time.
pub async fn fetch_candidates(db: &Db, cfg: &BackfillConfig) -> Result<Vec<Candidate>> {
    let mut sql = String::from(
        r#"SELECT DISTINCT
            c.uuid,
            c.identifier
        FROM customers c
        JOIN interactions i ON i.customer_uuid = c.uuid
        JOIN distributions d ON d.uuid = i.distribution_uuid
        WHERE NOT EXISTS (
            SELECT 1
            FROM customer_metadata cm
            WHERE cm.customer_uuid = c.uuid
              AND cm.metadata_uuid = $1
        )
          AND c.deleted_at IS NULL
          AND d.distribution_channel = $2
          AND c.identifier <> ''
        ORDER BY c.identifier"#,
    );
    if cfg.limit.is_some() {
        sql.push_str(" LIMIT $3");
    }
    debug!(sql = %sql, "executing candidate query");

    let mut query = sqlx::query(&sql)
        .bind(cfg.metadata_uuid)
        .bind(cfg.distribution_channel)
        .persistent(false);
    if let Some(limit) = cfg.limit {
        query = query.bind(limit);
    }
    let rows = query
        .fetch_all(&db.pool)
        .await
        .context("candidate query failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(Candidate {
            customer_uuid: r.try_get("uuid")?,
            identifier: r.try_get("identifier")?,
        });
    }
    info!(
        candidates = out.len(),
        metadata_uuid = %cfg.metadata_uuid,
        channel = cfg.distribution_channel,
        "candidate scan complete"
    );
    Ok(out)
}
