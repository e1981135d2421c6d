use clap::ValueEnum;
use uuid::{uuid, Uuid};

/// Metadata kind written by this tool (the "manual insertion" tag).
pub const DEFAULT_METADATA_UUID: Uuid = uuid!("e1b93a8e-ccdc-4a37-b1fd-68ac47f2a956");

/// 12 is the distribution channel for manual insertions.
pub const DEFAULT_DISTRIBUTION_CHANNEL: i32 = 12;

/// Transaction scope for the insert loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BatchMode {
    /// Single transaction for the whole batch; any failure rolls everything back.
    AllOrNothing,
    /// Commit per record; duplicates are skipped and logged, the run continues.
    #[value(name = "best-effort", alias = "per-record")]
    PerRecordBestEffort,
}

/// Everything a run needs, resolved up front. No literals buried in queries:
/// schema, metadata kind and channel all flow from here.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub database_url: String,
    pub schema: String,
    pub metadata_uuid: Uuid,
    pub distribution_channel: i32,
    pub batch_mode: BatchMode,
    /// Cap on candidates processed in one run (None = all).
    pub limit: Option<i64>,
    /// Optional JSONL dump of the selected candidates.
    pub outfile: Option<String>,
    /// Select and report only; no writes.
    pub dry_run: bool,
}

impl BackfillConfig {
    pub fn new(database_url: String, schema: String) -> Self {
        Self {
            database_url,
            schema,
            metadata_uuid: DEFAULT_METADATA_UUID,
            distribution_channel: DEFAULT_DISTRIBUTION_CHANNEL,
            batch_mode: BatchMode::PerRecordBestEffort,
            limit: None,
            outfile: None,
            dry_run: false,
        }
    }
}
