use std::fmt::Write as _;
use tracing::warn;

use crate::backfill::selector::Candidate;

/// Counts accumulated over one run; printed at the end and discarded.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_candidates: usize,
    pub inserted: usize,
    /// Candidates skipped because the tag already existed, kept whole so the
    /// summary can list key + identifier for manual inspection.
    pub skipped: Vec<Candidate>,
    pub failed: usize,
    /// Set when an all-or-nothing batch rolled back.
    pub aborted: bool,
}

impl RunSummary {
    pub fn new(total_candidates: usize) -> Self {
        Self {
            total_candidates,
            ..Default::default()
        }
    }
}

/// Render the end-of-run summary. Separate from printing so tests can assert
/// on the text.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    writeln!(out, "BACKFILL SUMMARY:").ok();
    writeln!(out, "candidates found: {}", summary.total_candidates).ok();
    writeln!(out, "metadata inserted: {}", summary.inserted).ok();
    writeln!(out, "skipped (already tagged): {}", summary.skipped.len()).ok();
    for cand in &summary.skipped {
        writeln!(out, "  {} ({})", cand.customer_uuid, cand.identifier).ok();
    }
    if summary.failed > 0 {
        writeln!(out, "failed inserts: {}", summary.failed).ok();
    }
    if summary.aborted {
        writeln!(out, "run aborted: batch rolled back, nothing committed").ok();
    }
    out
}

pub fn print_summary(summary: &RunSummary) {
    if !summary.skipped.is_empty() {
        warn!(
            skipped = summary.skipped.len(),
            "some customers were already tagged; safe to re-run"
        );
    }
    println!("{}", render_summary(summary));
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn summary_lists_counts_and_skipped_customers() {
        let mut summary = RunSummary::new(3);
        summary.inserted = 2;
        summary.skipped.push(Candidate {
            customer_uuid: Uuid::from_u128(7),
            identifier: "ACME-42".into(),
        });

        let text = render_summary(&summary);
        assert!(text.contains("candidates found: 3"));
        assert!(text.contains("metadata inserted: 2"));
        assert!(text.contains("skipped (already tagged): 1"));
        assert!(text.contains("ACME-42"));
        assert!(!text.contains("failed inserts"));
        assert!(!text.contains("aborted"));
    }

    #[test]
    fn summary_flags_failures_and_aborts() {
        let mut summary = RunSummary::new(5);
        summary.failed = 1;
        summary.aborted = true;

        let text = render_summary(&summary);
        assert!(text.contains("failed inserts: 1"));
        assert!(text.contains("run aborted: batch rolled back, nothing committed"));
    }
}
