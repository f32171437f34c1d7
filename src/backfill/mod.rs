// src/backfill/mod.rs
// Offline batch driver that re-derives consolidated documents for sessions
// that predate the mirror. Replays historical phase and attachment data
// through the consolidator in phase order; never on a request hot path.
//
// Idempotent by construction: re-running a session only produces additional
// harmless revisions, and attachments dedup to the same physical objects.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::consolidate::record::phase_sort_rank;
use crate::consolidate::SessionConsolidator;
use crate::session::SessionId;

pub mod file_source;

pub use file_source::JsonHistorySource;

#[derive(Debug, Clone)]
pub struct HistoricalPhase {
    pub phase: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HistoricalAttachment {
    pub purpose: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// The primary store's historical per-session data, read-only. The real
/// implementation queries the workflow database; tests and the CLI use the
/// JSON export source.
#[async_trait]
pub trait PhaseHistorySource: Send + Sync {
    async fn session_ids(&self) -> anyhow::Result<Vec<SessionId>>;
    async fn phases(&self, session_id: SessionId) -> anyhow::Result<Vec<HistoricalPhase>>;
    async fn attachments(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Vec<HistoricalAttachment>>;
}

#[derive(Debug)]
pub struct MigrationReport {
    pub session_id: SessionId,
    pub phases_applied: usize,
    pub attachments_applied: usize,
    pub final_revision: Option<u64>,
    pub error: Option<String>,
}

impl MigrationReport {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            phases_applied: 0,
            attachments_applied: 0,
            final_revision: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct BackfillSummary {
    pub migrated: usize,
    pub failed: usize,
    pub reports: Vec<MigrationReport>,
}

pub struct BackfillMigrator {
    consolidator: Arc<SessionConsolidator>,
    source: Arc<dyn PhaseHistorySource>,
}

impl BackfillMigrator {
    pub fn new(consolidator: Arc<SessionConsolidator>, source: Arc<dyn PhaseHistorySource>) -> Self {
        Self {
            consolidator,
            source,
        }
    }

    /// Replay one session's history. Reports rather than panics: a failed
    /// session leaves the batch running.
    pub async fn migrate(&self, session_id: SessionId) -> MigrationReport {
        let mut report = MigrationReport::new(session_id);

        let mut phases = match self.source.phases(session_id).await {
            Ok(phases) => phases,
            Err(e) => {
                report.error = Some(format!("reading phase history: {e}"));
                return report;
            }
        };
        // Stable sort: workflow order for known phases, input order within.
        phases.sort_by_key(|p| phase_sort_rank(&p.phase));

        for phase in phases {
            match self
                .consolidator
                .record_phase(session_id, &phase.phase, phase.data)
                .await
            {
                Ok(_) => report.phases_applied += 1,
                Err(e) => {
                    report.error = Some(format!("replaying phase {}: {e}", phase.phase));
                    return report;
                }
            }
        }

        let attachments = match self.source.attachments(session_id).await {
            Ok(attachments) => attachments,
            Err(e) => {
                report.error = Some(format!("reading attachment history: {e}"));
                return report;
            }
        };

        for att in attachments {
            match self
                .consolidator
                .record_attachment(session_id, &att.purpose, &att.bytes, &att.content_type)
                .await
            {
                Ok(_) => report.attachments_applied += 1,
                Err(e) => {
                    report.error = Some(format!("replaying attachment {}: {e}", att.purpose));
                    return report;
                }
            }
        }

        report.final_revision = self
            .consolidator
            .get_consolidated(session_id)
            .await
            .ok()
            .map(|record| record.revision);

        info!(
            "Backfilled session {}: {} phases, {} attachments, revision {:?}",
            session_id, report.phases_applied, report.attachments_applied, report.final_revision
        );
        report
    }

    /// Migrate every session the source knows about, in id order.
    pub async fn migrate_all(&self) -> anyhow::Result<BackfillSummary> {
        let mut ids = self.source.session_ids().await?;
        ids.sort_unstable();
        info!("Backfill starting for {} sessions", ids.len());

        let mut summary = BackfillSummary::default();
        for session_id in ids {
            let report = self.migrate(session_id).await;
            if report.succeeded() {
                summary.migrated += 1;
            } else {
                summary.failed += 1;
                error!(
                    "Backfill failed for session {}: {}",
                    session_id,
                    report.error.as_deref().unwrap_or("unknown")
                );
            }
            summary.reports.push(report);
        }

        info!(
            "Backfill finished: {} migrated, {} failed",
            summary.migrated, summary.failed
        );
        Ok(summary)
    }
}
