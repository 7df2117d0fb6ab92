//! Idempotent application of incoming rows.
//!
//! Rows are applied one at a time, best effort: a bad row is reported and
//! the rest of the batch still goes in. The report carries enough detail to
//! advance the received watermark without skipping a failed row.
//!
//! Rows from an upstream peer keep their `last_updated_at`. Rows pushed up
//! by a downstream peer are stamped with the local time they were applied
//! at, so that they sort after everything this node has already sent on.

use std::sync::Arc;

use karya_sync_core::{PeerId, Record, TableName, Tier, Timestamp};
use karya_sync_store::{RecordScope, Store};

use crate::registry::{MergeContext, TableRegistry, TableSpec};

/// What happened to one incoming row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// The stored row changed.
    Applied,
    /// The row was accepted but the stored row was already as new or newer.
    Unchanged,
    /// The sender may not change this table or row, or the table is unknown.
    Rejected(String),
    /// The row could not be applied; it will be offered again.
    Failed(String),
}

impl RowOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RowOutcome::Applied | RowOutcome::Unchanged)
    }
}

/// Outcome of one row, keyed by what could be read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowReport {
    pub id: Option<String>,
    pub last_updated_at: Option<Timestamp>,
    pub outcome: RowOutcome,
}

/// Per-row outcomes for one table batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub table: TableName,
    pub rows: Vec<RowReport>,
}

impl ApplyReport {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            rows: Vec::new(),
        }
    }

    /// Rows that are now durably reflected in the store.
    pub fn applied_count(&self) -> usize {
        self.rows.iter().filter(|r| r.outcome.is_accepted()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r.outcome, RowOutcome::Failed(_)))
            .count()
    }

    pub fn rejected_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r.outcome, RowOutcome::Rejected(_)))
            .count()
    }

    /// The highest watermark that can be stored without skipping a failure.
    ///
    /// That is the max `last_updated_at` over processed rows strictly earlier
    /// than the earliest failed row. Rejected rows count as processed, since
    /// offering them again cannot change the answer. Failed rows without a
    /// readable timestamp are in the same position and do not hold the
    /// watermark back. Returns `None` when nothing can be advanced.
    pub fn safe_watermark(&self) -> Option<Timestamp> {
        let first_failure = self
            .rows
            .iter()
            .filter(|r| matches!(r.outcome, RowOutcome::Failed(_)))
            .filter_map(|r| r.last_updated_at)
            .min();

        self.rows
            .iter()
            .filter(|r| !matches!(r.outcome, RowOutcome::Failed(_)))
            .filter_map(|r| r.last_updated_at)
            .filter(|ts| first_failure.map_or(true, |f| *ts < f))
            .max()
    }
}

/// Applies batches through the table registry.
#[derive(Clone)]
pub struct RecordApplier {
    store: Arc<dyn Store>,
    registry: Arc<TableRegistry>,
    local: Tier,
}

impl RecordApplier {
    pub fn new(store: Arc<dyn Store>, registry: Arc<TableRegistry>, local: Tier) -> Self {
        Self {
            store,
            registry,
            local,
        }
    }

    /// Upsert `rows` into `table` on behalf of `sender`.
    ///
    /// Re-applying the same rows is a no-op. A row older than or as old as
    /// the stored one is accepted without changing anything.
    pub async fn apply(&self, sender: Tier, table: &TableName, rows: Vec<Record>) -> ApplyReport {
        self.apply_inner(sender, None, table, rows).await
    }

    /// [`RecordApplier::apply`] for rows pushed by the downstream node `peer`.
    ///
    /// Rows outside the table's scope for `peer` are rejected.
    pub async fn apply_from_peer(
        &self,
        sender: Tier,
        peer: &PeerId,
        table: &TableName,
        rows: Vec<Record>,
    ) -> ApplyReport {
        self.apply_inner(sender, Some(peer), table, rows).await
    }

    async fn apply_inner(
        &self,
        sender: Tier,
        peer: Option<&PeerId>,
        table: &TableName,
        rows: Vec<Record>,
    ) -> ApplyReport {
        let mut report = ApplyReport::new(table.clone());

        let rejection = match self.registry.get(table) {
            None => Err(format!("unknown table '{}'", table)),
            Some(spec) if !spec.authority.accepts(sender, self.local) => Err(format!(
                "{} may not change '{}'",
                sender, table
            )),
            Some(spec) => Ok(spec),
        };

        let spec = match rejection {
            Ok(spec) => spec,
            Err(reason) => {
                tracing::warn!(table = %table, rows = rows.len(), "rejecting batch: {}", reason);
                report.rows = rows
                    .iter()
                    .map(|row| RowReport {
                        id: row.id().ok().map(str::to_string),
                        last_updated_at: row.last_updated_at().ok(),
                        outcome: RowOutcome::Rejected(reason.clone()),
                    })
                    .collect();
                return report;
            }
        };

        let ctx = MergeContext {
            local: self.local,
            sender,
        };
        let scope = peer.and_then(|p| spec.scope_for(sender, p));

        for row in rows {
            let id = row.id().ok().map(str::to_string);
            let last_updated_at = row.last_updated_at().ok();

            if let (Some(scope), Some(peer)) = (&scope, peer) {
                if !scope.matches(&row) {
                    tracing::warn!(
                        table = %table,
                        id = id.as_deref().unwrap_or("<none>"),
                        peer = %peer,
                        column = %scope.column,
                        "rejecting row owned by another peer"
                    );
                    report.rows.push(RowReport {
                        id,
                        last_updated_at,
                        outcome: RowOutcome::Rejected(format!("{} may only change its own rows", peer)),
                    });
                    continue;
                }
            }

            let outcome = match self.apply_row(spec, &ctx, row).await {
                Ok(outcome) => outcome,
                Err(reason) => {
                    tracing::warn!(
                        table = %table,
                        id = id.as_deref().unwrap_or("<none>"),
                        "failed to apply row: {}",
                        reason
                    );
                    RowOutcome::Failed(reason)
                }
            };
            report.rows.push(RowReport {
                id,
                last_updated_at,
                outcome,
            });
        }

        tracing::debug!(
            table = %table,
            applied = report.applied_count(),
            failed = report.failed_count(),
            "applied batch"
        );
        report
    }

    async fn apply_row(
        &self,
        spec: &TableSpec,
        ctx: &MergeContext,
        row: Record,
    ) -> Result<RowOutcome, String> {
        let id = row.id().map_err(|e| e.to_string())?.to_string();
        let incoming_at = row.last_updated_at().map_err(|e| e.to_string())?;

        let existing = self
            .store
            .get_record(&spec.name, &id)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(existing) = &existing {
            let stored_at = existing.last_updated_at().map_err(|e| e.to_string())?;
            if incoming_at <= stored_at {
                return Ok(RowOutcome::Unchanged);
            }
        }

        let mut merged = spec
            .handler
            .merge(ctx, existing.as_ref(), row)
            .map_err(|e| e.to_string())?;

        if existing.as_ref().is_some_and(|e| e.same_content(&merged)) {
            return Ok(RowOutcome::Unchanged);
        }

        if !ctx.from_upstream() {
            merged.set_last_updated_at(Timestamp::now().max(incoming_at));
        }

        self.store
            .put_record(&spec.name, &merged)
            .await
            .map_err(|e| e.to_string())?;
        Ok(RowOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karya_sync_store::MemoryStore;
    use serde_json::json;

    fn applier(local: Tier) -> (Arc<MemoryStore>, RecordApplier) {
        let store = Arc::new(MemoryStore::new());
        let applier = RecordApplier::new(store.clone(), Arc::new(TableRegistry::standard()), local);
        (store, applier)
    }

    fn row(id: &str, ms: i64) -> Record {
        Record::new(id, Timestamp::from_millis(ms))
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (store, applier) = applier(Tier::Edge);
        let rows = vec![row("t-1", 1).with("name", "a"), row("t-2", 2).with("name", "b")];

        let first = applier.apply(Tier::Central, &TableName::TASK, rows.clone()).await;
        assert_eq!(first.applied_count(), 2);
        assert!(first.rows.iter().all(|r| r.outcome == RowOutcome::Applied));

        let second = applier.apply(Tier::Central, &TableName::TASK, rows).await;
        assert_eq!(second.applied_count(), 2);
        assert!(second.rows.iter().all(|r| r.outcome == RowOutcome::Unchanged));
        assert_eq!(store.count_records(&TableName::TASK).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_newer_row_wins_older_is_noop() {
        let (store, applier) = applier(Tier::Edge);
        applier
            .apply(Tier::Central, &TableName::TASK, vec![row("t-1", 10).with("name", "new")])
            .await;

        let report = applier
            .apply(Tier::Central, &TableName::TASK, vec![row("t-1", 5).with("name", "old")])
            .await;
        assert_eq!(report.rows[0].outcome, RowOutcome::Unchanged);

        let stored = store.get_record(&TableName::TASK, "t-1").await.unwrap().unwrap();
        assert_eq!(stored.get_str("name"), Some("new"));
    }

    #[tokio::test]
    async fn test_unauthorized_sender_is_rejected_per_row() {
        let (store, applier) = applier(Tier::Edge);
        let report = applier
            .apply(Tier::Client, &TableName::TASK, vec![row("t-1", 1), row("t-2", 2)])
            .await;

        assert_eq!(report.rejected_count(), 2);
        assert_eq!(report.applied_count(), 0);
        assert_eq!(store.count_records(&TableName::TASK).await.unwrap(), 0);
        assert_eq!(report.safe_watermark(), Some(Timestamp::from_millis(2)));
    }

    #[tokio::test]
    async fn test_unknown_table_is_rejected() {
        let (_, applier) = applier(Tier::Edge);
        let report = applier
            .apply(Tier::Central, &TableName::new("payment"), vec![row("p-1", 1)])
            .await;
        assert!(matches!(report.rows[0].outcome, RowOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_bad_rows_fail_individually() {
        let (store, applier) = applier(Tier::Edge);
        let rows = vec![
            row("w-1", 1),
            Record::from_value(json!({ "name": "no id", "last_updated_at": 2 })).unwrap(),
            row("w-3", 3),
        ];

        let report = applier.apply(Tier::Central, &TableName::WORKER, rows).await;
        assert_eq!(report.applied_count(), 2);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(store.count_records(&TableName::WORKER).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rows_from_downstream_are_stamped_on_apply() {
        let (store, applier) = applier(Tier::Edge);
        let before = Timestamp::now();
        let row = row("a-1", 3_000)
            .with("worker_id", "phone-1")
            .with("status", "completed");

        let report = applier
            .apply(Tier::Client, &TableName::MICROTASK_ASSIGNMENT, vec![row.clone()])
            .await;
        assert_eq!(report.rows[0].outcome, RowOutcome::Applied);
        assert_eq!(report.rows[0].last_updated_at, Some(Timestamp::from_millis(3_000)));

        let stored = store
            .get_record(&TableName::MICROTASK_ASSIGNMENT, "a-1")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.last_updated_at().unwrap() >= before);
        assert!(stored.same_content(&row));

        let replay = applier
            .apply(Tier::Client, &TableName::MICROTASK_ASSIGNMENT, vec![row])
            .await;
        assert_eq!(replay.rows[0].outcome, RowOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_rows_from_upstream_keep_their_timestamp() {
        let (store, applier) = applier(Tier::Edge);
        applier
            .apply(Tier::Central, &TableName::TASK, vec![row("t-1", 10).with("name", "a")])
            .await;
        let stored = store.get_record(&TableName::TASK, "t-1").await.unwrap().unwrap();
        assert_eq!(stored.last_updated_at().unwrap(), Timestamp::from_millis(10));

        // Same content under a newer timestamp leaves the stored row alone.
        let echo = applier
            .apply(Tier::Central, &TableName::TASK, vec![row("t-1", 20).with("name", "a")])
            .await;
        assert_eq!(echo.rows[0].outcome, RowOutcome::Unchanged);
        let stored = store.get_record(&TableName::TASK, "t-1").await.unwrap().unwrap();
        assert_eq!(stored.last_updated_at().unwrap(), Timestamp::from_millis(10));
    }

    #[tokio::test]
    async fn test_peer_may_only_change_its_own_rows() {
        let (store, applier) = applier(Tier::Edge);
        let phone = PeerId::new("phone-1");
        let rows = vec![
            row("a-1", 1).with("worker_id", "phone-1").with("status", "completed"),
            row("a-2", 2).with("worker_id", "phone-2").with("status", "completed"),
        ];

        let report = applier
            .apply_from_peer(Tier::Client, &phone, &TableName::MICROTASK_ASSIGNMENT, rows)
            .await;
        assert_eq!(report.rows[0].outcome, RowOutcome::Applied);
        assert!(matches!(report.rows[1].outcome, RowOutcome::Rejected(_)));
        assert!(store
            .get_record(&TableName::MICROTASK_ASSIGNMENT, "a-2")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_safe_watermark_stops_before_first_failure() {
        let at = |ms| Some(Timestamp::from_millis(ms));
        let report = ApplyReport {
            table: TableName::MICROTASK,
            rows: vec![
                RowReport { id: Some("a".into()), last_updated_at: at(1), outcome: RowOutcome::Applied },
                RowReport { id: Some("b".into()), last_updated_at: at(2), outcome: RowOutcome::Unchanged },
                RowReport { id: Some("c".into()), last_updated_at: at(3), outcome: RowOutcome::Failed("disk".into()) },
                RowReport { id: Some("d".into()), last_updated_at: at(3), outcome: RowOutcome::Applied },
                RowReport { id: Some("e".into()), last_updated_at: at(4), outcome: RowOutcome::Applied },
            ],
        };
        assert_eq!(report.safe_watermark(), at(2));
    }

    #[test]
    fn test_safe_watermark_without_failures() {
        let report = ApplyReport {
            table: TableName::MICROTASK,
            rows: vec![
                RowReport { id: Some("a".into()), last_updated_at: Some(Timestamp::from_millis(7)), outcome: RowOutcome::Applied },
                RowReport { id: None, last_updated_at: None, outcome: RowOutcome::Failed("no id".into()) },
            ],
        };
        assert_eq!(report.safe_watermark(), Some(Timestamp::from_millis(7)));
        assert_eq!(ApplyReport::new(TableName::TASK).safe_watermark(), None);
    }
}
