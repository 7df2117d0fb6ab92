//! Change collection.
//!
//! Collects rows changed after a watermark, in `(last_updated_at, id)` order,
//! one bounded page at a time. Read-only.

use std::sync::Arc;

use karya_sync_core::{Record, TableName, Timestamp};
use karya_sync_store::{RecordScope, Store};

use crate::error::Result;

/// One page of changed rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedPage {
    pub rows: Vec<Record>,
    /// Highest `last_updated_at` in `rows`, or the `since` value if empty.
    pub watermark: Timestamp,
    /// The page reached the limit; more rows may follow.
    pub is_full: bool,
}

/// Reads changed rows out of a store.
#[derive(Clone)]
pub struct ChangeCollector {
    store: Arc<dyn Store>,
}

impl ChangeCollector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Rows with `since < last_updated_at <= until`, at most `limit` of them
    /// plus any rows tied with the last one.
    ///
    /// A full page is extended to the end of its last timestamp so that the
    /// next page, which starts strictly after `watermark`, skips nothing.
    pub async fn collect(
        &self,
        table: &TableName,
        since: Timestamp,
        until: Timestamp,
        limit: usize,
    ) -> Result<CollectedPage> {
        self.collect_scoped(table, None, since, until, limit).await
    }

    /// [`ChangeCollector::collect`] over the rows inside `scope` only.
    pub async fn collect_scoped(
        &self,
        table: &TableName,
        scope: Option<&RecordScope>,
        since: Timestamp,
        until: Timestamp,
        limit: usize,
    ) -> Result<CollectedPage> {
        let mut rows = self
            .store
            .records_since(table, scope, since, until, limit)
            .await?;
        let is_full = limit > 0 && rows.len() >= limit;

        if is_full {
            if let Some(last) = rows.last() {
                let at = last.last_updated_at()?;
                let after = last.id()?.to_string();
                let tied = self.store.records_at(table, scope, at, &after).await?;
                if !tied.is_empty() {
                    tracing::debug!(
                        table = %table,
                        extra = tied.len(),
                        "extending page over a timestamp tie"
                    );
                    rows.extend(tied);
                }
            }
        }

        let watermark = rows
            .iter()
            .filter_map(|r| r.last_updated_at().ok())
            .max()
            .map_or(since, |max| max.max(since));

        Ok(CollectedPage {
            rows,
            watermark,
            is_full,
        })
    }

    /// Every row after `since`, paging until a page comes back short.
    pub async fn collect_all(
        &self,
        table: &TableName,
        since: Timestamp,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        let mut since = since;

        loop {
            let page = self.collect(table, since, until, limit).await?;
            out.extend(page.rows);

            if !page.is_full || page.watermark <= since {
                break;
            }
            since = page.watermark;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karya_sync_store::MemoryStore;
    use proptest::prelude::*;

    async fn seeded(rows: &[(&str, i64)]) -> ChangeCollector {
        let store = Arc::new(MemoryStore::new());
        for (id, ms) in rows {
            store
                .put_record(&TableName::MICROTASK, &Record::new(*id, Timestamp::from_millis(*ms)))
                .await
                .unwrap();
        }
        ChangeCollector::new(store)
    }

    fn ids(rows: &[Record]) -> Vec<String> {
        rows.iter().map(|r| r.id().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn test_collect_page_and_watermark() {
        let collector = seeded(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]).await;

        let page = collector
            .collect(&TableName::MICROTASK, Timestamp::EPOCH, Timestamp::from_millis(10), 2)
            .await
            .unwrap();
        assert_eq!(ids(&page.rows), vec!["a", "b"]);
        assert_eq!(page.watermark, Timestamp::from_millis(2));
        assert!(page.is_full);

        let page = collector
            .collect(&TableName::MICROTASK, page.watermark, Timestamp::from_millis(10), 2)
            .await
            .unwrap();
        assert_eq!(ids(&page.rows), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_collect_empty_keeps_watermark() {
        let collector = seeded(&[("a", 1)]).await;
        let since = Timestamp::from_millis(5);

        let page = collector
            .collect(&TableName::MICROTASK, since, Timestamp::from_millis(10), 10)
            .await
            .unwrap();
        assert!(page.rows.is_empty());
        assert!(!page.is_full);
        assert_eq!(page.watermark, since);
    }

    #[tokio::test]
    async fn test_collect_respects_upper_bound() {
        let collector = seeded(&[("a", 1), ("late", 50)]).await;

        let page = collector
            .collect(&TableName::MICROTASK, Timestamp::EPOCH, Timestamp::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(ids(&page.rows), vec!["a"]);
    }

    #[tokio::test]
    async fn test_full_page_extends_over_tie() {
        let collector = seeded(&[("a", 1), ("b", 2), ("c", 2), ("d", 2), ("e", 3)]).await;

        let page = collector
            .collect(&TableName::MICROTASK, Timestamp::EPOCH, Timestamp::from_millis(10), 2)
            .await
            .unwrap();
        assert_eq!(ids(&page.rows), vec!["a", "b", "c", "d"]);
        assert_eq!(page.watermark, Timestamp::from_millis(2));

        let all = collector
            .collect_all(&TableName::MICROTASK, Timestamp::EPOCH, Timestamp::from_millis(10), 2)
            .await
            .unwrap();
        assert_eq!(ids(&all), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_scoped_page_extends_over_tie_within_scope() {
        let store = Arc::new(MemoryStore::new());
        for (id, ms, worker) in [("a", 1, "w-1"), ("b", 2, "w-1"), ("c", 2, "w-2"), ("d", 2, "w-1")] {
            store
                .put_record(
                    &TableName::MICROTASK_ASSIGNMENT,
                    &Record::new(id, Timestamp::from_millis(ms)).with("worker_id", worker),
                )
                .await
                .unwrap();
        }
        let collector = ChangeCollector::new(store);
        let scope = RecordScope::new("worker_id", "w-1");

        let page = collector
            .collect_scoped(
                &TableName::MICROTASK_ASSIGNMENT,
                Some(&scope),
                Timestamp::EPOCH,
                Timestamp::from_millis(10),
                2,
            )
            .await
            .unwrap();
        assert_eq!(ids(&page.rows), vec!["a", "b", "d"]);
        assert_eq!(page.watermark, Timestamp::from_millis(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_paging_terminates_and_covers_every_row(
            stamps in prop::collection::vec(0i64..30, 0..60),
            limit in 1usize..8,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (collected, pages, total) = rt.block_on(async {
                let store = Arc::new(MemoryStore::new());
                for (i, ms) in stamps.iter().enumerate() {
                    store
                        .put_record(
                            &TableName::TASK,
                            &Record::new(format!("r{:03}", i), Timestamp::from_millis(*ms + 1)),
                        )
                        .await
                        .unwrap();
                }
                let collector = ChangeCollector::new(store);

                let mut since = Timestamp::EPOCH;
                let mut seen = Vec::new();
                let mut pages = 0usize;
                loop {
                    let page = collector
                        .collect(&TableName::TASK, since, Timestamp::from_millis(100), limit)
                        .await
                        .unwrap();
                    pages += 1;
                    seen.extend(page.rows.iter().map(|r| r.id().unwrap().to_string()));
                    if !page.is_full {
                        break;
                    }
                    since = page.watermark;
                }
                (seen, pages, stamps.len())
            });

            prop_assert_eq!(collected.len(), total);
            prop_assert!(pages <= total / limit + 1);
        }
    }
}
