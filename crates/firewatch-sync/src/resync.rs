//! Destructive clear-and-repopulate sync, run out of band from the poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use firewatch_core::ErrorCode;
use firewatch_scheduler::{RoutineControl, RoutineError};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::model::{map_incident, Incident, TypeCache};
use crate::pages::PageWalker;
use crate::store::RecordStore;
use crate::upstream::Upstream;
use crate::watermark::WatermarkCache;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub total_synced: usize,
    pub cleared_count: usize,
    pub pages_fetched: u32,
    /// Pages fetched successfully whose insert failed. The walk continued.
    pub failed_pages: u32,
}

/// Clears `is_syncing` when dropped, including on early return.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct FullResync {
    upstream: Arc<Upstream>,
    store: Arc<dyn RecordStore>,
    watermark: Arc<WatermarkCache>,
    types: Arc<TypeCache>,
    batch_size: usize,
    page_delay: Duration,
    is_syncing: AtomicBool,
}

impl FullResync {
    pub fn new(
        upstream: Arc<Upstream>,
        store: Arc<dyn RecordStore>,
        watermark: Arc<WatermarkCache>,
        types: Arc<TypeCache>,
        batch_size: usize,
        page_delay: Duration,
    ) -> Self {
        Self {
            upstream,
            store,
            watermark,
            types,
            batch_size: batch_size.max(1),
            page_delay,
            is_syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Suspend `routine`, clear the store, re-walk every upstream page, then
    /// resume `routine` if it was running. The resume happens on every path.
    pub async fn resync(&self, routine: &dyn RoutineControl) -> Result<ResyncReport> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress);
        }
        let guard = SyncingGuard(&self.is_syncing);

        let was_running = match routine
            .stop(Some("suspended for full resync".to_string()))
            .await
        {
            Ok(_) => true,
            Err(RoutineError::NotRunning { .. }) => false,
            Err(e) => return Err(e.into()),
        };
        info!(routine = routine.name(), was_running, "full resync started");

        let result = self.run().await;

        // Resume only once the flag is down, or should_not_start would veto it.
        drop(guard);
        if was_running {
            if let Err(e) = routine.start().await {
                warn!(
                    routine = routine.name(),
                    error = %e,
                    code = e.code(),
                    "routine did not resume after full resync"
                );
            }
        }

        match &result {
            Ok(report) => info!(
                total_synced = report.total_synced,
                cleared = report.cleared_count,
                pages = report.pages_fetched,
                failed_pages = report.failed_pages,
                "full resync finished"
            ),
            Err(e) => warn!(error = %e, "full resync aborted"),
        }
        result
    }

    async fn run(&self) -> Result<ResyncReport> {
        let mut report = ResyncReport::default();

        loop {
            let deleted = self.store.delete_batch(self.batch_size).await?;
            report.cleared_count += deleted;
            if deleted < self.batch_size {
                break;
            }
        }
        info!(cleared = report.cleared_count, "downstream incidents cleared");

        self.watermark.invalidate();
        self.types.reload(self.store.as_ref()).await?;
        let types = self.types.snapshot();

        let first = self.upstream.records()?.query("page", "1");
        let mut walker = PageWalker::new(&self.upstream, first, self.page_delay);
        while let Some(page) = walker.next_page().await {
            let page = page?;
            let mapped: Vec<Incident> = page
                .records
                .iter()
                .map(|r| map_incident(r, &types))
                .collect();
            match self.store.insert_many(&mapped).await {
                Ok(ids) => report.total_synced += ids.len(),
                Err(e) => {
                    report.failed_pages += 1;
                    warn!(
                        page = page.number,
                        records = mapped.len(),
                        error = %e,
                        "page insert failed; continuing"
                    );
                }
            }
        }
        report.pages_fetched = walker.fetched();
        self.watermark.invalidate();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use crate::store::SqliteStore;
    use crate::testing::{config, page, FakeUpstream, BASE};
    use async_trait::async_trait;
    use chrono::Utc;
    use firewatch_fetch::FetchResponse;
    use firewatch_scheduler::{LogEntry, Result as RoutineResult, RoutineStatus};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    /// Records lifecycle calls instead of running anything.
    #[derive(Default)]
    struct Recorder {
        running: Mutex<bool>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn running() -> Self {
            Self {
                running: Mutex::new(true),
                ..Default::default()
            }
        }

        fn snapshot(&self) -> RoutineStatus {
            RoutineStatus {
                name: "dispatch".into(),
                running: *self.running.lock(),
                interval_ms: 60_000,
                execution_count: 0,
                average_execution_time_ms: None,
                last_execution_time_ms: None,
                started_at: None,
                last_execution_at: None,
                next_execution_estimate: None,
                stop_reason: None,
                in_flight: 0,
            }
        }
    }

    #[async_trait]
    impl RoutineControl for Recorder {
        fn name(&self) -> &str {
            "dispatch"
        }

        async fn start(&self) -> RoutineResult<RoutineStatus> {
            self.calls.lock().push("start");
            *self.running.lock() = true;
            Ok(self.snapshot())
        }

        async fn stop(&self, _cause: Option<String>) -> RoutineResult<RoutineStatus> {
            self.calls.lock().push("stop");
            let mut running = self.running.lock();
            if !*running {
                return Err(RoutineError::NotRunning {
                    name: "dispatch".into(),
                });
            }
            *running = false;
            drop(running);
            Ok(self.snapshot())
        }

        async fn execute(&self) -> RoutineResult<RoutineStatus> {
            Ok(self.snapshot())
        }

        async fn status(&self) -> RoutineResult<RoutineStatus> {
            Ok(self.snapshot())
        }

        async fn reset_stats(&self) -> RoutineResult<RoutineStatus> {
            Ok(self.snapshot())
        }

        fn stats_json(&self) -> Value {
            Value::Null
        }

        fn logs(&self, _limit: usize) -> Vec<LogEntry> {
            Vec::new()
        }
    }

    fn resync(upstream: &FakeUpstream, store: Arc<SqliteStore>) -> FullResync {
        FullResync::new(
            upstream.client(&config()),
            store,
            Arc::new(WatermarkCache::new()),
            Arc::new(TypeCache::default()),
            2,
            Duration::ZERO,
        )
    }

    fn stale(n: usize) -> Vec<Incident> {
        (0..n)
            .map(|i| Incident {
                upstream_id: format!("old-{i}"),
                created_at: Utc::now(),
                narrative: None,
                incident_type: "Medical".into(),
                type_code: None,
                type_id: None,
                address: None,
                city: None,
                state: None,
                location: Location::default(),
                cross_reference_id: None,
            })
            .collect()
    }

    fn first_page() -> String {
        format!("{BASE}/records?page=1")
    }

    #[tokio::test]
    async fn two_pages_are_fetched_and_counted() {
        let upstream = FakeUpstream::new();
        let second = format!("{BASE}/records?page=2");
        upstream.route(
            &first_page(),
            page(json!([{ "id": 1, "created_at": "2024-05-01T10:00:00Z" }]), Some(&second)),
        );
        upstream.route(
            &second,
            page(json!([{ "id": 2, "created_at": "2024-05-01T10:01:00Z" }]), None),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.insert_many(&stale(5)).await.unwrap();
        let resync = resync(&upstream, store.clone());
        let routine = Recorder::running();

        let report = resync.resync(&routine).await.unwrap();
        assert_eq!(report.total_synced, 2);
        assert_eq!(report.cleared_count, 5);
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.failed_pages, 0);
        assert_eq!(upstream.calls(), vec![first_page(), second]);
        assert_eq!(store.count().await.unwrap(), 2);

        assert_eq!(*routine.calls.lock(), vec!["stop", "start"]);
        assert!(!resync.is_syncing());
    }

    #[tokio::test]
    async fn stopped_routine_is_left_stopped() {
        let upstream = FakeUpstream::new();
        upstream.route(&first_page(), page(json!([]), None));
        let resync = resync(&upstream, Arc::new(SqliteStore::in_memory().unwrap()));
        let routine = Recorder::default();

        let report = resync.resync(&routine).await.unwrap();
        assert_eq!(report.total_synced, 0);
        assert_eq!(*routine.calls.lock(), vec!["stop"]);
    }

    #[tokio::test]
    async fn upstream_failure_still_resumes_routine() {
        let upstream = FakeUpstream::new();
        upstream.route(&first_page(), FetchResponse::new(503, "unavailable"));
        let resync = resync(&upstream, Arc::new(SqliteStore::in_memory().unwrap()));
        let routine = Recorder::running();

        let err = resync.resync(&routine).await.unwrap_err();
        assert_eq!(err.code(), "exhausted_retries");
        assert_eq!(*routine.calls.lock(), vec!["stop", "start"]);
        assert!(*routine.running.lock());
        assert!(!resync.is_syncing());
    }

    #[tokio::test]
    async fn concurrent_resync_is_refused() {
        let upstream = FakeUpstream::new();
        let resync = resync(&upstream, Arc::new(SqliteStore::in_memory().unwrap()));
        resync.is_syncing.store(true, Ordering::SeqCst);

        let err = resync.resync(&Recorder::running()).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncInProgress));
        assert!(err.is_conflict());
        assert!(upstream.calls().is_empty());
    }
}
