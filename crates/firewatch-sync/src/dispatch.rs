//! The dispatch routine: incremental poll plus cross-reference enrichment,
//! with a full resync available out of band.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use firewatch_core::{FirewatchConfig, Resettable, SharedStats};
use firewatch_fetch::{HttpTransport, RetryPolicy, RetryStats, RetryableFetch};
use firewatch_scheduler::{
    RoutineDescriptor, RoutineHandle, RoutineHooks, RoutineLog, RoutineTask, TaskFailure,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::diff::{DiffReconciler, ReconcileOutcome};
use crate::error::Result;
use crate::incremental::IncrementalSync;
use crate::model::TypeCache;
use crate::resync::{FullResync, ResyncReport};
use crate::store::RecordStore;
use crate::upstream::Upstream;
use crate::watermark::WatermarkCache;

pub const ROUTINE_NAME: &str = "dispatch";

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub checks: u64,
    pub skipped_checks: u64,
    pub new_records: u64,
    pub last_new_record_at: Option<DateTime<Utc>>,
    pub diffs_applied: u64,
    pub diff_failures: u64,
    pub full_resyncs: u64,
    pub last_resync: Option<ResyncReport>,
}

impl Resettable for DispatchStats {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What `GET /stats` returns for the dispatch routine.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    #[serde(flatten)]
    pub dispatch: DispatchStats,
    pub retry: RetryStats,
}

/// Task body and lifecycle hooks for the dispatch feed.
pub struct DispatchRoutine {
    config: Arc<FirewatchConfig>,
    upstream: Arc<Upstream>,
    store: Arc<dyn RecordStore>,
    types: Arc<TypeCache>,
    incremental: IncrementalSync,
    diff: DiffReconciler,
    resync: FullResync,
    stats: SharedStats<DispatchStats>,
}

impl DispatchRoutine {
    pub fn new(
        config: Arc<FirewatchConfig>,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let fetch = RetryableFetch::new(transport, RetryPolicy::from(&config.retry));
        Self::with_fetch(config, store, fetch)
    }

    pub fn with_fetch(
        config: Arc<FirewatchConfig>,
        store: Arc<dyn RecordStore>,
        fetch: RetryableFetch,
    ) -> Self {
        let upstream = Arc::new(Upstream::new(fetch, Arc::clone(&config)));
        let watermark = Arc::new(WatermarkCache::new());
        let types = Arc::new(TypeCache::default());
        let dispatch = &config.dispatch;

        let incremental = IncrementalSync::new(
            Arc::clone(&upstream),
            Arc::clone(&store),
            Arc::clone(&watermark),
            Arc::clone(&types),
            Duration::seconds(dispatch.since_pad_secs),
        );
        let diff = DiffReconciler::new(
            Arc::clone(&upstream),
            Arc::clone(&store),
            Arc::clone(&types),
            Duration::seconds(dispatch.diff_window_secs),
        );
        let resync = FullResync::new(
            Arc::clone(&upstream),
            Arc::clone(&store),
            watermark,
            Arc::clone(&types),
            dispatch.delete_batch_size,
            dispatch.page_delay(),
        );

        Self {
            config,
            upstream,
            store,
            types,
            incremental,
            diff,
            resync,
            stats: SharedStats::default(),
        }
    }

    /// Spawn the routine's engine. The routine starts stopped.
    pub fn spawn(self) -> RoutineHandle<Self> {
        let descriptor = RoutineDescriptor::new(ROUTINE_NAME, self.config.dispatch.interval());
        let routine = Arc::new(self);
        let hooks: Arc<dyn RoutineHooks> = routine.clone();
        RoutineHandle::spawn(descriptor, routine, hooks, RoutineLog::new(ROUTINE_NAME))
    }

    pub fn is_syncing(&self) -> bool {
        self.resync.is_syncing()
    }

    /// Run a full resync against `handle`, suspending and resuming it.
    pub async fn full_resync(&self, handle: &RoutineHandle<Self>) -> Result<ResyncReport> {
        let report = self.resync.resync(handle).await?;
        self.stats.update(|s| {
            s.full_resyncs += 1;
            s.last_resync = Some(report.clone());
        });
        Ok(report)
    }
}

#[async_trait]
impl RoutineTask for DispatchRoutine {
    type Stats = DispatchReport;

    async fn execute(&self) -> std::result::Result<(), TaskFailure> {
        if self.resync.is_syncing() {
            debug!("full resync in progress; skipping incremental poll");
            self.stats.update(|s| s.skipped_checks += 1);
            return Ok(());
        }

        let outcome = self.incremental.check_for_new().await?;
        self.stats.update(|s| {
            s.checks += 1;
            if outcome.new_count > 0 {
                s.new_records += outcome.new_count as u64;
                s.last_new_record_at = Some(Utc::now());
            }
        });

        match self.diff.reconcile().await {
            ReconcileOutcome::Patched { .. } => self.stats.update(|s| s.diffs_applied += 1),
            ReconcileOutcome::Failed { .. } => self.stats.update(|s| s.diff_failures += 1),
            ReconcileOutcome::Skipped { .. } | ReconcileOutcome::Unchanged => {}
        }
        Ok(())
    }

    fn stats(&self) -> DispatchReport {
        DispatchReport {
            dispatch: self.stats.snapshot(),
            retry: self.upstream.fetch().stats().snapshot(),
        }
    }

    fn reset_stats(&self) {
        self.stats.reset();
        self.upstream.fetch().stats().reset();
    }
}

#[async_trait]
impl RoutineHooks for DispatchRoutine {
    async fn should_not_start(&self) -> Option<String> {
        self.resync
            .is_syncing()
            .then(|| "a full resync is in progress".to_string())
    }

    async fn on_start(&self) -> std::result::Result<(), TaskFailure> {
        self.upstream.check_credentials()?;
        let configured = &self.config.dispatch.incident_types;
        if !configured.is_empty() {
            let added = self.store.register_incident_types(configured).await?;
            debug!(added, "registered configured incident types");
        }
        let types = self.types.reload(self.store.as_ref()).await?;
        info!(types, "dispatch routine ready");
        Ok(())
    }

    async fn on_stop(&self) -> std::result::Result<(), TaskFailure> {
        let total_records = self.store.count().await?;
        info!(total_records, "dispatch routine stopped");
        Ok(())
    }
}
