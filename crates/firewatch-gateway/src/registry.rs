use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use firewatch_scheduler::{RoutineControl, RoutineHandle};
use firewatch_sync::{DispatchRoutine, ResyncReport, SyncError};
use tracing::{info, warn};

/// A routine that also supports an out-of-band full resync.
#[async_trait]
pub trait ResyncTrigger: Send + Sync {
    async fn resync(&self) -> Result<ResyncReport, SyncError>;
}

#[async_trait]
impl ResyncTrigger for RoutineHandle<DispatchRoutine> {
    async fn resync(&self) -> Result<ResyncReport, SyncError> {
        self.task().full_resync(self).await
    }
}

#[derive(Clone)]
pub struct RegisteredRoutine {
    pub control: Arc<dyn RoutineControl>,
    pub resync: Option<Arc<dyn ResyncTrigger>>,
}

/// Every routine the gateway hosts, keyed by name.
#[derive(Clone, Default)]
pub struct RoutineRegistry {
    routines: BTreeMap<String, RegisteredRoutine>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        control: Arc<dyn RoutineControl>,
        resync: Option<Arc<dyn ResyncTrigger>>,
    ) {
        let name = control.name().to_string();
        info!(routine = %name, resync = resync.is_some(), "routine registered");
        self.routines
            .insert(name, RegisteredRoutine { control, resync });
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredRoutine> {
        self.routines.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredRoutine> {
        self.routines.values()
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Stop every routine that is still running. Used on shutdown.
    pub async fn stop_all(&self, cause: &str) {
        for routine in self.routines.values() {
            let control = &routine.control;
            match control.status().await {
                Ok(status) if status.running => {
                    if let Err(e) = control.stop(Some(cause.to_string())).await {
                        warn!(routine = control.name(), error = %e, "stop on shutdown failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(routine = control.name(), error = %e, "routine unavailable on shutdown"),
            }
        }
    }
}
