use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::{
    engine::{Command, RoutineEngine},
    error::{Result, RoutineError},
    log::{LogEntry, RoutineLog},
    task::{RoutineHooks, RoutineTask},
    types::{RoutineDescriptor, RoutineStatus},
};

/// Cloneable front door to one running [`RoutineEngine`].
pub struct RoutineHandle<T: RoutineTask> {
    descriptor: Arc<RoutineDescriptor>,
    commands: mpsc::Sender<Command>,
    task: Arc<T>,
    log: RoutineLog,
}

impl<T: RoutineTask> Clone for RoutineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            descriptor: Arc::clone(&self.descriptor),
            commands: self.commands.clone(),
            task: Arc::clone(&self.task),
            log: self.log.clone(),
        }
    }
}

impl<T: RoutineTask> RoutineHandle<T> {
    pub(crate) fn new(
        descriptor: Arc<RoutineDescriptor>,
        commands: mpsc::Sender<Command>,
        task: Arc<T>,
        log: RoutineLog,
    ) -> Self {
        Self {
            descriptor,
            commands,
            task,
            log,
        }
    }

    /// Spawn the engine on the current runtime and return its handle.
    /// The routine starts stopped.
    pub fn spawn(
        descriptor: RoutineDescriptor,
        task: Arc<T>,
        hooks: Arc<dyn RoutineHooks>,
        log: RoutineLog,
    ) -> Self {
        let (engine, handle) = RoutineEngine::new(descriptor, task, hooks, log);
        tokio::spawn(engine.run());
        handle
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    /// Run once, then arm the schedule; resolves after that first execution.
    pub async fn start(&self) -> Result<RoutineStatus> {
        self.request(|reply| Command::Start { reply }).await?
    }

    pub async fn stop(&self, cause: Option<String>) -> Result<RoutineStatus> {
        self.request(|reply| Command::Stop { cause, reply }).await?
    }

    /// Run the task once now, whether or not the schedule is armed.
    pub async fn execute(&self) -> Result<RoutineStatus> {
        self.request(|reply| Command::Execute { reply }).await?
    }

    pub async fn status(&self) -> Result<RoutineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn reset_stats(&self) -> Result<RoutineStatus> {
        self.request(|reply| Command::ResetStats { reply }).await
    }

    pub fn stats(&self) -> T::Stats {
        self.task.stats()
    }

    pub fn logs(&self, limit: usize) -> Vec<LogEntry> {
        self.log.recent(limit)
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> RoutineError {
        RoutineError::Unavailable {
            name: self.descriptor.name.clone(),
        }
    }
}

/// Type-erased routine control, for callers that do not care about the
/// task's stats type (the HTTP surface, the resync controller).
#[async_trait]
pub trait RoutineControl: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<RoutineStatus>;

    async fn stop(&self, cause: Option<String>) -> Result<RoutineStatus>;

    async fn execute(&self) -> Result<RoutineStatus>;

    async fn status(&self) -> Result<RoutineStatus>;

    async fn reset_stats(&self) -> Result<RoutineStatus>;

    fn stats_json(&self) -> serde_json::Value;

    fn logs(&self, limit: usize) -> Vec<LogEntry>;
}

#[async_trait]
impl<T: RoutineTask> RoutineControl for RoutineHandle<T> {
    fn name(&self) -> &str {
        RoutineHandle::name(self)
    }

    async fn start(&self) -> Result<RoutineStatus> {
        RoutineHandle::start(self).await
    }

    async fn stop(&self, cause: Option<String>) -> Result<RoutineStatus> {
        RoutineHandle::stop(self, cause).await
    }

    async fn execute(&self) -> Result<RoutineStatus> {
        RoutineHandle::execute(self).await
    }

    async fn status(&self) -> Result<RoutineStatus> {
        RoutineHandle::status(self).await
    }

    async fn reset_stats(&self) -> Result<RoutineStatus> {
        RoutineHandle::reset_stats(self).await
    }

    fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or(serde_json::Value::Null)
    }

    fn logs(&self, limit: usize) -> Vec<LogEntry> {
        RoutineHandle::logs(self, limit)
    }
}
