use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::{
    error::{Result, RoutineError},
    handle::RoutineHandle,
    log::RoutineLog,
    task::{RoutineHooks, RoutineTask, TaskFailure},
    types::{millis, ExecutionTimes, RoutineDescriptor, RoutineStatus, StopReason},
};

/// Depth of the command queue between handles and the engine.
const COMMAND_BUFFER: usize = 32;

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Messages a [`RoutineHandle`] sends to the engine.
pub(crate) enum Command {
    Start {
        reply: Reply<Result<RoutineStatus>>,
    },
    Stop {
        cause: Option<String>,
        reply: Reply<Result<RoutineStatus>>,
    },
    Execute {
        reply: Reply<Result<RoutineStatus>>,
    },
    Status {
        reply: Reply<RoutineStatus>,
    },
    ResetStats {
        reply: Reply<RoutineStatus>,
    },
}

/// Who asked for an execution, and where its outcome goes.
enum Trigger {
    Timer,
    Start(Reply<Result<RoutineStatus>>),
    Manual(Reply<Result<RoutineStatus>>),
}

impl Trigger {
    fn label(&self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Start(_) => "start",
            Trigger::Manual(_) => "manual",
        }
    }
}

/// Reported back by a spawned execution when the task body returns.
struct Finished {
    generation: u64,
    elapsed: Duration,
    result: std::result::Result<(), TaskFailure>,
    trigger: Trigger,
}

/// Mutable state owned exclusively by the engine task.
///
/// Invariant: `timer` is only `Some` while `running`. It stays `None` until
/// the execution that `start()` runs has finished.
#[derive(Default)]
struct RuntimeState {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    last_execution_at: Option<DateTime<Utc>>,
    execution_count: u64,
    execution_times: ExecutionTimes,
    stop_reason: Option<StopReason>,
    timer: Option<Interval>,
    in_flight: usize,
    /// Bumped on every successful start; failures from an older run must not
    /// stop a newer one.
    generation: u64,
}

/// Single owner of one routine's runtime state and timer.
pub struct RoutineEngine<T: RoutineTask> {
    descriptor: Arc<RoutineDescriptor>,
    task: Arc<T>,
    hooks: Arc<dyn RoutineHooks>,
    log: RoutineLog,
    state: RuntimeState,
    commands: mpsc::Receiver<Command>,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
}

impl<T: RoutineTask> RoutineEngine<T> {
    /// Build an engine plus the handle that controls it. Nothing runs until
    /// [`RoutineEngine::run`] is polled; see [`RoutineHandle::spawn`].
    pub fn new(
        descriptor: RoutineDescriptor,
        task: Arc<T>,
        hooks: Arc<dyn RoutineHooks>,
        log: RoutineLog,
    ) -> (Self, RoutineHandle<T>) {
        let descriptor = Arc::new(descriptor);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let handle = RoutineHandle::new(
            Arc::clone(&descriptor),
            cmd_tx,
            Arc::clone(&task),
            log.clone(),
        );
        let engine = Self {
            descriptor,
            task,
            hooks,
            log,
            state: RuntimeState::default(),
            commands: cmd_rx,
            finished_tx,
            finished_rx,
        };
        (engine, handle)
    }

    /// Event loop. Exits once every handle has been dropped; executions still
    /// in flight at that point finish on their own tasks.
    pub async fn run(mut self) {
        debug!(routine = %self.descriptor.name, "routine engine started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(done) = self.finished_rx.recv() => self.on_finished(done).await,
                _ = next_tick(&mut self.state.timer) => self.begin_execution(Trigger::Timer),
            }
        }
        debug!(routine = %self.descriptor.name, "routine engine shutting down");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { reply } => self.start(reply).await,
            Command::Stop { cause, reply } => {
                let result = if self.state.running {
                    self.stop(cause.map(StopReason::new)).await;
                    Ok(self.status())
                } else {
                    Err(RoutineError::NotRunning {
                        name: self.descriptor.name.clone(),
                    })
                };
                let _ = reply.send(result);
            }
            Command::Execute { reply } => self.begin_execution(Trigger::Manual(reply)),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::ResetStats { reply } => {
                self.task.reset_stats();
                self.state.execution_times.clear();
                self.state.execution_count = 0;
                self.log.info("statistics reset");
                let _ = reply.send(self.status());
            }
        }
    }

    async fn start(&mut self, reply: Reply<Result<RoutineStatus>>) {
        if self.state.running {
            let _ = reply.send(Err(RoutineError::AlreadyRunning {
                name: self.descriptor.name.clone(),
            }));
            return;
        }

        if let Some(reason) = self.hooks.should_not_start().await {
            self.log.warn(format!("start refused: {reason}"));
            let _ = reply.send(Err(RoutineError::StartRefused { reason }));
            return;
        }

        let previous_start = self.state.started_at;
        self.state.running = true;
        self.state.started_at = Some(Utc::now());
        self.state.stop_reason = None;

        if let Err(failure) = self.hooks.on_start().await {
            self.state.running = false;
            self.state.started_at = previous_start;
            self.log
                .error(format!("on_start hook failed: {}", failure.chain));
            let _ = reply.send(Err(RoutineError::HookFailed {
                hook: "on_start",
                code: failure.code,
                message: failure.message,
            }));
            return;
        }

        self.state.generation += 1;
        self.log.info(format!(
            "routine started (interval {}ms)",
            millis(self.descriptor.interval)
        ));
        // The timer is armed and the start reply sent once this first
        // execution finishes.
        self.begin_execution(Trigger::Start(reply));
    }

    /// First tick one full interval from now.
    fn arm_timer(&mut self) {
        let interval = self.descriptor.interval;
        let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.state.timer = Some(timer);
    }

    /// Cancel the timer, run `on_stop`, and mark the routine stopped.
    /// Executions already in flight are not cancelled.
    async fn stop(&mut self, reason: Option<StopReason>) {
        self.state.timer = None;
        if let Err(failure) = self.hooks.on_stop().await {
            self.log
                .warn(format!("on_stop hook failed: {}", failure.chain));
        }
        self.state.running = false;
        let message = match reason {
            Some(reason) => {
                let message = format!("routine stopped: {}", reason.message);
                self.state.stop_reason = Some(reason);
                message
            }
            None => "routine stopped".to_string(),
        };
        self.log.info(message);
    }

    fn begin_execution(&mut self, trigger: Trigger) {
        self.state.last_execution_at = Some(Utc::now());
        self.state.execution_count += 1;
        self.state.in_flight += 1;

        debug!(
            routine = %self.descriptor.name,
            trigger = trigger.label(),
            execution = self.state.execution_count,
            "execution starting"
        );

        let task = Arc::clone(&self.task);
        let finished_tx = self.finished_tx.clone();
        let generation = self.state.generation;
        tokio::spawn(async move {
            let started = Instant::now();
            // Run the body on its own task so a panic is reported as a
            // failure instead of silently dropping the reply.
            let result = match tokio::spawn(async move { task.execute().await }).await {
                Ok(result) => result,
                Err(join_err) => Err(TaskFailure::new(
                    "task_panicked",
                    format!("task body panicked: {join_err}"),
                )),
            };
            let _ = finished_tx.send(Finished {
                generation,
                elapsed: started.elapsed(),
                result,
                trigger,
            });
        });
    }

    async fn on_finished(&mut self, done: Finished) {
        self.state.in_flight = self.state.in_flight.saturating_sub(1);
        self.state.execution_times.push(done.elapsed);

        let is_start = matches!(done.trigger, Trigger::Start(_));
        let current = self.state.running && done.generation == self.state.generation;
        let reply = match done.trigger {
            Trigger::Timer => None,
            Trigger::Start(reply) | Trigger::Manual(reply) => Some(reply),
        };

        let result = match done.result {
            Ok(()) => {
                debug!(
                    routine = %self.descriptor.name,
                    elapsed_ms = millis(done.elapsed),
                    "execution completed"
                );
                if is_start && current {
                    self.arm_timer();
                }
                Ok(())
            }
            Err(failure) => {
                self.log
                    .error(format!("execution failed: {}", failure.chain));
                if current {
                    let reason = StopReason::new(failure.message.clone()).with_cause(failure.chain);
                    self.stop(Some(reason)).await;
                } else {
                    info!(
                        routine = %self.descriptor.name,
                        "failed execution belonged to a finished run; schedule untouched"
                    );
                }
                Err(RoutineError::ExecutionFailed {
                    code: failure.code,
                    message: failure.message,
                })
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result.map(|()| self.status()));
        }
    }

    fn status(&self) -> RoutineStatus {
        let state = &self.state;
        let interval = self.descriptor.interval;
        let next_execution_estimate = if state.running {
            state
                .last_execution_at
                .or(state.started_at)
                .and_then(|base| chrono::Duration::from_std(interval).ok().map(|d| base + d))
        } else {
            None
        };

        RoutineStatus {
            name: self.descriptor.name.clone(),
            running: state.running,
            interval_ms: millis(interval),
            execution_count: state.execution_count,
            average_execution_time_ms: state.execution_times.average().map(millis),
            last_execution_time_ms: state.execution_times.last().map(millis),
            started_at: state.started_at,
            last_execution_at: state.last_execution_at,
            next_execution_estimate,
            stop_reason: state.stop_reason.clone(),
            in_flight: state.in_flight,
        }
    }
}

/// Resolves on the next timer tick, or never when no timer is armed.
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
