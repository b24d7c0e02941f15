//! Agent session - the poll/execute/report loop.
//!
//! ```text
//!   start(credential)
//!         │
//!         ▼
//!   ┌────────────┐  204   ┌───────────┐
//!   │ Connecting │──────▶│ Connected │◀──────────────┐
//!   └─────┬──────┘        └─────┬─────┘               │
//!         │ poll ◀──────────────┘                     │
//!         ├── 200 ──▶ Busy ──▶ execute ──▶ submit ────┘
//!         ├── error ─▶ Disconnected ──▶ backoff ──▶ poll
//!         └── cancel ─▶ Disconnected (stopped)
//! ```
//!
//! Exactly one loop runs per session. Starting again cancels the running loop and waits
//! for it to exit before the new one issues its first poll.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{ConnectionStatus, EventSink, LogLevel};
use crate::executor::{TaskContext, TaskRegistry};
use crate::remote::{PollOutcome, RemoteChannel};
use crate::settings::SharedSettingsStore;
use crate::task::{ResultEnvelope, Task};


/// Delay applied after a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay after every failure.
    Fixed(Duration),
    /// Doubles per consecutive failure, starting at `initial`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(Duration::from_secs(15))
    }
}

impl BackoffPolicy {
    /// Delay before the next poll, given how many failures preceded this one.
    pub fn delay(&self, previous_failures: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(interval) => interval,
            BackoffPolicy::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(previous_failures.min(16));
                initial.saturating_mul(factor).min(max.max(initial))
            }
        }
    }
}

/// Collaborators shared by every loop a session starts.
#[derive(Clone)]
pub struct AgentDeps {
    pub channel: Arc<dyn RemoteChannel>,
    pub registry: Arc<TaskRegistry>,
    pub settings: SharedSettingsStore,
    pub events: EventSink,
    pub backoff: BackoffPolicy,
    /// Base URL used when settings carry no override
    pub default_base_url: String,
}

/// Cancellation handle for one running loop.
pub struct AgentHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl AgentHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop and wait until it has exited.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::error!("Agent loop terminated abnormally: {}", e);
        }
    }
}

/// Owns the single active agent loop.
pub struct AgentSession {
    deps: AgentDeps,
    /// Serialises start/stop so two restarts never interleave.
    lifecycle: Mutex<()>,
    /// Only held briefly; never across an await on the loop itself.
    active: Mutex<Option<AgentHandle>>,
}

impl AgentSession {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            deps,
            lifecycle: Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.deps.events
    }

    /// Start polling with `credential`, retiring any loop that is already running.
    ///
    /// Returns `false` without touching the network when the credential is absent or empty.
    pub async fn start(&self, credential: Option<String>) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            tracing::debug!("Retiring previous agent loop");
            previous.stop().await;
        }

        let Some(credential) = credential.filter(|c| !c.trim().is_empty()) else {
            self.deps
                .events
                .update_status(ConnectionStatus::Disconnected, "API key not configured.");
            return false;
        };

        let base_url = self
            .deps
            .settings
            .agent_service_url()
            .await
            .unwrap_or_else(|| self.deps.default_base_url.clone());

        let cancel = CancellationToken::new();
        let agent_loop = AgentLoop {
            deps: self.deps.clone(),
            credential,
            base_url,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(agent_loop.run());
        *self.active.lock().await = Some(AgentHandle { cancel, join });
        true
    }

    /// Cancel-then-restart using the credential currently in the settings store.
    pub async fn restart_from_settings(&self) -> bool {
        let credential = self.deps.settings.api_key().await;
        self.start(credential).await
    }

    /// Stop the active loop, if any, and wait for it to exit.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let handle = self.active.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

/// One invocation of the loop. Credential and base URL are fixed for its lifetime.
struct AgentLoop {
    deps: AgentDeps,
    credential: String,
    base_url: String,
    cancel: CancellationToken,
}

impl AgentLoop {
    async fn run(self) {
        let events = &self.deps.events;
        events.update_status(
            ConnectionStatus::Connecting,
            "Connecting to the task platform...",
        );
        events.log(LogLevel::Info, "Starting persistent connection...");

        let mut failures: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                events.log(LogLevel::Warn, "Connection stopped.");
                events.update_status(
                    ConnectionStatus::Disconnected,
                    "Stopped by operator or configuration change.",
                );
                break;
            }

            let outcome = self
                .deps
                .channel
                .poll(&self.credential, &self.base_url, &self.cancel)
                .await;

            match outcome {
                PollOutcome::Task(task) => {
                    failures = 0;
                    self.process(task).await;
                    if !self.cancel.is_cancelled() {
                        events.update_status(
                            ConnectionStatus::Connected,
                            "Connected. Waiting for tasks...",
                        );
                    }
                }
                PollOutcome::Empty => {
                    failures = 0;
                    events.update_status(
                        ConnectionStatus::Connected,
                        "Connected. No pending tasks.",
                    );
                }
                PollOutcome::Failed(e) => {
                    let delay = self.deps.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    events.log(
                        LogLevel::Error,
                        format!("Connection error: {}. Retrying in {:?}.", e, delay),
                    );
                    events.update_status(
                        ConnectionStatus::Disconnected,
                        "Connection error. Retrying...",
                    );
                    // Cancellation cuts the wait short; the check at the top reports it.
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                PollOutcome::Cancelled => {}
            }
        }
    }

    /// Execute one task and report its result. Never aborted by cancellation.
    async fn process(&self, task: Task) {
        let events = &self.deps.events;
        events.update_status(
            ConnectionStatus::Busy,
            format!("Processing task {}...", task.id),
        );
        events.log(
            LogLevel::Info,
            format!("Task received: {} (ID: {})", task.kind, task.id),
        );

        // Pin the descriptor for this task; a concurrent save applies to the next one.
        let ctx = TaskContext {
            database: self.deps.settings.pos_config().await,
        };
        let result = self.deps.registry.execute(&task, &ctx).await;

        match &result.error {
            None => events.log(LogLevel::Success, format!("Task {} completed.", task.id)),
            Some(error) => events.log(
                LogLevel::Error,
                format!("Error processing task {}: {}", task.id, error),
            ),
        }

        let envelope = ResultEnvelope {
            task_id: task.id,
            result,
        };
        if let Err(e) = self
            .deps
            .channel
            .submit_result(&self.credential, &self.base_url, &envelope)
            .await
        {
            events.log(
                LogLevel::Error,
                format!(
                    "Could not submit the result of task {}: {}",
                    envelope.task_id, e
                ),
            );
        }
    }
}
