//! Base Agent and Tasks
//!
//! [`LocalAgent`] is the in-process agent skeleton: a handler table per
//! task type, a handler table per event kind, and a narrow [`HubFacade`]
//! for talking back to the hub. Agents never hold the hub itself.
//!
//! [`Task`] carries retry semantics: terminal states are COMPLETED,
//! FAILED, CANCELLED, and TIMEOUT; a failed or timed-out task can spawn a
//! retry clone that points back at its parent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{Envelope, EventKind, Priority};
use crate::registry::{AgentRecord, AgentStatus};

/// Narrow hub interface handed to agents at construction.
#[async_trait]
pub trait HubFacade: Send + Sync {
    /// Submit an envelope for dispatch.
    async fn send(&self, env: Envelope) -> Result<()>;

    /// Register an agent record.
    async fn register(&self, record: AgentRecord) -> Result<bool>;

    /// Update an agent's status.
    async fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        metrics: Option<Map<String, Value>>,
    ) -> Result<bool>;
}

// ============ Tasks ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Assigned,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }
}

/// One unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub child_task_ids: Vec<String>,
    pub priority: Priority,
    pub timeout_seconds: Option<f64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl Task {
    pub fn new(task_type: &str, parameters: Map<String, Value>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            parameters,
            parent_task_id: None,
            child_task_ids: Vec::new(),
            priority: Priority::Medium,
            timeout_seconds: None,
            retry_count: 0,
            max_retries: 3,
            status: TaskStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: f64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.result = Some(Value::String(error.to_string()));
    }

    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Flip an in-progress task to TIMEOUT once its deadline has passed.
    pub fn is_timed_out(&mut self) -> bool {
        if self.status != TaskStatus::InProgress {
            return self.status == TaskStatus::Timeout;
        }
        let (Some(started), Some(timeout)) = (self.started_at, self.timeout_seconds) else {
            return false;
        };
        let elapsed = Utc::now().signed_duration_since(started).num_milliseconds() as f64 / 1000.0;
        if elapsed > timeout {
            self.status = TaskStatus::Timeout;
            self.completed_at = Some(Utc::now());
            return true;
        }
        false
    }

    /// A task can retry iff it failed or timed out with retries remaining.
    pub fn can_retry(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::Timeout)
            && self.retry_count < self.max_retries
    }

    /// A fresh task with the same parameters, one more retry, and this
    /// task recorded as its parent.
    pub fn create_retry(&self) -> Task {
        let mut retry = Task::new(&self.task_type, self.parameters.clone());
        retry.priority = self.priority;
        retry.timeout_seconds = self.timeout_seconds;
        retry.max_retries = self.max_retries;
        retry.retry_count = self.retry_count + 1;
        retry.parent_task_id = Some(self.task_id.clone());
        retry
    }
}

/// Async handler for one task type.
pub type TaskHandler =
    Arc<dyn Fn(Task) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Async handler for one event kind.
pub type AgentMessageHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`TaskHandler`].
pub fn task_handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |task| Box::pin(f(task)))
}

/// Wrap an async closure as an [`AgentMessageHandler`].
pub fn agent_message_handler<F, Fut>(f: F) -> AgentMessageHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |env| Box::pin(f(env)))
}

// ============ Local agent ============

/// In-process agent skeleton.
pub struct LocalAgent {
    agent_id: String,
    kind: String,
    facade: Arc<dyn HubFacade>,
    task_handlers: RwLock<HashMap<String, TaskHandler>>,
    message_handlers: RwLock<HashMap<EventKind, AgentMessageHandler>>,
    tasks: RwLock<HashMap<String, Task>>,
}

impl LocalAgent {
    pub fn new(agent_id: &str, kind: &str, facade: Arc<dyn HubFacade>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            kind: kind.to_string(),
            facade,
            task_handlers: RwLock::new(HashMap::new()),
            message_handlers: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Register this agent with the hub.
    pub async fn register(&self, record: AgentRecord) -> Result<bool> {
        self.facade.register(record).await
    }

    pub async fn register_task_handler(&self, task_type: &str, handler: TaskHandler) {
        self.task_handlers
            .write()
            .await
            .insert(task_type.to_string(), handler);
    }

    pub async fn register_message_handler(&self, kind: EventKind, handler: AgentMessageHandler) {
        self.message_handlers.write().await.insert(kind, handler);
    }

    /// Dispatch an envelope to the handler registered for its kind.
    pub async fn handle_message(&self, env: Envelope) {
        let handler = self.message_handlers.read().await.get(&env.event_kind).cloned();
        match handler {
            Some(handler) => handler(env).await,
            None => debug!(
                agent_id = %self.agent_id,
                kind = %env.event_kind.as_str(),
                "no handler for message kind"
            ),
        }
    }

    /// Create and store a task in ASSIGNED state. Returns the task id.
    pub async fn assign_task(
        &self,
        task_type: &str,
        parameters: Map<String, Value>,
        priority: Priority,
        timeout_seconds: Option<f64>,
    ) -> String {
        let mut task = Task::new(task_type, parameters).with_priority(priority);
        task.timeout_seconds = timeout_seconds;
        task.status = TaskStatus::Assigned;
        let task_id = task.task_id.clone();
        self.tasks.write().await.insert(task_id.clone(), task);
        task_id
    }

    /// Run one task to a terminal state: COMPLETED, FAILED, or TIMEOUT.
    pub async fn handle_task(&self, mut task: Task) -> Task {
        let handler = self.task_handlers.read().await.get(&task.task_type).cloned();
        let Some(handler) = handler else {
            task.fail(&format!("no handler for task type '{}'", task.task_type));
            return task;
        };

        task.start();
        let run = handler(task.clone());
        let outcome = match task.timeout_seconds {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs_f64(secs), run).await {
                    Ok(result) => result,
                    Err(_) => {
                        task.status = TaskStatus::Timeout;
                        task.completed_at = Some(Utc::now());
                        warn!(
                            agent_id = %self.agent_id,
                            task_id = %task.task_id,
                            "task timed out"
                        );
                        return task;
                    }
                }
            }
            None => run.await,
        };

        match outcome {
            Ok(result) => task.complete(result),
            Err(e) => task.fail(&format!("{e:#}")),
        }
        task
    }

    /// Execute a stored task, retrying failed or timed-out runs up to the
    /// task's retry budget. The final attempt is stored and returned.
    pub async fn run_task(&self, task_id: &str) -> Option<Task> {
        let mut task = self.tasks.write().await.remove(task_id)?;
        loop {
            task = self.handle_task(task).await;
            if task.status == TaskStatus::Completed || !task.can_retry() {
                break;
            }
            debug!(
                task_id = %task.task_id,
                retry = task.retry_count + 1,
                "retrying task"
            );
            task = task.create_retry();
        }
        self.tasks
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        Some(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Send a message through the hub facade using the pinned signature.
    pub async fn send_message(
        &self,
        target: &str,
        kind: EventKind,
        payload: Map<String, Value>,
        priority: Option<Priority>,
        ttl_seconds: Option<f64>,
    ) -> Result<String> {
        let mut env = Envelope::new(&self.agent_id, target, kind, payload);
        if let Some(p) = priority {
            env.priority = p;
        }
        env.ttl_seconds = ttl_seconds;
        let message_id = env.message_id.clone();
        self.facade.send(env).await?;
        Ok(message_id)
    }

    /// Report a status change to the hub.
    pub async fn update_status(
        &self,
        status: AgentStatus,
        metrics: Option<Map<String, Value>>,
    ) -> Result<bool> {
        self.facade
            .update_status(&self.agent_id, status, metrics)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NullFacade;

    #[async_trait]
    impl HubFacade for NullFacade {
        async fn send(&self, _env: Envelope) -> Result<()> {
            Ok(())
        }
        async fn register(&self, _record: AgentRecord) -> Result<bool> {
            Ok(true)
        }
        async fn update_status(
            &self,
            _agent_id: &str,
            _status: AgentStatus,
            _metrics: Option<Map<String, Value>>,
        ) -> Result<bool> {
            Ok(true)
        }
    }

    fn agent() -> LocalAgent {
        LocalAgent::new("a1", "worker", Arc::new(NullFacade))
    }

    #[test]
    fn test_task_retry_semantics() {
        let mut task = Task::new("audit", Map::new()).with_max_retries(2);
        assert_eq!(task.status, TaskStatus::Created);
        assert!(!task.can_retry());

        task.start();
        task.fail("boom");
        assert!(task.can_retry());

        let retry = task.create_retry();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.parent_task_id.as_deref(), Some(task.task_id.as_str()));
        assert_eq!(retry.status, TaskStatus::Created);
        assert_ne!(retry.task_id, task.task_id);

        let mut exhausted = retry.create_retry();
        exhausted.start();
        exhausted.fail("boom again");
        assert_eq!(exhausted.retry_count, 2);
        assert!(!exhausted.can_retry());
    }

    #[test]
    fn test_task_timeout_flips_status() {
        let mut task = Task::new("audit", Map::new()).with_timeout(0.01);
        task.start();
        task.started_at = Some(Utc::now() - chrono::Duration::seconds(1));

        assert!(task.is_timed_out());
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.can_retry());
    }

    #[test]
    fn test_cancel_is_rejected_on_terminal_tasks() {
        let mut task = Task::new("audit", Map::new());
        task.start();
        task.complete(json!({"ok": true}));
        assert!(!task.cancel());

        let mut open = Task::new("audit", Map::new());
        assert!(open.cancel());
        assert_eq!(open.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_handle_task_runs_registered_handler() {
        let agent = agent();
        agent
            .register_task_handler(
                "double",
                task_handler(|task: Task| async move {
                    let n = task.parameters["n"].as_i64().unwrap_or(0);
                    Ok(json!(n * 2))
                }),
            )
            .await;

        let mut params = Map::new();
        params.insert("n".into(), json!(21));
        let done = agent.handle_task(Task::new("double", params)).await;

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_handle_task_without_handler_fails() {
        let done = agent().handle_task(Task::new("unknown", Map::new())).await;
        assert_eq!(done.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_handle_task_enforces_timeout() {
        let agent = agent();
        agent
            .register_task_handler(
                "slow",
                task_handler(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!(null))
                }),
            )
            .await;

        let task = Task::new("slow", Map::new()).with_timeout(0.05);
        let done = agent.handle_task(task).await;
        assert_eq!(done.status, TaskStatus::Timeout);
    }

    #[tokio::test]
    async fn test_run_task_retries_until_budget() {
        let agent = agent();
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        agent
            .register_task_handler(
                "flaky",
                task_handler(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        anyhow::bail!("always fails")
                    }
                }),
            )
            .await;

        let task_id = agent
            .assign_task("flaky", Map::new(), Priority::Medium, None)
            .await;
        let done = agent.run_task(&task_id).await.unwrap();

        assert_eq!(done.status, TaskStatus::Failed);
        // Initial attempt plus the default three retries.
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert_eq!(done.retry_count, 3);
    }

    #[tokio::test]
    async fn test_handle_message_dispatches_by_kind() {
        let agent = agent();
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        agent
            .register_message_handler(
                EventKind::Command,
                agent_message_handler(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                }),
            )
            .await;

        agent
            .handle_message(Envelope::command("hub", "a1", "noop", json!({})))
            .await;
        // No handler for queries; silently ignored.
        agent
            .handle_message(Envelope::query("hub", "a1", "q", json!({})))
            .await;

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
