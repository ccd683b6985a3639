use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::execution::TaskCancellationToken;
use crate::models::{CoreError, CoreErrorKind, TaskId, TaskKind, TaskStatus};
use crate::orchestration::{OrchestrationResult, TaskLane, TaskSubmission};

pub type TaskOperation = Box<
    dyn FnOnce(
            TaskCancellationToken,
        ) -> Pin<Box<dyn Future<Output = OrchestrationResult<()>> + Send>>
        + Send,
>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub kind: TaskKind,
    pub lane: TaskLane,
    pub status: TaskStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    /// Cause of a `Failed` task. A cancelled task carries a `Cancelled` error.
    pub failure: Option<CoreError>,
}

#[derive(Clone, Default)]
pub struct InMemoryAsyncTaskQueue {
    inner: Arc<Mutex<QueueState>>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, TaskSnapshot>,
    lane_locks: HashMap<TaskLane, Arc<Mutex<()>>>,
    cancellation_tokens: HashMap<TaskId, TaskCancellationToken>,
    completion_notifiers: HashMap<TaskId, Arc<Notify>>,
}

impl InMemoryAsyncTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the task as `Dispatched` and runs `operation` in the
    /// background once its lane is free.
    pub async fn spawn(
        &self,
        submission: TaskSubmission,
        operation: TaskOperation,
    ) -> OrchestrationResult<TaskId> {
        let task_id = submission.task_id;
        let (lane_lock, token, completion_notify) = {
            let mut state = self.inner.lock().await;
            if state.tasks.contains_key(&task_id) {
                return Err(CoreError::invalid_argument(format!(
                    "task id '{task_id}' was already dispatched"
                ))
                .with_task_id(task_id));
            }

            state.tasks.insert(
                task_id,
                TaskSnapshot {
                    id: task_id,
                    kind: submission.kind,
                    lane: submission.lane.clone(),
                    status: TaskStatus::Dispatched,
                    created_at: submission.requested_at,
                    started_at: None,
                    finished_at: None,
                    failure: None,
                },
            );

            let lane_lock = state
                .lane_locks
                .entry(submission.lane)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let token = TaskCancellationToken::new();
            let completion_notify = Arc::new(Notify::new());

            state.cancellation_tokens.insert(task_id, token.clone());
            state
                .completion_notifiers
                .insert(task_id, completion_notify.clone());

            (lane_lock, token, completion_notify)
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            // A task cancelled while queued behind its lane skips the wait; its
            // operation observes the token and winds down on its own.
            let _lane_guard = tokio::select! {
                guard = lane_lock.lock_owned() => Some(guard),
                () = token.cancelled() => None,
            };

            set_running(&inner, task_id).await;
            let failure = match tokio::spawn(operation(token)).await {
                Ok(outcome) => outcome.err(),
                Err(join_error) => Some(CoreError::new(
                    CoreErrorKind::Internal,
                    format!("task operation aborted: {join_error}"),
                )),
            };

            set_terminal(&inner, task_id, failure.map(|error| error.with_task_id(task_id))).await;
            completion_notify.notify_waiters();
        });

        Ok(task_id)
    }

    pub async fn snapshot(&self, task_id: TaskId) -> OrchestrationResult<TaskSnapshot> {
        let state = self.inner.lock().await;
        state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| task_lookup_error(task_id))
    }

    pub async fn status(&self, task_id: TaskId) -> OrchestrationResult<TaskStatus> {
        Ok(self.snapshot(task_id).await?.status)
    }

    /// Signals the task's cancellation token. Cancelling a terminal task is a no-op.
    pub async fn cancel(&self, task_id: TaskId) -> OrchestrationResult<()> {
        let state = self.inner.lock().await;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| task_lookup_error(task_id))?;
        if task.status.is_terminal() {
            return Ok(());
        }

        if let Some(token) = state.cancellation_tokens.get(&task_id) {
            token.cancel();
        }
        Ok(())
    }

    pub async fn wait_for_terminal(
        &self,
        task_id: TaskId,
        timeout_duration: Option<Duration>,
    ) -> OrchestrationResult<TaskSnapshot> {
        let notify = {
            let state = self.inner.lock().await;
            let task = state
                .tasks
                .get(&task_id)
                .ok_or_else(|| task_lookup_error(task_id))?;
            if task.status.is_terminal() {
                return Ok(task.clone());
            }
            state
                .completion_notifiers
                .get(&task_id)
                .cloned()
                .ok_or_else(|| task_lookup_error(task_id))?
        };

        let wait = async {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let snapshot = self.snapshot(task_id).await?;
                if snapshot.status.is_terminal() {
                    return Ok(snapshot);
                }
                notified.await;
            }
        };

        match timeout_duration {
            Some(duration) => timeout(duration, wait).await.map_err(|_| {
                CoreError::new(
                    CoreErrorKind::Timeout,
                    format!("timed out waiting for task '{task_id}' to finish"),
                )
                .with_task_id(task_id)
            })?,
            None => wait.await,
        }
    }
}

async fn set_running(inner: &Arc<Mutex<QueueState>>, task_id: TaskId) {
    let mut state = inner.lock().await;
    if let Some(task) = state.tasks.get_mut(&task_id) {
        task.status = TaskStatus::Running;
        task.started_at = Some(SystemTime::now());
    }
}

async fn set_terminal(
    inner: &Arc<Mutex<QueueState>>,
    task_id: TaskId,
    failure: Option<CoreError>,
) {
    let mut state = inner.lock().await;
    if let Some(task) = state.tasks.get_mut(&task_id) {
        task.status = if failure.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Succeeded
        };
        task.finished_at = Some(SystemTime::now());
        task.failure = failure;
    }
    state.cancellation_tokens.remove(&task_id);
    state.completion_notifiers.remove(&task_id);
}

fn task_lookup_error(task_id: TaskId) -> CoreError {
    CoreError::invalid_argument(format!("unknown task id '{task_id}'")).with_task_id(task_id)
}
