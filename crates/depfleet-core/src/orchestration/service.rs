use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::adapters::{Mutation, PackageManagerAdapter};
use crate::execution::{TaskCancellationToken, TaskLogSink};
use crate::models::{
    CoreError, CoreErrorKind, Dependency, DependencyType, InstallParams, InventoryRecord, NodeId,
    Operation, RefreshParams, TaskId, TaskKind, TaskLogLine, TaskLogStream, TaskStatus,
    UninstallParams,
};
use crate::orchestration::{
    InMemoryAsyncTaskQueue, OrchestrationResult, TaskLane, TaskOperation, TaskSnapshot,
    TaskSubmission,
};
use crate::persistence::{InventoryStore, TaskLogStore};
use crate::registry::RegistryClient;

/// Drives install and uninstall tasks on a node and keeps its inventory current.
///
/// Each task owns a log opened at dispatch. Output lines are appended while the
/// manager runs, followed by one `system` line with the outcome, and the log is
/// closed when the process ends. A successful mutation re-lists the node's
/// packages before the task turns terminal.
#[derive(Clone)]
pub struct OrchestrationService {
    adapter: Arc<dyn PackageManagerAdapter>,
    registry: Arc<RegistryClient>,
    inventory: Arc<dyn InventoryStore>,
    task_logs: Arc<dyn TaskLogStore>,
    queue: InMemoryAsyncTaskQueue,
}

struct MutationTask {
    adapter: Arc<dyn PackageManagerAdapter>,
    inventory: Arc<dyn InventoryStore>,
    command: PathBuf,
    node_id: NodeId,
    mutation: Mutation,
    args: Vec<String>,
    sink: TaskLogSink,
}

impl OrchestrationService {
    pub fn new(
        adapter: Arc<dyn PackageManagerAdapter>,
        registry: Arc<RegistryClient>,
        inventory: Arc<dyn InventoryStore>,
        task_logs: Arc<dyn TaskLogStore>,
    ) -> Self {
        Self {
            adapter,
            registry,
            inventory,
            task_logs,
            queue: InMemoryAsyncTaskQueue::new(),
        }
    }

    pub fn dependency_type(&self) -> DependencyType {
        self.adapter.dependency_type()
    }

    pub async fn next_task_id(&self) -> OrchestrationResult<TaskId> {
        let task_logs = self.task_logs.clone();
        run_blocking(move || task_logs.next_task_id()).await
    }

    pub async fn install(&self, params: InstallParams) -> OrchestrationResult<TaskId> {
        let dependency_type = self.dependency_type();
        let task_id = params.task_id;
        let attribute =
            move |error: CoreError| error.attribute(dependency_type, Some(task_id), Operation::Install);

        params.validate().map_err(attribute)?;
        let args = self.adapter.build_install_args(&params).map_err(attribute)?;

        self.dispatch(
            params.task_id,
            TaskKind::Install,
            Mutation::Install,
            params.command,
            params.node_id,
            args,
        )
        .await
    }

    pub async fn uninstall(&self, params: UninstallParams) -> OrchestrationResult<TaskId> {
        let dependency_type = self.dependency_type();
        let task_id = params.task_id;
        let attribute = move |error: CoreError| {
            error.attribute(dependency_type, Some(task_id), Operation::Uninstall)
        };

        params.validate().map_err(attribute)?;
        let args = self
            .adapter
            .build_uninstall_args(&params)
            .map_err(attribute)?;

        self.dispatch(
            params.task_id,
            TaskKind::Uninstall,
            Mutation::Uninstall,
            params.command,
            params.node_id,
            args,
        )
        .await
    }

    /// Re-lists the node's installed packages and replaces its inventory.
    pub async fn refresh_inventory(
        &self,
        params: RefreshParams,
    ) -> OrchestrationResult<Vec<Dependency>> {
        let dependency_type = self.dependency_type();
        params.validate().map_err(|error| {
            error.attribute(dependency_type, None, Operation::ListInstalled)
        })?;

        refresh_node(
            self.adapter.clone(),
            self.inventory.clone(),
            params.command,
            params.node_id,
        )
        .await
    }

    pub async fn latest_version(&self, dependency: &Dependency) -> OrchestrationResult<String> {
        let registry_type = self.registry.dependency_type();
        if dependency.dependency_type != registry_type {
            return Err(CoreError::invalid_argument(format!(
                "registry serves {} dependencies, not {}",
                registry_type.as_str(),
                dependency.dependency_type.as_str()
            ))
            .with_dependency_type(dependency.dependency_type)
            .with_operation(Operation::LatestVersion));
        }

        let registry = self.registry.clone();
        let name = dependency.name.clone();
        run_blocking(move || registry.fetch_latest_version(&name)).await
    }

    pub async fn status(&self, task_id: TaskId) -> OrchestrationResult<TaskStatus> {
        self.queue.status(task_id).await
    }

    pub async fn snapshot(&self, task_id: TaskId) -> OrchestrationResult<TaskSnapshot> {
        self.queue.snapshot(task_id).await
    }

    pub async fn wait_for_terminal(
        &self,
        task_id: TaskId,
        timeout_duration: Option<Duration>,
    ) -> OrchestrationResult<TaskSnapshot> {
        self.queue
            .wait_for_terminal(task_id, timeout_duration)
            .await
    }

    pub async fn cancel(&self, task_id: TaskId) -> OrchestrationResult<()> {
        self.queue.cancel(task_id).await
    }

    /// Waits up to `deadline` for the task, then cancels it and waits for the
    /// cancellation to land, so the task's log is always closed on return.
    pub async fn wait_or_cancel(
        &self,
        task_id: TaskId,
        deadline: Duration,
    ) -> OrchestrationResult<TaskSnapshot> {
        match self.queue.wait_for_terminal(task_id, Some(deadline)).await {
            Err(error) if error.kind == CoreErrorKind::Timeout => {
                tracing::warn!(
                    task_id = task_id.0,
                    deadline_secs = deadline.as_secs_f64(),
                    "task did not finish before its deadline; cancelling"
                );
                self.queue.cancel(task_id).await?;
                self.queue.wait_for_terminal(task_id, None).await
            }
            outcome => outcome,
        }
    }

    pub async fn task_log(&self, task_id: TaskId) -> OrchestrationResult<Vec<TaskLogLine>> {
        let task_logs = self.task_logs.clone();
        run_blocking(move || task_logs.lines(task_id)).await
    }

    async fn dispatch(
        &self,
        task_id: TaskId,
        kind: TaskKind,
        mutation: Mutation,
        command: PathBuf,
        node_id: NodeId,
        args: Vec<String>,
    ) -> OrchestrationResult<TaskId> {
        let dependency_type = self.dependency_type();
        let operation = operation_for(mutation);

        let task_logs = self.task_logs.clone();
        let sink = run_blocking(move || TaskLogSink::open(task_logs, task_id))
            .await
            .map_err(|error| error.attribute(dependency_type, Some(task_id), operation))?;

        let submission = TaskSubmission {
            task_id,
            kind,
            lane: TaskLane {
                node_id: node_id.clone(),
                dependency_type,
            },
            requested_at: SystemTime::now(),
        };
        let task = MutationTask {
            adapter: self.adapter.clone(),
            inventory: self.inventory.clone(),
            command,
            node_id,
            mutation,
            args,
            sink: sink.clone(),
        };

        let task_operation: TaskOperation = Box::new(move |token: TaskCancellationToken| {
            Box::pin(task.run(token)) as Pin<Box<dyn Future<Output = OrchestrationResult<()>> + Send>>
        });
        let spawned = self.queue.spawn(submission, task_operation).await;

        match spawned {
            Ok(task_id) => {
                tracing::info!(
                    task_id = task_id.0,
                    dependency_type = dependency_type.as_str(),
                    operation = ?operation,
                    "dispatched package manager task"
                );
                Ok(task_id)
            }
            Err(error) => {
                finish_log(sink, format!("dispatch failed: {}", error.message)).await;
                Err(error.attribute(dependency_type, Some(task_id), operation))
            }
        }
    }
}

impl MutationTask {
    async fn run(self, token: TaskCancellationToken) -> OrchestrationResult<()> {
        let dependency_type = self.adapter.dependency_type();
        let operation = operation_for(self.mutation);
        let task_id = self.sink.task_id();

        let result = if token.is_cancelled() {
            Err(CoreError::new(
                CoreErrorKind::Cancelled,
                "task cancelled before it started",
            ))
        } else {
            append_system(
                &self.sink,
                format!("$ {} {}", self.command.display(), self.args.join(" ")),
            )
            .await;
            self.adapter
                .execute(
                    &self.command,
                    self.mutation,
                    self.args,
                    self.sink.clone(),
                    token,
                )
                .await
                .map(|_| ())
        };
        let result = result.map_err(|error| error.attribute(dependency_type, Some(task_id), operation));

        let outcome = match &result {
            Ok(()) => "exited successfully".to_string(),
            Err(error) => error.message.clone(),
        };
        finish_log(self.sink, outcome).await;

        match &result {
            Ok(()) => {
                if let Err(error) = refresh_node(
                    self.adapter.clone(),
                    self.inventory.clone(),
                    self.command.clone(),
                    self.node_id.clone(),
                )
                .await
                {
                    tracing::warn!(
                        task_id = task_id.0,
                        node_id = %self.node_id,
                        dependency_type = dependency_type.as_str(),
                        kind = ?error.kind,
                        message = %error.message,
                        "inventory refresh after package manager task failed"
                    );
                }
                tracing::info!(
                    task_id = task_id.0,
                    node_id = %self.node_id,
                    operation = ?operation,
                    "package manager task succeeded"
                );
            }
            Err(error) => {
                tracing::warn!(
                    task_id = task_id.0,
                    node_id = %self.node_id,
                    operation = ?operation,
                    kind = ?error.kind,
                    message = %error.message,
                    "package manager task failed"
                );
            }
        }

        result
    }
}

async fn refresh_node(
    adapter: Arc<dyn PackageManagerAdapter>,
    inventory: Arc<dyn InventoryStore>,
    command: PathBuf,
    node_id: NodeId,
) -> OrchestrationResult<Vec<Dependency>> {
    let dependency_type = adapter.dependency_type();
    let installed = adapter
        .list_global_installed(&command)
        .await
        .map_err(|error| error.attribute(dependency_type, None, Operation::ListInstalled))?;

    let observed_at = SystemTime::now();
    let records: Vec<InventoryRecord> = installed
        .iter()
        .map(|package| InventoryRecord::from_installed(&node_id, dependency_type, package, observed_at))
        .collect();

    let upsert_node = node_id.clone();
    run_blocking(move || inventory.upsert_node_inventory(&upsert_node, dependency_type, &records))
        .await
        .map_err(|error| error.attribute(dependency_type, None, Operation::UpsertInventory))?;

    tracing::debug!(
        node_id = %node_id,
        dependency_type = dependency_type.as_str(),
        packages = installed.len(),
        "refreshed node inventory"
    );

    Ok(installed
        .into_iter()
        .map(|package| Dependency {
            installed_version: Some(package.version),
            ..Dependency::new(package.name, dependency_type)
        })
        .collect())
}

async fn append_system(sink: &TaskLogSink, message: String) {
    let sink = sink.clone();
    let task_id = sink.task_id();
    if let Err(error) = run_blocking(move || sink.append(TaskLogStream::System, &message)).await {
        tracing::error!(
            task_id = task_id.0,
            kind = ?error.kind,
            message = %error.message,
            "failed to append to task log"
        );
    }
}

/// Writes the outcome line and closes the log.
async fn finish_log(sink: TaskLogSink, outcome: String) {
    let task_id = sink.task_id();
    let closed = run_blocking(move || {
        sink.append(TaskLogStream::System, &outcome)?;
        sink.close()
    })
    .await;

    if let Err(error) = closed {
        tracing::error!(
            task_id = task_id.0,
            kind = ?error.kind,
            message = %error.message,
            "failed to close task log"
        );
    }
}

fn operation_for(mutation: Mutation) -> Operation {
    match mutation {
        Mutation::Install => Operation::Install,
        Mutation::Uninstall => Operation::Uninstall,
    }
}

/// Runs a store or registry call off the async workers.
async fn run_blocking<T, F>(call: F) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("blocking call join failure: {join_error}"),
            )
        })?
}
