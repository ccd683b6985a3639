use thiserror::Error;

use crate::models::{DependencyType, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidArgument,
    Upstream,
    ManagerExecution,
    Store,
    Cancelled,
    Timeout,
    Internal,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Search,
    LatestVersion,
    ListInstalled,
    Install,
    Uninstall,
    UpsertInventory,
    AggregateInventory,
    TaskLog,
    Migration,
}

/// Error value shared by every layer of the engine.
///
/// `task_id` doubles as the log reference for process failures: the captured
/// output of the failing invocation is readable from the task log store under
/// that id. `detail` carries diagnostics that do not fit in `message`, such as
/// a partial upstream response body or the tail of captured stderr.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub dependency_type: Option<DependencyType>,
    pub task_id: Option<TaskId>,
    pub operation: Option<Operation>,
    pub kind: CoreErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            dependency_type: None,
            task_id: None,
            operation: None,
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::InvalidArgument, message)
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_dependency_type(mut self, dependency_type: DependencyType) -> Self {
        self.dependency_type = Some(dependency_type);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Fills attribution fields the error does not already carry.
    pub fn attribute(
        self,
        dependency_type: DependencyType,
        task_id: Option<TaskId>,
        operation: Operation,
    ) -> Self {
        Self {
            dependency_type: self.dependency_type.or(Some(dependency_type)),
            task_id: self.task_id.or(task_id),
            operation: self.operation.or(Some(operation)),
            ..self
        }
    }
}
