pub mod runtime_queue;
pub mod service;

pub use runtime_queue::{InMemoryAsyncTaskQueue, TaskOperation, TaskSnapshot};
pub use service::OrchestrationService;

use std::time::SystemTime;

use crate::models::{CoreError, DependencyType, NodeId, TaskId, TaskKind};

pub type OrchestrationResult<T> = Result<T, CoreError>;

/// Tasks sharing a lane run one at a time, in dispatch order.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskLane {
    pub node_id: NodeId,
    pub dependency_type: DependencyType,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSubmission {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub lane: TaskLane,
    pub requested_at: SystemTime,
}
