use std::sync::Arc;

use crate::execution::OutputStream;
use crate::models::{TaskId, TaskLogStream};
use crate::persistence::{PersistenceResult, TaskLogStore};

/// Append-only handle on one task's log.
///
/// Opening registers the log with the store; once `close` succeeds the store
/// rejects further appends and the log cannot be opened again.
#[derive(Clone)]
pub struct TaskLogSink {
    task_id: TaskId,
    store: Arc<dyn TaskLogStore>,
}

impl TaskLogSink {
    pub fn open(store: Arc<dyn TaskLogStore>, task_id: TaskId) -> PersistenceResult<Self> {
        store.open(task_id)?;
        Ok(Self { task_id, store })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn append(&self, stream: TaskLogStream, message: &str) -> PersistenceResult<u64> {
        self.store.append(self.task_id, stream, message)
    }

    pub fn close(&self) -> PersistenceResult<()> {
        self.store.close(self.task_id)
    }
}

impl From<OutputStream> for TaskLogStream {
    fn from(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => Self::Stdout,
            OutputStream::Stderr => Self::Stderr,
        }
    }
}
