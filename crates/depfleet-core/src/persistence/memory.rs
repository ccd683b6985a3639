use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::SystemTime;

use crate::models::{
    CoreError, CoreErrorKind, DependencyType, FleetResult, InventoryRecord, NodeId, Operation,
    TaskId, TaskLogLine, TaskLogStream,
};
use crate::persistence::{
    FleetAggregator, InventoryStore, PersistenceResult, TaskLogStore, page, validate_node_report,
};

type InventoryKey = (NodeId, DependencyType);

/// Record set of one (node, type) key. Replaced wholesale on every report.
type InventorySnapshot = Arc<Vec<InventoryRecord>>;

/// In-process inventory store.
///
/// Each (node, type) key owns its own lock; the outer map is only
/// write-locked the first time a key reports.
#[derive(Default)]
pub struct InMemoryInventoryStore {
    slots: RwLock<HashMap<InventoryKey, Arc<RwLock<InventorySnapshot>>>>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &InventoryKey) -> PersistenceResult<Arc<RwLock<InventorySnapshot>>> {
        if let Some(slot) = self
            .slots
            .read()
            .map_err(|_| poisoned(Operation::UpsertInventory))?
            .get(key)
        {
            return Ok(slot.clone());
        }

        let mut slots = self
            .slots
            .write()
            .map_err(|_| poisoned(Operation::UpsertInventory))?;
        Ok(slots.entry(key.clone()).or_default().clone())
    }

    fn snapshots(
        &self,
        dependency_type: DependencyType,
        operation: Operation,
    ) -> PersistenceResult<Vec<InventorySnapshot>> {
        let slots: Vec<_> = self
            .slots
            .read()
            .map_err(|_| poisoned(operation))?
            .iter()
            .filter(|((_, slot_type), _)| *slot_type == dependency_type)
            .map(|(_, slot)| slot.clone())
            .collect();

        slots
            .iter()
            .map(|slot| {
                slot.read()
                    .map(|snapshot| snapshot.clone())
                    .map_err(|_| poisoned(operation))
            })
            .collect()
    }

    fn aggregate(
        &self,
        dependency_type: DependencyType,
        operation: Operation,
        mut include: impl FnMut(&str) -> bool,
    ) -> PersistenceResult<Vec<FleetResult>> {
        let mut aggregator = FleetAggregator::default();
        for snapshot in self.snapshots(dependency_type, operation)? {
            for record in snapshot.iter() {
                if include(&record.package_name) {
                    aggregator.add(&record.package_name, &record.node_id, &record.version);
                }
            }
        }
        Ok(aggregator.finish())
    }
}

impl InventoryStore for InMemoryInventoryStore {
    fn upsert_node_inventory(
        &self,
        node_id: &NodeId,
        dependency_type: DependencyType,
        records: &[InventoryRecord],
    ) -> PersistenceResult<()> {
        validate_node_report(node_id, dependency_type, records)?;

        let slot = self.slot(&(node_id.clone(), dependency_type))?;
        let replacement = Arc::new(records.to_vec());
        let mut current = slot
            .write()
            .map_err(|_| poisoned(Operation::UpsertInventory))?;
        *current = replacement;
        Ok(())
    }

    fn aggregate_by_name(
        &self,
        dependency_type: DependencyType,
        names: &[String],
    ) -> PersistenceResult<Vec<FleetResult>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        self.aggregate(dependency_type, Operation::AggregateInventory, |name| {
            wanted.contains(name)
        })
    }

    fn list_aggregated(
        &self,
        dependency_type: DependencyType,
        offset: usize,
        limit: usize,
    ) -> PersistenceResult<(Vec<FleetResult>, usize)> {
        let results = self.aggregate(dependency_type, Operation::AggregateInventory, |_| true)?;
        Ok(page(results, offset, limit))
    }

    fn node_inventory(
        &self,
        node_id: &NodeId,
        dependency_type: DependencyType,
    ) -> PersistenceResult<Vec<InventoryRecord>> {
        let slot = self
            .slots
            .read()
            .map_err(|_| poisoned(Operation::AggregateInventory))?
            .get(&(node_id.clone(), dependency_type))
            .cloned();

        let Some(slot) = slot else {
            return Ok(Vec::new());
        };
        let snapshot = slot
            .read()
            .map_err(|_| poisoned(Operation::AggregateInventory))?
            .clone();

        let mut records = snapshot.as_ref().clone();
        records.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        Ok(records)
    }
}

/// Closed logs kept before the oldest one is evicted.
const MAX_RETAINED_CLOSED_LOGS: usize = 512;

#[derive(Default)]
pub struct InMemoryTaskLogStore {
    state: Mutex<TaskLogState>,
}

#[derive(Default)]
struct TaskLogState {
    next_task_id: u64,
    logs: BTreeMap<TaskId, TaskLog>,
    /// Highest evicted id. Ids at or below it that hold no log are retired:
    /// they read as closed and cannot be opened.
    evicted_through: Option<TaskId>,
}

struct TaskLog {
    lines: Vec<TaskLogLine>,
    closed: bool,
}

impl InMemoryTaskLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, TaskLogState>> {
        self.state.lock().map_err(|_| poisoned(Operation::TaskLog))
    }
}

impl TaskLogState {
    fn evict_closed_overflow(&mut self) {
        let closed: Vec<TaskId> = self
            .logs
            .iter()
            .filter(|(_, log)| log.closed)
            .map(|(task_id, _)| *task_id)
            .collect();

        let overflow = closed.len().saturating_sub(MAX_RETAINED_CLOSED_LOGS);
        for task_id in closed.into_iter().take(overflow) {
            self.logs.remove(&task_id);
            self.evicted_through = self.evicted_through.max(Some(task_id));
        }
    }

    fn is_retired(&self, task_id: TaskId) -> bool {
        !self.logs.contains_key(&task_id)
            && self
                .evicted_through
                .is_some_and(|watermark| task_id <= watermark)
    }

    fn log_mut(&mut self, task_id: TaskId) -> PersistenceResult<&mut TaskLog> {
        self.logs.get_mut(&task_id).ok_or_else(|| unknown_task(task_id))
    }
}

impl TaskLogStore for InMemoryTaskLogStore {
    fn next_task_id(&self) -> PersistenceResult<TaskId> {
        let mut state = self.lock_state()?;
        state.next_task_id = state.next_task_id.max(1);
        let task_id = TaskId(state.next_task_id);
        state.next_task_id = state.next_task_id.saturating_add(1);
        Ok(task_id)
    }

    fn open(&self, task_id: TaskId) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if state.logs.contains_key(&task_id) || state.is_retired(task_id) {
            return Err(CoreError::invalid_argument(format!(
                "task log '{task_id}' already exists and cannot be reopened"
            ))
            .with_operation(Operation::TaskLog)
            .with_task_id(task_id));
        }

        state.logs.insert(
            task_id,
            TaskLog {
                lines: Vec::new(),
                closed: false,
            },
        );
        state.next_task_id = state.next_task_id.max(task_id.0.saturating_add(1));
        Ok(())
    }

    fn append(
        &self,
        task_id: TaskId,
        stream: TaskLogStream,
        message: &str,
    ) -> PersistenceResult<u64> {
        let mut state = self.lock_state()?;
        let log = state.log_mut(task_id)?;
        if log.closed {
            return Err(closed_task(task_id));
        }

        let sequence = log.lines.len() as u64 + 1;
        log.lines.push(TaskLogLine {
            task_id,
            sequence,
            stream,
            message: message.to_string(),
            created_at: SystemTime::now(),
        });
        Ok(sequence)
    }

    fn close(&self, task_id: TaskId) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.log_mut(task_id)?.closed = true;
        state.evict_closed_overflow();
        Ok(())
    }

    fn lines(&self, task_id: TaskId) -> PersistenceResult<Vec<TaskLogLine>> {
        let state = self.lock_state()?;
        state
            .logs
            .get(&task_id)
            .map(|log| log.lines.clone())
            .ok_or_else(|| unknown_task(task_id))
    }

    fn is_closed(&self, task_id: TaskId) -> PersistenceResult<bool> {
        let state = self.lock_state()?;
        if state.is_retired(task_id) {
            return Ok(true);
        }
        state
            .logs
            .get(&task_id)
            .map(|log| log.closed)
            .ok_or_else(|| unknown_task(task_id))
    }
}

fn poisoned(operation: Operation) -> CoreError {
    CoreError::new(CoreErrorKind::Store, "in-memory store lock poisoned").with_operation(operation)
}

fn unknown_task(task_id: TaskId) -> CoreError {
    CoreError::invalid_argument(format!("unknown task log '{task_id}'"))
        .with_operation(Operation::TaskLog)
        .with_task_id(task_id)
}

fn closed_task(task_id: TaskId) -> CoreError {
    CoreError::invalid_argument(format!("task log '{task_id}' is closed"))
        .with_operation(Operation::TaskLog)
        .with_task_id(task_id)
}
