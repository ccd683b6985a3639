pub mod memory;

pub use memory::{InMemoryInventoryStore, InMemoryTaskLogStore};

use std::collections::{BTreeMap, HashSet};

use crate::models::{
    CoreError, DependencyType, FleetResult, InventoryRecord, NodeId, Operation, TaskId,
    TaskLogLine, TaskLogStream,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Fleet inventory: one record per (node, package, type).
///
/// Writes for one (node, type) key replace that key's whole record set and are
/// serialized per key. Readers observe either the old or the new set of a key,
/// never a mix.
pub trait InventoryStore: Send + Sync {
    fn upsert_node_inventory(
        &self,
        node_id: &NodeId,
        dependency_type: DependencyType,
        records: &[InventoryRecord],
    ) -> PersistenceResult<()>;

    /// Aggregates the requested names. Names without any record are omitted.
    fn aggregate_by_name(
        &self,
        dependency_type: DependencyType,
        names: &[String],
    ) -> PersistenceResult<Vec<FleetResult>>;

    /// Page of every aggregated name of a type, ordered by name, plus the total
    /// number of distinct names.
    fn list_aggregated(
        &self,
        dependency_type: DependencyType,
        offset: usize,
        limit: usize,
    ) -> PersistenceResult<(Vec<FleetResult>, usize)>;

    fn node_inventory(
        &self,
        node_id: &NodeId,
        dependency_type: DependencyType,
    ) -> PersistenceResult<Vec<InventoryRecord>>;
}

pub trait TaskLogStore: Send + Sync {
    fn next_task_id(&self) -> PersistenceResult<TaskId>;

    /// Registers a new log. Fails if the task id already has a log, open or closed.
    fn open(&self, task_id: TaskId) -> PersistenceResult<()>;

    /// Appends one line and returns its sequence number, starting at 1.
    fn append(
        &self,
        task_id: TaskId,
        stream: TaskLogStream,
        message: &str,
    ) -> PersistenceResult<u64>;

    fn close(&self, task_id: TaskId) -> PersistenceResult<()>;

    fn lines(&self, task_id: TaskId) -> PersistenceResult<Vec<TaskLogLine>>;

    fn is_closed(&self, task_id: TaskId) -> PersistenceResult<bool>;
}

/// Checks that a report only carries records of the (node, type) it replaces,
/// at most one per package name.
pub(crate) fn validate_node_report(
    node_id: &NodeId,
    dependency_type: DependencyType,
    records: &[InventoryRecord],
) -> PersistenceResult<()> {
    if node_id.as_str().trim().is_empty() {
        return Err(report_error("node id must not be empty"));
    }

    let mut seen = HashSet::new();
    for record in records {
        if &record.node_id != node_id || record.dependency_type != dependency_type {
            return Err(report_error(format!(
                "record for '{}' belongs to node '{}' ({}), not '{node_id}' ({})",
                record.package_name,
                record.node_id,
                record.dependency_type.as_str(),
                dependency_type.as_str()
            )));
        }
        if record.package_name.trim().is_empty() {
            return Err(report_error("record package name must not be empty"));
        }
        if !seen.insert(record.package_name.as_str()) {
            return Err(report_error(format!(
                "package '{}' is reported more than once",
                record.package_name
            )));
        }
    }

    Ok(())
}

fn report_error(message: impl Into<String>) -> CoreError {
    CoreError::invalid_argument(message).with_operation(Operation::UpsertInventory)
}

/// Groups (package, node, version) rows into per-name fleet results.
#[derive(Default)]
pub(crate) struct FleetAggregator {
    results: BTreeMap<String, FleetResult>,
}

impl FleetAggregator {
    pub(crate) fn add(&mut self, package_name: &str, node_id: &NodeId, version: &str) {
        let entry = self
            .results
            .entry(package_name.to_string())
            .or_insert_with(|| FleetResult::new(package_name));
        entry.node_ids.insert(node_id.clone());
        entry.versions.insert(version.to_string());
    }

    pub(crate) fn finish(self) -> Vec<FleetResult> {
        self.results.into_values().collect()
    }
}

pub(crate) fn page<T>(items: Vec<T>, offset: usize, limit: usize) -> (Vec<T>, usize) {
    let total = items.len();
    let page = items.into_iter().skip(offset).take(limit).collect();
    (page, total)
}
