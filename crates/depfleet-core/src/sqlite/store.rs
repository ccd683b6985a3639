use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};

use crate::models::{
    CoreError, CoreErrorKind, DependencyType, FleetResult, InventoryRecord, NodeId, Operation,
    TaskId, TaskLogLine, TaskLogStream,
};
use crate::persistence::{
    FleetAggregator, InventoryStore, MigrationStore, PersistenceResult, TaskLogStore,
    validate_node_report,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "depfleet_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed inventory and task log store.
///
/// Every operation opens its own connection, so one store value can be shared
/// across threads and across processes pointing at the same file.
pub struct SqliteStore {
    database_path: PathBuf,
}

enum AppendOutcome {
    Appended(u64),
    Unknown,
    Closed,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation: Operation,
        operation_name: &str,
        body: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation, operation_name, error))?;
        body(&mut connection).map_err(|error| storage_error(operation, operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection(Operation::Migration, "current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                Operation::Migration,
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection(Operation::Migration, "apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is all IF NOT EXISTS; re-running repairs a schema whose
                // version row survived a dropped table.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl InventoryStore for SqliteStore {
    fn upsert_node_inventory(
        &self,
        node_id: &NodeId,
        dependency_type: DependencyType,
        records: &[InventoryRecord],
    ) -> PersistenceResult<()> {
        validate_node_report(node_id, dependency_type, records)?;

        self.with_connection(
            Operation::UpsertInventory,
            "upsert_node_inventory",
            |connection| {
                ensure_schema_ready(connection)?;
                let transaction =
                    connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
                transaction.execute(
                    "DELETE FROM inventory_records WHERE node_id = ?1 AND dependency_type = ?2",
                    params![node_id.as_str(), dependency_type.as_str()],
                )?;

                {
                    let mut statement = transaction.prepare(
                        "
INSERT INTO inventory_records (
    node_id, dependency_type, package_name, version, observed_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5)
",
                    )?;
                    for record in records {
                        statement.execute(params![
                            node_id.as_str(),
                            dependency_type.as_str(),
                            record.package_name,
                            record.version,
                            to_unix_seconds(record.observed_at)?,
                        ])?;
                    }
                }

                transaction.commit()
            },
        )
    }

    fn aggregate_by_name(
        &self,
        dependency_type: DependencyType,
        names: &[String],
    ) -> PersistenceResult<Vec<FleetResult>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        self.with_connection(
            Operation::AggregateInventory,
            "aggregate_by_name",
            |connection| {
                ensure_schema_ready(connection)?;
                let placeholders = (0..names.len())
                    .map(|index| format!("?{}", index + 2))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "
SELECT package_name, node_id, version
FROM inventory_records
WHERE dependency_type = ?1 AND package_name IN ({placeholders})
"
                );

                let mut statement = connection.prepare(&sql)?;
                let bound = std::iter::once(dependency_type.as_str())
                    .chain(names.iter().map(String::as_str));
                let mut rows = statement.query(params_from_iter(bound))?;

                let mut aggregator = FleetAggregator::default();
                while let Some(row) = rows.next()? {
                    let package_name: String = row.get(0)?;
                    let node_id: String = row.get(1)?;
                    let version: String = row.get(2)?;
                    aggregator.add(&package_name, &NodeId(node_id), &version);
                }
                Ok(aggregator.finish())
            },
        )
    }

    fn list_aggregated(
        &self,
        dependency_type: DependencyType,
        offset: usize,
        limit: usize,
    ) -> PersistenceResult<(Vec<FleetResult>, usize)> {
        self.with_connection(
            Operation::AggregateInventory,
            "list_aggregated",
            |connection| {
                ensure_schema_ready(connection)?;
                let transaction = connection.transaction()?;

                let total: i64 = transaction.query_row(
                    "
SELECT COUNT(DISTINCT package_name)
FROM inventory_records
WHERE dependency_type = ?1
",
                    [dependency_type.as_str()],
                    |row| row.get(0),
                )?;

                let mut aggregator = FleetAggregator::default();
                {
                    let mut statement = transaction.prepare(
                        "
SELECT r.package_name, r.node_id, r.version
FROM inventory_records r
JOIN (
    SELECT DISTINCT package_name
    FROM inventory_records
    WHERE dependency_type = ?1
    ORDER BY package_name
    LIMIT ?2 OFFSET ?3
) page ON page.package_name = r.package_name
WHERE r.dependency_type = ?1
",
                    )?;
                    let mut rows = statement.query(params![
                        dependency_type.as_str(),
                        to_i64(limit)?,
                        to_i64(offset)?,
                    ])?;
                    while let Some(row) = rows.next()? {
                        let package_name: String = row.get(0)?;
                        let node_id: String = row.get(1)?;
                        let version: String = row.get(2)?;
                        aggregator.add(&package_name, &NodeId(node_id), &version);
                    }
                }

                transaction.commit()?;
                Ok((aggregator.finish(), i64_to_usize(total)?))
            },
        )
    }

    fn node_inventory(
        &self,
        node_id: &NodeId,
        dependency_type: DependencyType,
    ) -> PersistenceResult<Vec<InventoryRecord>> {
        self.with_connection(
            Operation::AggregateInventory,
            "node_inventory",
            |connection| {
                ensure_schema_ready(connection)?;
                let mut statement = connection.prepare(
                    "
SELECT package_name, version, observed_at_unix
FROM inventory_records
WHERE node_id = ?1 AND dependency_type = ?2
ORDER BY package_name
",
                )?;
                let rows = statement.query_map(
                    params![node_id.as_str(), dependency_type.as_str()],
                    |row| {
                        Ok(InventoryRecord {
                            node_id: node_id.clone(),
                            package_name: row.get(0)?,
                            dependency_type,
                            version: row.get(1)?,
                            observed_at: from_unix_seconds(row.get(2)?)?,
                        })
                    },
                )?;
                rows.collect()
            },
        )
    }
}

impl TaskLogStore for SqliteStore {
    fn next_task_id(&self) -> PersistenceResult<TaskId> {
        self.with_connection(Operation::TaskLog, "next_task_id", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let counter: Option<i64> = transaction
                .query_row(
                    "SELECT next_task_id FROM task_id_counter WHERE singleton = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let highest_opened: i64 = transaction.query_row(
                "SELECT COALESCE(MAX(task_id), 0) FROM task_log_state",
                [],
                |row| row.get(0),
            )?;

            let allocated = counter.unwrap_or(1).max(highest_opened + 1).max(1);
            transaction.execute(
                "
INSERT INTO task_id_counter (singleton, next_task_id) VALUES (1, ?1)
ON CONFLICT(singleton) DO UPDATE SET next_task_id = excluded.next_task_id
",
                [allocated + 1],
            )?;
            transaction.commit()?;

            Ok(TaskId(i64_to_u64(allocated)?))
        })
    }

    fn open(&self, task_id: TaskId) -> PersistenceResult<()> {
        let inserted = self.with_connection(Operation::TaskLog, "open_task_log", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO task_log_state (task_id, closed, opened_at_unix)
VALUES (?1, 0, strftime('%s', 'now'))
ON CONFLICT(task_id) DO NOTHING
",
                [task_id_to_i64(task_id)?],
            )
        })?;

        if inserted == 0 {
            return Err(CoreError::invalid_argument(format!(
                "task log '{task_id}' already exists and cannot be reopened"
            ))
            .with_operation(Operation::TaskLog)
            .with_task_id(task_id));
        }
        Ok(())
    }

    fn append(
        &self,
        task_id: TaskId,
        stream: TaskLogStream,
        message: &str,
    ) -> PersistenceResult<u64> {
        let outcome = self.with_connection(Operation::TaskLog, "append_task_log", |connection| {
            ensure_schema_ready(connection)?;
            let raw_task_id = task_id_to_i64(task_id)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let closed: Option<i64> = transaction
                .query_row(
                    "SELECT closed FROM task_log_state WHERE task_id = ?1",
                    [raw_task_id],
                    |row| row.get(0),
                )
                .optional()?;
            match closed {
                None => return Ok(AppendOutcome::Unknown),
                Some(closed) if sqlite_to_bool(closed) => return Ok(AppendOutcome::Closed),
                Some(_) => {}
            }

            let sequence: i64 = transaction.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM task_logs WHERE task_id = ?1",
                [raw_task_id],
                |row| row.get(0),
            )?;
            transaction.execute(
                "
INSERT INTO task_logs (task_id, sequence, stream, message, created_at_unix)
VALUES (?1, ?2, ?3, ?4, ?5)
",
                params![
                    raw_task_id,
                    sequence,
                    stream.as_str(),
                    message,
                    to_unix_seconds(SystemTime::now())?,
                ],
            )?;
            transaction.commit()?;

            Ok(AppendOutcome::Appended(i64_to_u64(sequence)?))
        })?;

        match outcome {
            AppendOutcome::Appended(sequence) => Ok(sequence),
            AppendOutcome::Unknown => Err(task_log_error(task_id, "unknown task log")),
            AppendOutcome::Closed => Err(task_log_error(task_id, "task log is closed")),
        }
    }

    fn close(&self, task_id: TaskId) -> PersistenceResult<()> {
        let updated = self.with_connection(Operation::TaskLog, "close_task_log", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "UPDATE task_log_state SET closed = 1 WHERE task_id = ?1",
                [task_id_to_i64(task_id)?],
            )
        })?;

        if updated == 0 {
            return Err(task_log_error(task_id, "unknown task log"));
        }
        Ok(())
    }

    fn lines(&self, task_id: TaskId) -> PersistenceResult<Vec<TaskLogLine>> {
        let lines = self.with_connection(Operation::TaskLog, "task_log_lines", |connection| {
            ensure_schema_ready(connection)?;
            let raw_task_id = task_id_to_i64(task_id)?;
            let known: Option<i64> = connection
                .query_row(
                    "SELECT task_id FROM task_log_state WHERE task_id = ?1",
                    [raw_task_id],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Ok(None);
            }

            let mut statement = connection.prepare(
                "
SELECT sequence, stream, message, created_at_unix
FROM task_logs
WHERE task_id = ?1
ORDER BY sequence ASC
",
            )?;
            let rows = statement.query_map([raw_task_id], |row| {
                let stream: String = row.get(1)?;
                Ok(TaskLogLine {
                    task_id,
                    sequence: i64_to_u64(row.get(0)?)?,
                    stream: parse_stream(&stream)?,
                    message: row.get(2)?,
                    created_at: from_unix_seconds(row.get(3)?)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map(Some)
        })?;

        lines.ok_or_else(|| task_log_error(task_id, "unknown task log"))
    }

    fn is_closed(&self, task_id: TaskId) -> PersistenceResult<bool> {
        let closed = self.with_connection(Operation::TaskLog, "task_log_closed", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "SELECT closed FROM task_log_state WHERE task_id = ?1",
                    [task_id_to_i64(task_id)?],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
        })?;

        closed
            .map(sqlite_to_bool)
            .ok_or_else(|| task_log_error(task_id, "unknown task log"))
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version < current_schema_version() {
        return Err(storage_error_sqlite(&format!(
            "database schema version {version} is behind {}; apply migrations first",
            current_schema_version()
        )));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()
}

fn parse_stream(raw: &str) -> rusqlite::Result<TaskLogStream> {
    raw.parse::<TaskLogStream>().map_err(|_| {
        storage_error_sqlite(&format!("unknown log stream '{raw}' in sqlite record"))
    })
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<SystemTime> {
    let seconds = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative integer in sqlite record"))
}

fn i64_to_usize(value: i64) -> rusqlite::Result<usize> {
    usize::try_from(value).map_err(|_| storage_error_sqlite("negative count in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn task_log_error(task_id: TaskId, message: &str) -> CoreError {
    CoreError::invalid_argument(format!("{message} '{task_id}'"))
        .with_operation(Operation::TaskLog)
        .with_task_id(task_id)
}

fn storage_error(operation: Operation, operation_name: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, operation_name, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(
    operation: Operation,
    operation_name: &str,
    message: impl AsRef<str>,
) -> CoreError {
    CoreError::new(
        CoreErrorKind::Store,
        format!("sqlite store '{operation_name}' failed: {}", message.as_ref()),
    )
    .with_operation(operation)
}
