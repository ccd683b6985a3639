#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_inventory_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS inventory_records (
    node_id TEXT NOT NULL,
    dependency_type TEXT NOT NULL,
    package_name TEXT NOT NULL,
    version TEXT NOT NULL,
    observed_at_unix INTEGER NOT NULL,
    PRIMARY KEY (node_id, dependency_type, package_name)
);

CREATE INDEX IF NOT EXISTS idx_inventory_records_type_name
    ON inventory_records (dependency_type, package_name);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_inventory_records_type_name;
DROP TABLE IF EXISTS inventory_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_task_logs",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_log_state (
    task_id INTEGER PRIMARY KEY,
    closed INTEGER NOT NULL DEFAULT 0,
    opened_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_logs (
    task_id INTEGER NOT NULL,
    sequence INTEGER NOT NULL,
    stream TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at_unix INTEGER NOT NULL,
    PRIMARY KEY (task_id, sequence)
);

CREATE TABLE IF NOT EXISTS task_id_counter (
    singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
    next_task_id INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS task_id_counter;
DROP TABLE IF EXISTS task_logs;
DROP TABLE IF EXISTS task_log_state;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
