use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use depfleet_core::adapters::NpmAdapter;
use depfleet_core::execution::{
    ExecutionResult, OutputStream, ProcessExecutor, ProcessExitStatus, ProcessOutput,
    ProcessOutputLine, ProcessSpawnRequest, ProcessTerminationMode, ProcessWaitFuture,
    RunningProcess, TaskCancellationToken,
};
use depfleet_core::models::{
    CoreErrorKind, Dependency, DependencyType, InstallParams, NodeId, Operation, RefreshParams,
    TaskId, TaskLogStream, TaskStatus, UninstallParams,
};
use depfleet_core::orchestration::OrchestrationService;
use depfleet_core::persistence::{
    InMemoryInventoryStore, InMemoryTaskLogStore, InventoryStore, TaskLogStore,
};
use depfleet_core::registry::{RegistryClient, RegistryResult, RegistrySource};
use depfleet_core::sqlite::SqliteStore;

const LIST_OUTPUT: &str = r#"{"dependencies": {"lodash": {"version": "4.17.21"}, "npm": {"version": "10.8.2"}}}"#;

#[derive(Clone)]
enum Mutation {
    Exit {
        code: i32,
        lines: Vec<(OutputStream, &'static str)>,
    },
    Hang,
}

/// Plays back canned npm behaviour: mutations follow `mutation`, `list`
/// exits with `list_code` and prints `LIST_OUTPUT`.
struct ScriptedNpm {
    mutation: Mutation,
    list_code: i32,
    mutation_calls: AtomicUsize,
    list_calls: AtomicUsize,
    mutation_args: Mutex<Vec<Vec<String>>>,
}

impl ScriptedNpm {
    fn new(mutation: Mutation, list_code: i32) -> Arc<Self> {
        Arc::new(Self {
            mutation,
            list_code,
            mutation_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            mutation_args: Mutex::new(Vec::new()),
        })
    }

    fn exiting(code: i32, lines: Vec<(OutputStream, &'static str)>) -> Arc<Self> {
        Self::new(Mutation::Exit { code, lines }, 0)
    }
}

impl ProcessExecutor for ScriptedNpm {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        if request.command.args.first().map(String::as_str) == Some("list") {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(Box::new(ScriptedProcess::exited(
                self.list_code,
                LIST_OUTPUT.as_bytes().to_vec(),
                Vec::new(),
            )));
        }

        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        self.mutation_args
            .lock()
            .unwrap()
            .push(request.command.args.clone());

        match &self.mutation {
            Mutation::Exit { code, lines } => {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                for (stream, line) in lines {
                    if let Some(sender) = &request.output {
                        sender
                            .send(ProcessOutputLine {
                                stream: *stream,
                                line: line.to_string(),
                            })
                            .unwrap();
                    }
                    let buffer = match stream {
                        OutputStream::Stdout => &mut stdout,
                        OutputStream::Stderr => &mut stderr,
                    };
                    buffer.extend_from_slice(line.as_bytes());
                    buffer.push(b'\n');
                }
                Ok(Box::new(ScriptedProcess::exited(*code, stdout, stderr)))
            }
            Mutation::Hang => Ok(Box::new(ScriptedProcess::hanging())),
        }
    }
}

struct ScriptedProcess {
    status: Option<ProcessExitStatus>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    killed: TaskCancellationToken,
}

impl ScriptedProcess {
    fn exited(code: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            status: Some(ProcessExitStatus::ExitCode(code)),
            stdout,
            stderr,
            killed: TaskCancellationToken::new(),
        }
    }

    fn hanging() -> Self {
        Self {
            status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            killed: TaskCancellationToken::new(),
        }
    }
}

impl RunningProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&self, _mode: ProcessTerminationMode) -> ExecutionResult<()> {
        self.killed.cancel();
        Ok(())
    }

    fn wait(&self) -> ProcessWaitFuture {
        let status = self.status;
        let stdout = self.stdout.clone();
        let stderr = self.stderr.clone();
        let killed = self.killed.clone();
        Box::pin(async move {
            let started_at = SystemTime::now();
            let status = match status {
                Some(status) => status,
                None => {
                    killed.cancelled().await;
                    ProcessExitStatus::Terminated
                }
            };
            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

struct FixedRegistry;

impl RegistrySource for FixedRegistry {
    fn search(&self, _query: &str, _from: usize, _size: usize) -> RegistryResult<String> {
        Ok(r#"{"total": 0, "results": []}"#.to_string())
    }

    fn package_detail(&self, _name: &str) -> RegistryResult<String> {
        Ok(r#"{"collected": {"metadata": {"version": "4.17.21"}}}"#.to_string())
    }
}

struct Harness {
    service: OrchestrationService,
    npm: Arc<ScriptedNpm>,
    inventory: Arc<InMemoryInventoryStore>,
    task_logs: Arc<InMemoryTaskLogStore>,
}

fn harness(npm: Arc<ScriptedNpm>) -> Harness {
    let inventory = Arc::new(InMemoryInventoryStore::new());
    let task_logs = Arc::new(InMemoryTaskLogStore::new());
    let service = OrchestrationService::new(
        Arc::new(NpmAdapter::new(npm.clone())),
        Arc::new(RegistryClient::new(Arc::new(FixedRegistry), DependencyType::Node)),
        inventory.clone(),
        task_logs.clone(),
    );
    Harness {
        service,
        npm,
        inventory,
        task_logs,
    }
}

fn temp_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("depfleet-{test_name}-{nanos}.sqlite3"))
}

fn install(task_id: u64, names: &[&str]) -> InstallParams {
    InstallParams {
        command: PathBuf::from("npm"),
        package_names: names.iter().map(|name| name.to_string()).collect(),
        proxy: None,
        upgrade_to_latest: false,
        use_manager_default_config: false,
        task_id: TaskId(task_id),
        node_id: NodeId::new("node1"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_install_reports_manager_error_and_keeps_stderr_in_log() {
    let h = harness(ScriptedNpm::exiting(
        1,
        vec![
            (OutputStream::Stderr, "npm ERR! code E404"),
            (
                OutputStream::Stderr,
                "npm ERR! 404 Not Found - GET https://registry.npmjs.org/no-such-pkg",
            ),
        ],
    ));

    let task_id = h.service.install(install(1, &["no-such-pkg"])).await.unwrap();
    assert_eq!(task_id, TaskId(1));

    let snapshot = h
        .service
        .wait_for_terminal(task_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);

    let failure = snapshot.failure.unwrap();
    assert_eq!(failure.kind, CoreErrorKind::ManagerExecution);
    assert_eq!(failure.task_id, Some(task_id));
    assert_eq!(failure.operation, Some(Operation::Install));
    assert_eq!(failure.dependency_type, Some(DependencyType::Node));
    assert!(failure.detail.unwrap().contains("E404"));

    let lines = h.service.task_log(task_id).await.unwrap();
    let stderr: Vec<_> = lines
        .iter()
        .filter(|line| line.stream == TaskLogStream::Stderr)
        .map(|line| line.message.as_str())
        .collect();
    assert_eq!(
        stderr,
        [
            "npm ERR! code E404",
            "npm ERR! 404 Not Found - GET https://registry.npmjs.org/no-such-pkg"
        ]
    );
    assert_eq!(lines[0].stream, TaskLogStream::System);
    assert_eq!(lines[0].message, "$ npm install -g no-such-pkg");
    assert_eq!(lines.last().unwrap().stream, TaskLogStream::System);
    assert!(h.task_logs.is_closed(task_id).unwrap());

    assert_eq!(h.npm.list_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_install_refreshes_node_inventory() {
    let h = harness(ScriptedNpm::exiting(
        0,
        vec![(OutputStream::Stdout, "added 1 package in 2s")],
    ));

    let task_id = h
        .service
        .install(InstallParams {
            upgrade_to_latest: true,
            ..install(2, &["lodash"])
        })
        .await
        .unwrap();
    let snapshot = h
        .service
        .wait_for_terminal(task_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert!(snapshot.failure.is_none());

    assert_eq!(
        h.npm.mutation_args.lock().unwrap().as_slice(),
        [vec!["install", "-g", "lodash@latest"]]
    );
    assert_eq!(h.npm.list_calls.load(Ordering::SeqCst), 1);

    let records = h
        .inventory
        .node_inventory(&NodeId::new("node1"), DependencyType::Node)
        .unwrap();
    let installed: Vec<_> = records
        .iter()
        .map(|record| (record.package_name.as_str(), record.version.as_str()))
        .collect();
    assert_eq!(installed, [("lodash", "4.17.21"), ("npm", "10.8.2")]);

    let lines = h.task_logs.lines(task_id).unwrap();
    assert!(
        lines
            .iter()
            .any(|line| line.stream == TaskLogStream::Stdout && line.message == "added 1 package in 2s")
    );
    assert!(h.task_logs.is_closed(task_id).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_failure_does_not_fail_the_mutation() {
    let h = harness(ScriptedNpm::new(
        Mutation::Exit {
            code: 0,
            lines: Vec::new(),
        },
        1,
    ));

    let task_id = h
        .service
        .uninstall(UninstallParams {
            command: PathBuf::from("npm"),
            package_names: vec!["pm2".to_string()],
            task_id: TaskId(3),
            node_id: NodeId::new("node1"),
        })
        .await
        .unwrap();
    let snapshot = h
        .service
        .wait_for_terminal(task_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert_eq!(h.npm.list_calls.load(Ordering::SeqCst), 1);
    assert!(
        h.inventory
            .node_inventory(&NodeId::new("node1"), DependencyType::Node)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_install_fails_as_cancelled_and_closes_log() {
    let h = harness(ScriptedNpm::new(Mutation::Hang, 0));

    let task_id = h.service.install(install(4, &["typescript"])).await.unwrap();
    for _ in 0..100 {
        if h.npm.mutation_calls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.service.status(task_id).await.unwrap(), TaskStatus::Running);

    h.service.cancel(task_id).await.unwrap();
    let snapshot = h
        .service
        .wait_for_terminal(task_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TaskStatus::Failed);
    let failure = snapshot.failure.unwrap();
    assert_eq!(failure.kind, CoreErrorKind::Cancelled);
    assert_eq!(failure.task_id, Some(task_id));
    assert!(h.task_logs.is_closed(task_id).unwrap());
    assert_eq!(h.npm.list_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_params_fail_before_dispatch() {
    let h = harness(ScriptedNpm::exiting(0, Vec::new()));

    let error = h.service.install(install(5, &[])).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidArgument);
    assert_eq!(error.task_id, Some(TaskId(5)));
    assert_eq!(error.operation, Some(Operation::Install));

    assert_eq!(h.npm.mutation_calls.load(Ordering::SeqCst), 0);
    assert!(h.service.status(TaskId(5)).await.is_err());
    assert!(h.task_logs.lines(TaskId(5)).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn reused_task_id_is_rejected() {
    let h = harness(ScriptedNpm::exiting(0, Vec::new()));

    let task_id = h.service.install(install(6, &["lodash"])).await.unwrap();
    h.service
        .wait_for_terminal(task_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let error = h.service.install(install(6, &["pm2"])).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidArgument);
    assert_eq!(h.npm.mutation_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn next_task_id_skips_ids_in_use() {
    let h = harness(ScriptedNpm::exiting(0, Vec::new()));
    let first = h.service.next_task_id().await.unwrap();
    let task_id = h.service.install(install(first.0, &["lodash"])).await.unwrap();
    assert_ne!(h.service.next_task_id().await.unwrap(), task_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_inventory_returns_installed_dependencies() {
    let h = harness(ScriptedNpm::exiting(0, Vec::new()));

    let dependencies = h
        .service
        .refresh_inventory(RefreshParams {
            command: PathBuf::from("npm"),
            node_id: NodeId::new("node2"),
        })
        .await
        .unwrap();

    assert_eq!(dependencies.len(), 2);
    assert_eq!(dependencies[0].name, "lodash");
    assert_eq!(dependencies[0].installed_version.as_deref(), Some("4.17.21"));
    assert_eq!(
        h.inventory
            .node_inventory(&NodeId::new("node2"), DependencyType::Node)
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn latest_version_requires_matching_dependency_type() {
    let h = harness(ScriptedNpm::exiting(0, Vec::new()));

    let latest = h
        .service
        .latest_version(&Dependency::new("lodash", DependencyType::Node))
        .await
        .unwrap();
    assert_eq!(latest, "4.17.21");

    let error = h
        .service
        .latest_version(&Dependency::new("requests", DependencyType::Python))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidArgument);
    assert_eq!(error.operation, Some(Operation::LatestVersion));
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_or_cancel_returns_finished_task_untouched() {
    let h = harness(ScriptedNpm::exiting(0, Vec::new()));

    let task_id = h.service.install(install(7, &["lodash"])).await.unwrap();
    let snapshot = h
        .service
        .wait_or_cancel(task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert!(h.task_logs.is_closed(task_id).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn overdue_task_is_cancelled_and_its_persisted_log_closed() {
    let npm = ScriptedNpm::new(Mutation::Hang, 0);
    let store = Arc::new(SqliteStore::new(temp_db_path("overdue-task")));
    store.migrate_to_latest().unwrap();
    let service = OrchestrationService::new(
        Arc::new(NpmAdapter::new(npm.clone())),
        Arc::new(RegistryClient::new(Arc::new(FixedRegistry), DependencyType::Node)),
        store.clone(),
        store.clone(),
    );

    let task_id = service.install(install(8, &["typescript"])).await.unwrap();
    let snapshot = service
        .wait_or_cancel(task_id, Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.failure.unwrap().kind, CoreErrorKind::Cancelled);
    assert_eq!(npm.mutation_calls.load(Ordering::SeqCst), 1);

    assert!(store.is_closed(task_id).unwrap());
    let lines = store.lines(task_id).unwrap();
    assert_eq!(lines.last().unwrap().stream, TaskLogStream::System);
    assert!(store.append(task_id, TaskLogStream::Stdout, "late").is_err());
}
