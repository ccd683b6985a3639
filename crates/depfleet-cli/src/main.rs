//! depfleet - fleet dependency inventory and package manager orchestration
//!
//! Usage:
//!   depfleet search lodash       # registry matches annotated with fleet installs
//!   depfleet scan                # record this node's global packages
//!   depfleet install pm2 yarn    # run npm and wait for the task to finish
//!   depfleet log 12              # print a task's captured output

mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depfleet_core::adapters::NpmAdapter;
use depfleet_core::config::DepfleetConfig;
use depfleet_core::execution::TokioProcessExecutor;
use depfleet_core::models::{
    Dependency, DependencyType, InstallParams, RefreshParams, TaskId, TaskLogLine, TaskStatus,
    UninstallParams,
};
use depfleet_core::orchestration::{OrchestrationService, TaskSnapshot};
use depfleet_core::reconcile::ReconciliationEngine;
use depfleet_core::registry::{RegistryClient, UreqRegistrySource};
use depfleet_core::sqlite::SqliteStore;

#[derive(Parser)]
#[command(name = "depfleet")]
#[command(about = "Fleet dependency inventory and orchestration", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults to ./depfleet.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Node identity to report inventory under
    #[arg(long, global = true)]
    node_id: Option<String>,

    /// SQLite database holding inventory and task logs
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the registry and show where each match is installed
    Search {
        query: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        /// Results per page (defaults to registry.page_size)
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Show the latest published version of a package
    Latest { name: String },

    /// Record this node's globally installed packages
    Scan,

    /// Install packages globally on this node
    Install {
        names: Vec<String>,
        /// Registry to install from
        #[arg(long)]
        proxy: Option<String>,
        /// Install the latest published version of each name
        #[arg(long)]
        latest: bool,
        /// Let npm pick packages from its own configuration
        #[arg(long)]
        default_config: bool,
        /// Cancel the task if it has not finished after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Uninstall global packages from this node
    #[command(alias = "rm")]
    Uninstall {
        #[arg(required = true)]
        names: Vec<String>,
        /// Cancel the task if it has not finished after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List every package installed anywhere in the fleet
    Fleet {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Print a task's captured output
    Log { task_id: u64 },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depfleet=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = settings::load(cli.config.as_deref())?;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    tracing::debug!(
        node_id = %config.node_id,
        database = %config.database_path.display(),
        "loaded configuration"
    );

    let app = App::open(config)?;
    match cli.command {
        Commands::Search {
            query,
            page,
            page_size,
        } => app.search(&query, page, page_size),
        Commands::Latest { name } => app.latest(&name),
        Commands::Scan => app.scan(),
        Commands::Install {
            names,
            proxy,
            latest,
            default_config,
            timeout,
        } => app.install(names, proxy, latest, default_config, timeout),
        Commands::Uninstall { names, timeout } => app.uninstall(names, timeout),
        Commands::Fleet { page, page_size } => app.fleet(page, page_size),
        Commands::Log { task_id } => app.log(TaskId(task_id)),
    }
}

struct App {
    config: DepfleetConfig,
    engine: ReconciliationEngine,
    service: OrchestrationService,
    runtime: tokio::runtime::Runtime,
}

impl App {
    fn open(config: DepfleetConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(&config.database_path));
        store.migrate_to_latest().with_context(|| {
            format!(
                "failed to prepare database '{}'",
                config.database_path.display()
            )
        })?;

        let source = Arc::new(
            UreqRegistrySource::new(&config.registry).context("invalid registry configuration")?,
        );
        let registry = Arc::new(RegistryClient::new(source, DependencyType::Node));
        let adapter = Arc::new(NpmAdapter::with_options(
            Arc::new(TokioProcessExecutor),
            config.npm.options(),
        ));

        let engine = ReconciliationEngine::new(registry.clone(), store.clone());
        let service = OrchestrationService::new(adapter, registry, store.clone(), store);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;

        Ok(Self {
            config,
            engine,
            service,
            runtime,
        })
    }

    fn page_size(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.config.registry.page_size)
    }

    fn search(&self, query: &str, page: usize, page_size: Option<usize>) -> Result<()> {
        let result = self
            .engine
            .search(query, page, self.page_size(page_size))?;
        print_json(&json!({
            "total": result.total,
            "page": page,
            "items": result.items.iter().map(dependency_view).collect::<Vec<_>>(),
        }))
    }

    fn latest(&self, name: &str) -> Result<()> {
        let dependency = Dependency::new(name, DependencyType::Node);
        let version = self
            .runtime
            .block_on(self.service.latest_version(&dependency))?;
        print_json(&json!({ "name": name, "latest_version": version }))
    }

    fn scan(&self) -> Result<()> {
        let params = RefreshParams {
            command: self.config.npm.command.clone(),
            node_id: self.config.node_id(),
        };
        let installed = self
            .runtime
            .block_on(self.service.refresh_inventory(params))?;
        print_json(&json!({
            "node_id": self.config.node_id,
            "installed": installed.iter().map(dependency_view).collect::<Vec<_>>(),
        }))
    }

    fn install(
        &self,
        names: Vec<String>,
        proxy: Option<String>,
        upgrade_to_latest: bool,
        use_manager_default_config: bool,
        timeout: Option<u64>,
    ) -> Result<()> {
        self.runtime.block_on(async {
            let task_id = self.service.next_task_id().await?;
            let params = InstallParams {
                command: self.config.npm.command.clone(),
                package_names: names,
                proxy,
                upgrade_to_latest,
                use_manager_default_config,
                task_id,
                node_id: self.config.node_id(),
            };
            self.service.install(params).await?;
            self.finish(task_id, timeout).await
        })
    }

    fn uninstall(&self, names: Vec<String>, timeout: Option<u64>) -> Result<()> {
        self.runtime.block_on(async {
            let task_id = self.service.next_task_id().await?;
            let params = UninstallParams {
                command: self.config.npm.command.clone(),
                package_names: names,
                task_id,
                node_id: self.config.node_id(),
            };
            self.service.uninstall(params).await?;
            self.finish(task_id, timeout).await
        })
    }

    async fn finish(&self, task_id: TaskId, timeout: Option<u64>) -> Result<()> {
        tracing::info!(task_id = task_id.0, "waiting for task");
        let snapshot = match timeout {
            Some(secs) => {
                self.service
                    .wait_or_cancel(task_id, Duration::from_secs(secs))
                    .await?
            }
            None => self.service.wait_for_terminal(task_id, None).await?,
        };
        print_json(&snapshot_view(&snapshot))?;

        if snapshot.status == TaskStatus::Failed {
            let message = snapshot
                .failure
                .map(|failure| failure.to_string())
                .unwrap_or_else(|| "task failed".to_string());
            bail!("task {task_id} failed: {message} (see `depfleet log {task_id}`)");
        }
        Ok(())
    }

    fn fleet(&self, page: usize, page_size: Option<usize>) -> Result<()> {
        let (items, total) = self.engine.fleet(page, self.page_size(page_size))?;
        print_json(&json!({
            "total": total,
            "page": page,
            "items": items.iter().map(dependency_view).collect::<Vec<_>>(),
        }))
    }

    fn log(&self, task_id: TaskId) -> Result<()> {
        let lines = self.runtime.block_on(self.service.task_log(task_id))?;
        for line in &lines {
            println!("{}", render_log_line(line));
        }
        Ok(())
    }
}

fn dependency_view(dependency: &Dependency) -> serde_json::Value {
    json!({
        "name": dependency.name,
        "installed_version": dependency.installed_version,
        "latest_version": dependency.latest_version,
        "upgrade_available": dependency.upgrade_available(),
        "nodes": dependency.result.as_ref().map(|result| &result.node_ids),
        "versions": dependency.result.as_ref().map(|result| &result.versions),
    })
}

fn snapshot_view(snapshot: &TaskSnapshot) -> serde_json::Value {
    json!({
        "task_id": snapshot.id,
        "kind": snapshot.kind,
        "node_id": snapshot.lane.node_id,
        "status": snapshot.status,
        "created_at": format_time(snapshot.created_at),
        "started_at": snapshot.started_at.map(format_time),
        "finished_at": snapshot.finished_at.map(format_time),
        "error": snapshot.failure.as_ref().map(|failure| json!({
            "kind": format!("{:?}", failure.kind),
            "message": failure.message,
            "detail": failure.detail,
        })),
    })
}

fn render_log_line(line: &TaskLogLine) -> String {
    format!(
        "{} [{}] {}",
        format_time(line.created_at),
        line.stream.as_str(),
        line.message
    )
}

fn format_time(at: SystemTime) -> String {
    OffsetDateTime::from(at)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
