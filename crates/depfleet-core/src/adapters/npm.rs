use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::manager::{AdapterFuture, AdapterResult, Mutation, PackageManagerAdapter};
use crate::adapters::process_utils::{run_and_collect_stdout, run_streaming};
use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessOutput, ProcessSpawnRequest, TaskCancellationToken,
    TaskLogSink,
};
use crate::models::{
    CoreError, CoreErrorKind, DependencyType, InstallParams, InstalledPackage, Operation,
    UninstallParams,
};

const LIST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NpmOptions {
    /// Pass `--registry` even when the install relies on the manager's own
    /// configuration instead of explicit names.
    pub apply_proxy_with_default_config: bool,
    pub list_timeout: Duration,
}

impl Default for NpmOptions {
    fn default() -> Self {
        Self {
            apply_proxy_with_default_config: true,
            list_timeout: LIST_TIMEOUT,
        }
    }
}

pub struct NpmAdapter {
    executor: Arc<dyn ProcessExecutor>,
    options: NpmOptions,
}

impl NpmAdapter {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self::with_options(executor, NpmOptions::default())
    }

    pub fn with_options(executor: Arc<dyn ProcessExecutor>, options: NpmOptions) -> Self {
        Self { executor, options }
    }

    pub fn options(&self) -> &NpmOptions {
        &self.options
    }
}

impl PackageManagerAdapter for NpmAdapter {
    fn dependency_type(&self) -> DependencyType {
        DependencyType::Node
    }

    fn build_install_args(&self, params: &InstallParams) -> AdapterResult<Vec<String>> {
        params.validate().map_err(|error| {
            error.attribute(DependencyType::Node, Some(params.task_id), Operation::Install)
        })?;
        Ok(npm_install_args(params, &self.options))
    }

    fn build_uninstall_args(&self, params: &UninstallParams) -> AdapterResult<Vec<String>> {
        params.validate().map_err(|error| {
            error.attribute(
                DependencyType::Node,
                Some(params.task_id),
                Operation::Uninstall,
            )
        })?;
        Ok(npm_uninstall_args(params))
    }

    fn list_global_installed(&self, command: &Path) -> AdapterFuture<Vec<InstalledPackage>> {
        let executor = self.executor.clone();
        let request = npm_list_installed_request(command, self.options.list_timeout);
        Box::pin(async move {
            let output = run_and_collect_stdout(executor, request).await?;
            parse_npm_list_installed(&output)
        })
    }

    fn execute(
        &self,
        command: &Path,
        mutation: Mutation,
        args: Vec<String>,
        sink: TaskLogSink,
        cancellation: TaskCancellationToken,
    ) -> AdapterFuture<ProcessOutput> {
        let executor = self.executor.clone();
        let operation = match mutation {
            Mutation::Install => Operation::Install,
            Mutation::Uninstall => Operation::Uninstall,
        };
        let request = npm_request(command, operation, args).task_id(sink.task_id());
        Box::pin(run_streaming(executor, request, sink, cancellation))
    }
}

pub fn npm_install_args(params: &InstallParams, options: &NpmOptions) -> Vec<String> {
    let mut args = vec!["install".to_string(), "-g".to_string()];

    if let Some(proxy) = params.proxy()
        && (!params.use_manager_default_config || options.apply_proxy_with_default_config)
    {
        args.push("--registry".to_string());
        args.push(proxy.to_string());
    }

    if !params.use_manager_default_config {
        args.extend(params.package_names.iter().map(|name| {
            if params.upgrade_to_latest {
                format!("{name}@latest")
            } else {
                name.clone()
            }
        }));
    }

    args
}

pub fn npm_uninstall_args(params: &UninstallParams) -> Vec<String> {
    let mut args = vec!["uninstall".to_string(), "-g".to_string()];
    args.extend(params.package_names.iter().cloned());
    args
}

pub fn npm_list_installed_request(command: &Path, timeout: Duration) -> ProcessSpawnRequest {
    npm_request(
        command,
        Operation::ListInstalled,
        ["list", "-g", "--json", "--depth", "0"]
            .into_iter()
            .map(str::to_string)
            .collect(),
    )
    .timeout(timeout)
}

fn npm_request(command: &Path, operation: Operation, args: Vec<String>) -> ProcessSpawnRequest {
    let command = CommandSpec::new(PathBuf::from(command))
        .args(args)
        .env("NPM_CONFIG_UPDATE_NOTIFIER", "false")
        .env("NPM_CONFIG_FUND", "false")
        .env("NPM_CONFIG_AUDIT", "false");
    ProcessSpawnRequest::new(DependencyType::Node, operation, command)
}

#[derive(Deserialize)]
struct NpmListOutput {
    #[serde(default)]
    dependencies: BTreeMap<String, NpmListEntry>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct NpmListEntry {
    version: Option<String>,
}

pub fn parse_npm_list_installed(output: &str) -> AdapterResult<Vec<InstalledPackage>> {
    let parsed: NpmListOutput = serde_json::from_str(output)
        .map_err(|error| parse_error(format!("invalid npm list JSON: {error}"), output))?;

    if let Some(error) = parsed.error {
        return Err(parse_error("npm list reported an error".to_string(), &error.to_string()));
    }

    parsed
        .dependencies
        .into_iter()
        .map(|(name, entry)| {
            let version = entry
                .version
                .map(|version| version.trim().to_string())
                .filter(|version| !version.is_empty())
                .ok_or_else(|| {
                    parse_error(format!("npm list entry '{name}' has no version"), output)
                })?;
            Ok(InstalledPackage { name, version })
        })
        .collect()
}

fn parse_error(message: String, detail: &str) -> CoreError {
    CoreError::new(CoreErrorKind::ManagerExecution, message)
        .with_dependency_type(DependencyType::Node)
        .with_operation(Operation::ListInstalled)
        .with_detail(detail)
}
