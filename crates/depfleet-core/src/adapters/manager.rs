use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::execution::{ProcessOutput, TaskCancellationToken, TaskLogSink};
use crate::models::{CoreError, DependencyType, InstallParams, InstalledPackage, UninstallParams};

pub type AdapterResult<T> = Result<T, CoreError>;

pub type AdapterFuture<T> = Pin<Box<dyn Future<Output = AdapterResult<T>> + Send>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mutation {
    Install,
    Uninstall,
}

/// A node-local package manager driven through its command line.
///
/// Argument builders are pure. `execute` streams the child's output into the
/// sink as it is produced and resolves once the child exits; it never closes
/// the sink.
pub trait PackageManagerAdapter: Send + Sync {
    fn dependency_type(&self) -> DependencyType;

    fn build_install_args(&self, params: &InstallParams) -> AdapterResult<Vec<String>>;

    fn build_uninstall_args(&self, params: &UninstallParams) -> AdapterResult<Vec<String>>;

    fn list_global_installed(&self, command: &Path) -> AdapterFuture<Vec<InstalledPackage>>;

    fn execute(
        &self,
        command: &Path,
        mutation: Mutation,
        args: Vec<String>,
        sink: TaskLogSink,
        cancellation: TaskCancellationToken,
    ) -> AdapterFuture<ProcessOutput>;
}
