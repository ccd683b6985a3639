use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::{CoreError, NodeId, TaskId};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallParams {
    pub command: PathBuf,
    pub package_names: Vec<String>,
    pub proxy: Option<String>,
    pub upgrade_to_latest: bool,
    pub use_manager_default_config: bool,
    pub task_id: TaskId,
    pub node_id: NodeId,
}

impl InstallParams {
    /// Registry override, ignoring blank values.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy
            .as_deref()
            .map(str::trim)
            .filter(|proxy| !proxy.is_empty())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_command(&self.command)?;
        if self.use_manager_default_config && self.package_names.is_empty() {
            return Ok(());
        }
        validate_package_names(&self.package_names)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UninstallParams {
    pub command: PathBuf,
    pub package_names: Vec<String>,
    pub task_id: TaskId,
    pub node_id: NodeId,
}

impl UninstallParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_command(&self.command)?;
        validate_package_names(&self.package_names)
    }
}

/// Inventory scan of one node through its local package manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefreshParams {
    pub command: PathBuf,
    pub node_id: NodeId,
}

impl RefreshParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_command(&self.command)
    }
}

fn validate_command(command: &Path) -> Result<(), CoreError> {
    if command.as_os_str().is_empty() {
        return Err(CoreError::invalid_argument(
            "package manager command path must not be empty",
        ));
    }
    Ok(())
}

fn validate_package_names(names: &[String]) -> Result<(), CoreError> {
    if names.is_empty() {
        return Err(CoreError::invalid_argument(
            "at least one package name is required",
        ));
    }

    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() || name.contains('\0') {
            return Err(CoreError::invalid_argument(format!(
                "invalid package name '{name}'"
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(CoreError::invalid_argument(format!(
                "package name '{name}' is listed more than once"
            )));
        }
    }

    Ok(())
}
