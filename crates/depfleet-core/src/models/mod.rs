pub mod dependency;
pub mod error;
pub mod inventory;
pub mod params;
pub mod task;
pub mod task_log;

pub use dependency::{Dependency, DependencyType, FleetResult, NodeId};
pub use error::{CoreError, CoreErrorKind, Operation};
pub use inventory::{InstalledPackage, InventoryRecord};
pub use params::{InstallParams, RefreshParams, UninstallParams};
pub use task::{TaskId, TaskKind, TaskStatus};
pub use task_log::{TaskLogLine, TaskLogStream};
