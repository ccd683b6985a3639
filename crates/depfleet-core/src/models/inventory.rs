use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::models::{DependencyType, NodeId};

/// One package as reported by a node's package manager.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub node_id: NodeId,
    pub package_name: String,
    pub dependency_type: DependencyType,
    pub version: String,
    pub observed_at: SystemTime,
}

impl InventoryRecord {
    pub fn from_installed(
        node_id: &NodeId,
        dependency_type: DependencyType,
        package: &InstalledPackage,
        observed_at: SystemTime,
    ) -> Self {
        Self {
            node_id: node_id.clone(),
            package_name: package.name.clone(),
            dependency_type,
            version: package.version.clone(),
            observed_at,
        }
    }
}
