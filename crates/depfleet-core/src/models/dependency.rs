use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Node,
    Python,
}

impl DependencyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
        }
    }
}

impl std::str::FromStr for DependencyType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "node" => Ok(Self::Node),
            "python" => Ok(Self::Python),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fleet-wide install state of one package name, derived from inventory records.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FleetResult {
    pub package_name: String,
    pub node_ids: BTreeSet<NodeId>,
    pub versions: BTreeSet<String>,
}

impl FleetResult {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            node_ids: BTreeSet::new(),
            versions: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub installed_version: Option<String>,
    pub latest_version: Option<String>,
    pub dependency_type: DependencyType,
    pub result: Option<FleetResult>,
}

impl Dependency {
    pub fn new(name: impl Into<String>, dependency_type: DependencyType) -> Self {
        Self {
            name: name.into(),
            installed_version: None,
            latest_version: None,
            dependency_type,
            result: None,
        }
    }

    /// True when the local version or any fleet version trails `latest_version`.
    ///
    /// Versions that are not valid semver are compared by inequality.
    pub fn upgrade_available(&self) -> bool {
        let Some(latest) = self.latest_version.as_deref() else {
            return false;
        };

        let fleet_versions = self
            .result
            .iter()
            .flat_map(|result| result.versions.iter().map(String::as_str));

        self.installed_version
            .as_deref()
            .into_iter()
            .chain(fleet_versions)
            .any(|version| is_older(version, latest))
    }
}

fn is_older(version: &str, latest: &str) -> bool {
    match (
        semver::Version::parse(version.trim()),
        semver::Version::parse(latest.trim()),
    ) {
        (Ok(version), Ok(latest)) => version < latest,
        _ => version.trim() != latest.trim(),
    }
}
