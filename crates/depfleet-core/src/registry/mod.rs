pub mod npms;
pub mod ureq_source;

pub use ureq_source::UreqRegistrySource;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, DependencyType, Operation};

pub type RegistryResult<T> = Result<T, CoreError>;

/// Longest upstream body kept on an error's `detail`.
const PARTIAL_BODY_BYTES: usize = 2 * 1024;

/// Raw transport to an upstream registry. Implementations return the response
/// body of a successful request and map every other outcome to `Upstream`.
pub trait RegistrySource: Send + Sync {
    fn search(&self, query: &str, from: usize, size: usize) -> RegistryResult<String>;

    fn package_detail(&self, name: &str) -> RegistryResult<String>;
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegistryPackage {
    pub name: String,
    pub latest_version: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegistrySearchPage {
    pub results: Vec<RegistryPackage>,
    pub total: u64,
}

pub struct RegistryClient {
    source: Arc<dyn RegistrySource>,
    dependency_type: DependencyType,
}

impl RegistryClient {
    pub fn new(source: Arc<dyn RegistrySource>, dependency_type: DependencyType) -> Self {
        Self {
            source,
            dependency_type,
        }
    }

    pub fn dependency_type(&self) -> DependencyType {
        self.dependency_type
    }

    pub fn search(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> RegistryResult<RegistrySearchPage> {
        let query = query.trim();
        if query.is_empty() {
            return Err(self.invalid(Operation::Search, "search query must not be empty"));
        }
        if limit == 0 {
            return Err(self.invalid(Operation::Search, "search limit must be at least 1"));
        }

        let body = self
            .source
            .search(query, offset, limit)
            .map_err(|error| self.attribute(error, Operation::Search))?;
        npms::parse_search(&body).map_err(|error| self.attribute(error, Operation::Search))
    }

    pub fn fetch_latest_version(&self, name: &str) -> RegistryResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(self.invalid(
                Operation::LatestVersion,
                "package name must not be empty",
            ));
        }

        let body = self
            .source
            .package_detail(name)
            .map_err(|error| self.attribute(error, Operation::LatestVersion))?;
        npms::parse_latest_version(name, &body)
            .map_err(|error| self.attribute(error, Operation::LatestVersion))
    }

    fn invalid(&self, operation: Operation, message: &str) -> CoreError {
        CoreError::invalid_argument(message)
            .with_dependency_type(self.dependency_type)
            .with_operation(operation)
    }

    fn attribute(&self, error: CoreError, operation: Operation) -> CoreError {
        error.attribute(self.dependency_type, None, operation)
    }
}

pub(crate) fn upstream_error(message: impl Into<String>, body: &str) -> CoreError {
    let error = CoreError::new(CoreErrorKind::Upstream, message);
    let partial = partial_body(body);
    if partial.is_empty() {
        error
    } else {
        error.with_detail(partial)
    }
}

fn partial_body(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= PARTIAL_BODY_BYTES {
        return body;
    }
    let mut end = PARTIAL_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
