use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, Dependency, DependencyType, FleetResult, Operation};
use crate::persistence::InventoryStore;
use crate::registry::RegistryClient;

pub type ReconcileResult<T> = Result<T, CoreError>;

/// One page of catalogue entries plus the upstream match count.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CatalogueSearchResult {
    pub items: Vec<Dependency>,
    pub total: u64,
}

/// Joins upstream registry matches with the fleet inventory.
pub struct ReconciliationEngine {
    registry: Arc<RegistryClient>,
    inventory: Arc<dyn InventoryStore>,
}

impl ReconciliationEngine {
    pub fn new(registry: Arc<RegistryClient>, inventory: Arc<dyn InventoryStore>) -> Self {
        Self {
            registry,
            inventory,
        }
    }

    pub fn dependency_type(&self) -> DependencyType {
        self.registry.dependency_type()
    }

    /// Searches the registry and annotates each match with where it is installed.
    ///
    /// Items keep the registry's order. `page` starts at 1.
    pub fn search(
        &self,
        query: &str,
        page: usize,
        page_size: usize,
    ) -> ReconcileResult<CatalogueSearchResult> {
        let dependency_type = self.dependency_type();
        let offset = page_offset(page, page_size)
            .map_err(|error| error.attribute(dependency_type, None, Operation::Search))?;
        if query.trim().is_empty() {
            return Err(CoreError::invalid_argument("search query must not be empty")
                .with_dependency_type(dependency_type)
                .with_operation(Operation::Search));
        }

        let upstream = self.registry.search(query, offset, page_size)?;
        if upstream.total == 0 || upstream.results.is_empty() {
            return Ok(CatalogueSearchResult {
                items: Vec::new(),
                total: upstream.total,
            });
        }

        let names: Vec<String> = upstream
            .results
            .iter()
            .map(|package| package.name.clone())
            .collect();
        let fleet: HashMap<String, FleetResult> = self
            .inventory
            .aggregate_by_name(dependency_type, &names)?
            .into_iter()
            .map(|result| (result.package_name.clone(), result))
            .collect();

        let items = upstream
            .results
            .into_iter()
            .map(|package| {
                let result = fleet
                    .get(&package.name)
                    .filter(|result| !result.is_empty())
                    .cloned();
                Dependency {
                    latest_version: package.latest_version,
                    result,
                    ..Dependency::new(package.name, dependency_type)
                }
            })
            .collect();

        Ok(CatalogueSearchResult {
            items,
            total: upstream.total,
        })
    }

    /// Pages through every package installed anywhere in the fleet, ordered by name.
    pub fn fleet(&self, page: usize, page_size: usize) -> ReconcileResult<(Vec<Dependency>, usize)> {
        let dependency_type = self.dependency_type();
        let offset = page_offset(page, page_size).map_err(|error| {
            error.attribute(dependency_type, None, Operation::AggregateInventory)
        })?;

        let (results, total) = self
            .inventory
            .list_aggregated(dependency_type, offset, page_size)?;
        let items = results
            .into_iter()
            .map(|result| {
                let mut dependency = Dependency::new(result.package_name.clone(), dependency_type);
                dependency.result = Some(result);
                dependency
            })
            .collect();
        Ok((items, total))
    }
}

fn page_offset(page: usize, page_size: usize) -> ReconcileResult<usize> {
    if page == 0 {
        return Err(CoreError::invalid_argument("page must be at least 1"));
    }
    if page_size == 0 {
        return Err(CoreError::invalid_argument("page size must be at least 1"));
    }
    (page - 1)
        .checked_mul(page_size)
        .ok_or_else(|| CoreError::invalid_argument("page offset overflows"))
}
