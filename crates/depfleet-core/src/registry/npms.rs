//! Response bodies of the npms.io search and package APIs.

use serde::Deserialize;

use crate::registry::{RegistryPackage, RegistryResult, RegistrySearchPage, upstream_error};

#[derive(Deserialize)]
struct SearchResponse {
    total: u64,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    package: SearchPackage,
}

#[derive(Deserialize)]
struct SearchPackage {
    name: String,
    version: Option<String>,
}

#[derive(Deserialize)]
struct PackageResponse {
    collected: Collected,
}

#[derive(Deserialize)]
struct Collected {
    metadata: Metadata,
}

#[derive(Deserialize)]
struct Metadata {
    version: Option<String>,
}

pub fn parse_search(body: &str) -> RegistryResult<RegistrySearchPage> {
    let response: SearchResponse = serde_json::from_str(body)
        .map_err(|error| upstream_error(format!("invalid registry search response: {error}"), body))?;

    Ok(RegistrySearchPage {
        total: response.total,
        results: response
            .results
            .into_iter()
            .map(|hit| RegistryPackage {
                name: hit.package.name,
                latest_version: hit.package.version.filter(|version| !version.is_empty()),
            })
            .collect(),
    })
}

pub fn parse_latest_version(name: &str, body: &str) -> RegistryResult<String> {
    let response: PackageResponse = serde_json::from_str(body).map_err(|error| {
        upstream_error(
            format!("invalid registry detail response for '{name}': {error}"),
            body,
        )
    })?;

    response
        .collected
        .metadata
        .version
        .filter(|version| !version.trim().is_empty())
        .ok_or_else(|| upstream_error(format!("registry has no version for '{name}'"), body))
}

#[cfg(test)]
mod tests {
    use super::{parse_latest_version, parse_search};
    use crate::models::CoreErrorKind;

    #[test]
    fn parses_search_hits_in_upstream_order() {
        let body = r#"{
            "total": 2,
            "results": [
                {"package": {"name": "lodash", "version": "4.17.21"}, "score": {"final": 0.9}},
                {"package": {"name": "lodash-es", "version": "4.17.21"}}
            ]
        }"#;
        let page = parse_search(body).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.results[0].name, "lodash");
        assert_eq!(page.results[1].name, "lodash-es");
        assert_eq!(page.results[0].latest_version.as_deref(), Some("4.17.21"));
    }

    #[test]
    fn truncated_search_body_is_upstream_error_with_body() {
        let error = parse_search(r#"{"total": 3, "results": [{"pack"#).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Upstream);
        assert_eq!(error.detail.as_deref(), Some(r#"{"total": 3, "results": [{"pack"#));
    }

    #[test]
    fn detail_reads_collected_metadata_version() {
        let body = r#"{"collected": {"metadata": {"name": "lodash", "version": "4.17.21"}}}"#;
        assert_eq!(parse_latest_version("lodash", body).unwrap(), "4.17.21");
    }

    #[test]
    fn detail_without_version_is_upstream_error() {
        let error =
            parse_latest_version("lodash", r#"{"collected": {"metadata": {}}}"#).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Upstream);
    }
}
