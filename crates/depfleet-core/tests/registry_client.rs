use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use depfleet_core::models::{CoreError, CoreErrorKind, DependencyType, Operation};
use depfleet_core::registry::{RegistryClient, RegistryResult, RegistrySource};

struct StubRegistrySource {
    search_body: RegistryResult<String>,
    detail_body: RegistryResult<String>,
    search_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    last_search: Mutex<Option<(String, usize, usize)>>,
}

impl StubRegistrySource {
    fn new(search_body: RegistryResult<String>, detail_body: RegistryResult<String>) -> Self {
        Self {
            search_body,
            detail_body,
            search_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
            last_search: Mutex::new(None),
        }
    }
}

impl RegistrySource for StubRegistrySource {
    fn search(&self, query: &str, from: usize, size: usize) -> RegistryResult<String> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_search.lock().unwrap() = Some((query.to_string(), from, size));
        self.search_body.clone()
    }

    fn package_detail(&self, _name: &str) -> RegistryResult<String> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.detail_body.clone()
    }
}

const LODASH_SEARCH: &str =
    r#"{"total": 1, "results": [{"package": {"name": "lodash", "version": "4.17.21"}}]}"#;
const LODASH_DETAIL: &str = r#"{"collected": {"metadata": {"name": "lodash", "version": "4.17.21"}}}"#;

fn client(source: Arc<StubRegistrySource>) -> RegistryClient {
    RegistryClient::new(source, DependencyType::Node)
}

#[test]
fn search_passes_query_offset_and_limit_through() {
    let source = Arc::new(StubRegistrySource::new(
        Ok(LODASH_SEARCH.to_string()),
        Ok(LODASH_DETAIL.to_string()),
    ));
    let page = client(source.clone()).search("  lodash ", 40, 20).unwrap();

    assert_eq!(page.total, 1);
    assert_eq!(page.results[0].name, "lodash");
    assert_eq!(
        source.last_search.lock().unwrap().clone(),
        Some(("lodash".to_string(), 40, 20))
    );
}

#[test]
fn empty_query_fails_without_network_calls() {
    let source = Arc::new(StubRegistrySource::new(
        Ok(LODASH_SEARCH.to_string()),
        Ok(LODASH_DETAIL.to_string()),
    ));
    let client = client(source.clone());

    for query in ["", "   "] {
        let error = client.search(query, 0, 20).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidArgument);
        assert_eq!(error.operation, Some(Operation::Search));
    }
    assert_eq!(
        client.fetch_latest_version("").unwrap_err().kind,
        CoreErrorKind::InvalidArgument
    );
    assert_eq!(source.search_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.detail_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn upstream_failures_keep_their_body_and_gain_attribution() {
    let failure = CoreError::new(CoreErrorKind::Upstream, "registry returned status 503")
        .with_detail("<html>Service Unavailable</html>");
    let source = Arc::new(StubRegistrySource::new(Err(failure.clone()), Err(failure)));
    let client = client(source);

    let error = client.search("lodash", 0, 20).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Upstream);
    assert_eq!(error.detail.as_deref(), Some("<html>Service Unavailable</html>"));
    assert_eq!(error.dependency_type, Some(DependencyType::Node));
    assert_eq!(error.operation, Some(Operation::Search));

    let error = client.fetch_latest_version("lodash").unwrap_err();
    assert_eq!(error.operation, Some(Operation::LatestVersion));
}

#[test]
fn malformed_body_is_upstream_error_with_partial_body() {
    let source = Arc::new(StubRegistrySource::new(
        Ok(r#"{"total": 1, "results": [{"pack"#.to_string()),
        Ok("not json".to_string()),
    ));
    let client = client(source);

    let error = client.search("lodash", 0, 20).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Upstream);
    assert!(error.detail.unwrap().starts_with(r#"{"total": 1"#));

    let error = client.fetch_latest_version("lodash").unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Upstream);
    assert_eq!(error.detail.as_deref(), Some("not json"));
}

#[test]
fn fetch_latest_version_reads_metadata() {
    let source = Arc::new(StubRegistrySource::new(
        Ok(LODASH_SEARCH.to_string()),
        Ok(LODASH_DETAIL.to_string()),
    ));
    assert_eq!(
        client(source.clone()).fetch_latest_version("lodash").unwrap(),
        "4.17.21"
    );
    assert_eq!(source.detail_calls.load(Ordering::SeqCst), 1);
}
