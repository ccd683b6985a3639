use std::io::{self, Read};
use std::time::Duration;

use url::Url;

use crate::config::RegistryConfig;
use crate::models::CoreError;
use crate::registry::{RegistryResult, RegistrySource, upstream_error};

const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// npms.io transport over blocking HTTP.
///
/// Search and detail requests use separate agents so each carries its own
/// overall timeout.
pub struct UreqRegistrySource {
    base_url: Url,
    search_agent: ureq::Agent,
    detail_agent: ureq::Agent,
}

impl UreqRegistrySource {
    pub fn new(config: &RegistryConfig) -> RegistryResult<Self> {
        let base_url = Url::parse(config.base_url.trim()).map_err(|error| {
            CoreError::invalid_argument(format!(
                "invalid registry base url '{}': {error}",
                config.base_url
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CoreError::invalid_argument(format!(
                "registry base url '{base_url}' cannot carry a path"
            )));
        }

        Ok(Self {
            base_url,
            search_agent: build_agent(config.search_timeout(), &config.user_agent),
            detail_agent: build_agent(config.detail_timeout(), &config.user_agent),
        })
    }

    pub fn search_url(&self, query: &str, from: usize, size: usize) -> Url {
        let mut url = self.endpoint(&["search"]);
        url.query_pairs_mut()
            .append_pair("from", &from.to_string())
            .append_pair("q", query)
            .append_pair("size", &size.to_string());
        url
    }

    pub fn package_url(&self, name: &str) -> Url {
        self.endpoint(&["package", name])
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

impl RegistrySource for UreqRegistrySource {
    fn search(&self, query: &str, from: usize, size: usize) -> RegistryResult<String> {
        get(&self.search_agent, &self.search_url(query, from, size))
    }

    fn package_detail(&self, name: &str) -> RegistryResult<String> {
        get(&self.detail_agent, &self.package_url(name))
    }
}

fn build_agent(timeout: Duration, user_agent: &str) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
}

fn get(agent: &ureq::Agent, url: &Url) -> RegistryResult<String> {
    match agent.get(url.as_str()).call() {
        Ok(response) => {
            let (body, read) = read_body(response);
            match read {
                Ok(()) => Ok(body),
                Err(error) => Err(upstream_error(
                    format!("failed to read response from {url}: {error}"),
                    &body,
                )),
            }
        }
        Err(ureq::Error::Status(code, response)) => {
            let (body, read) = read_body(response);
            let message = match read {
                Ok(()) => format!("registry returned status {code} for {url}"),
                Err(error) => format!(
                    "registry returned status {code} for {url} (body truncated: {error})"
                ),
            };
            Err(upstream_error(message, &body))
        }
        Err(ureq::Error::Transport(transport)) => Err(upstream_error(
            format!("registry request to {url} failed: {transport}"),
            "",
        )),
    }
}

/// Reads the body up to `MAX_BODY_BYTES`. Bytes that arrived before a read
/// failure are returned alongside the failure.
fn read_body(response: ureq::Response) -> (String, io::Result<()>) {
    let mut buffer = Vec::new();
    let read = response
        .into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut buffer)
        .map(|_| ());
    (String::from_utf8_lossy(&buffer).into_owned(), read)
}
