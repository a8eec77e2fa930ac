//! Client configuration
//!
//! Plain structured values supplied by the host test runner. No file
//! loading or merging happens here.

use crate::types::{BatchInfo, BrowserInfo, FailureReports, ImageMatchSettings, RectangleSize};
use serde::{Deserialize, Serialize};

/// Default baseline service endpoint
pub const DEFAULT_SERVER_URL: &str = "https://api.ocular.dev";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key for the baseline service
    pub api_key: String,

    /// Baseline service URL
    pub server_url: String,

    /// Outbound proxy URL, if any
    pub proxy: Option<String>,

    /// Skip TLS certificate verification. Intended for proxies with
    /// self-signed certificates only.
    pub accept_invalid_certs: bool,

    /// Default application name
    pub app_name: Option<String>,

    /// Batch grouping for this run
    pub batch: BatchInfo,

    /// Default viewport; individual browsers override this
    pub viewport_size: Option<RectangleSize>,

    /// Browser permutations for grid rendering
    pub browsers: Vec<BrowserInfo>,

    /// Match retry budget per check call (ms)
    pub match_timeout_ms: u64,

    /// Connection timeout for outbound requests (ms)
    pub connection_timeout_ms: u64,

    /// When mismatch failures are raised
    pub failure_reports: FailureReports,

    /// Update the baseline automatically for new tests
    pub save_new_tests: bool,

    /// Update the baseline automatically on failing tests
    pub save_failed_tests: bool,

    pub save_diffs: bool,

    /// Default match settings applied to every check
    pub default_match_settings: ImageMatchSettings,

    pub branch_name: Option<String>,
    pub parent_branch_name: Option<String>,
    pub baseline_branch_name: Option<String>,
    pub baseline_env_name: Option<String>,

    /// How many tests may hold an open remote session at once
    pub concurrency: usize,

    /// Render submissions in flight per test, multiplied by browser count
    pub concurrent_renders_per_test: usize,

    /// Whether unresolved results fail the overall run
    pub fail_on_diff: bool,

    /// Skip closing batches at runner teardown
    pub dont_close_batches: bool,

    /// Agent identifier; defaults to ocular/{version}
    pub agent_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            proxy: None,
            accept_invalid_certs: false,
            app_name: None,
            batch: BatchInfo::default(),
            viewport_size: None,
            browsers: Vec::new(),
            match_timeout_ms: 2000,
            connection_timeout_ms: 300_000,
            failure_reports: FailureReports::OnClose,
            save_new_tests: true,
            save_failed_tests: false,
            save_diffs: false,
            default_match_settings: ImageMatchSettings::default(),
            branch_name: None,
            parent_branch_name: None,
            baseline_branch_name: None,
            baseline_env_name: None,
            concurrency: 5,
            concurrent_renders_per_test: 1,
            fail_on_diff: true,
            dont_close_batches: false,
            agent_id: crate::default_agent_id(),
        }
    }
}

impl Config {
    /// Configuration with credentials taken from the environment
    /// (`OCULAR_API_KEY`, `OCULAR_SERVER_URL`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("OCULAR_API_KEY") {
            config.api_key = key;
        }
        if let Ok(url) = std::env::var("OCULAR_SERVER_URL") {
            config.server_url = url;
        }
        config
    }

    /// Validate the fields every session needs before opening.
    pub fn validate(&self) -> crate::Result<()> {
        if self.api_key.is_empty() {
            return Err(crate::Error::InvalidConfig("API key is missing".into()));
        }
        if self.server_url.is_empty() {
            return Err(crate::Error::InvalidConfig("server URL is missing".into()));
        }
        Ok(())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    pub fn with_browsers(mut self, browsers: Vec<BrowserInfo>) -> Self {
        self.browsers = browsers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.match_timeout_ms, 2000);
        assert_eq!(config.concurrency, 5);
        assert!(config.save_new_tests);
        assert!(!config.save_failed_tests);
        assert!(!config.accept_invalid_certs);
    }

    #[test]
    fn validate_requires_api_key() {
        let config = Config::default();
        assert!(config.validate().is_err());
        assert!(config.with_api_key("k").validate().is_ok());
    }
}
