//! Content-addressed page resources
//!
//! Every artifact shipped to the rendering service (images, stylesheets,
//! fonts, the DOM itself) is addressed by the sha256 of its bytes. A
//! resource that could not be fetched still participates in the mapping,
//! carrying an error status code instead of content.

use ocular_transport::ResourceRef;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hard cap accepted by the rendering service (34.5 MiB).
pub const MAX_RESOURCE_SIZE: usize = 36_175_872;
/// Truncation target leaves headroom below the cap.
const TRUNCATED_SIZE: usize = MAX_RESOURCE_SIZE - 100 * 1024;

/// Content types that carry structural page data and must never be cut.
const UNTRUNCATABLE_TYPES: &[&str] = &["x-ocular-html/cdt", "x-ocular-vhs"];

/// Hosts that serve different content per requesting browser; their
/// resources are cached per browser, not globally.
const BROWSER_DEPENDENT_HOSTS: &[&str] = &["fonts.googleapis.com"];

#[derive(Debug, Clone)]
pub struct Resource {
    /// Cache identity. The URL, suffixed with `~{browser}` for
    /// browser-dependent hosts.
    pub id: String,
    pub url: Option<String>,
    pub content_type: String,
    pub value: Vec<u8>,
    pub error_status_code: Option<u16>,
    /// URLs this resource references (css/svg imports), used for
    /// recursive resolution.
    pub dependencies: Vec<String>,
}

impl Resource {
    pub fn new(
        url: impl Into<String>,
        content_type: impl Into<String>,
        value: Vec<u8>,
        browser_name: Option<&str>,
    ) -> Self {
        let url = url.into();
        let content_type = content_type.into();
        let value = maybe_truncate(value, &content_type);
        Self {
            id: resource_id(&url, browser_name),
            url: Some(url),
            content_type,
            value,
            error_status_code: None,
            dependencies: Vec::new(),
        }
    }

    /// A placeholder for a resource that could not be retrieved. The
    /// rendering service renders around it.
    pub fn unavailable(url: impl Into<String>, status: u16, browser_name: Option<&str>) -> Self {
        let url = url.into();
        Self {
            id: resource_id(&url, browser_name),
            url: Some(url),
            content_type: String::new(),
            value: Vec::new(),
            error_status_code: Some(status),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn hash(&self) -> ResourceRef {
        match self.error_status_code {
            Some(status) => ResourceRef::error(status),
            None => ResourceRef::sha256(sha256_hex(&self.value), self.content_type.clone()),
        }
    }
}

pub(crate) fn resource_id(url: &str, browser_name: Option<&str>) -> String {
    match browser_name {
        Some(browser) if !browser.is_empty() && is_browser_dependent(url) => {
            format!("{url}~{browser}")
        }
        _ => url.to_string(),
    }
}

fn is_browser_dependent(url: &str) -> bool {
    BROWSER_DEPENDENT_HOSTS.iter().any(|host| url.contains(host))
}

fn maybe_truncate(value: Vec<u8>, content_type: &str) -> Vec<u8> {
    let untruncatable = UNTRUNCATABLE_TYPES
        .iter()
        .any(|t| content_type.starts_with(t));
    if value.len() > MAX_RESOURCE_SIZE && !untruncatable {
        let mut value = value;
        value.truncate(TRUNCATED_SIZE);
        value
    } else {
        value
    }
}

pub fn sha256_hex(value: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value);
    hex::encode(hasher.finalize())
}

/// Build the DOM resource for a page: the CDT node array plus a manifest of
/// every resource hash, keyed by URL in sorted order so identical pages
/// hash identically.
pub fn create_dom_resource(
    url: &str,
    cdt: &serde_json::Value,
    resources: &BTreeMap<String, ResourceRef>,
) -> Resource {
    let value = json!({
        "resources": resources,
        "domNodes": cdt,
    });
    // BTreeMap already serializes in key order; serde_json preserves
    // insertion order for the outer object.
    let bytes = serde_json::to_vec(&value).unwrap_or_default();
    Resource::new(url, "x-ocular-html/cdt", bytes, None)
}
