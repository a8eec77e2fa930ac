//! Resource fetching
//!
//! Downloads page resources referenced by a snapshot. A failed download
//! never fails the pipeline; it yields a placeholder resource carrying the
//! error status so the rendering service can proceed without it.

use crate::css::resolve_dependencies;
use crate::resource::{resource_id, Resource};
use dashmap::DashMap;
use ocular_common::{Error, Result};
use reqwest::header;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const FETCH_RETRIES: u32 = 5;
const RETRY_PAUSE: Duration = Duration::from_millis(100);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request fetch context taken from the page under test.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub cookies: Option<String>,
}

/// Downloads resources with bounded retries and in-flight deduplication:
/// concurrent requests for the same resource id share one download.
pub struct ResourceFetcher {
    http: reqwest::Client,
    in_flight: DashMap<String, Arc<OnceCell<Resource>>>,
}

impl ResourceFetcher {
    pub fn new(proxy: Option<&str>, accept_invalid_certs: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(FETCH_TIMEOUT);
        if accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                Error::InvalidConfig(format!("invalid proxy {proxy}: {e}"))
            })?);
        }
        let http = builder.build().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            http,
            in_flight: DashMap::new(),
        })
    }

    /// Fetch a resource, sharing an in-flight download when one exists for
    /// the same id. Never errors; failure is encoded in the resource.
    pub async fn fetch(
        &self,
        url: &str,
        browser_name: Option<&str>,
        options: &FetchOptions,
    ) -> Resource {
        let id = resource_id(url, browser_name);
        let cell = self
            .in_flight
            .entry(id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_init(|| self.fetch_uncached(url, browser_name, options))
            .await
            .clone()
    }

    async fn fetch_uncached(
        &self,
        url: &str,
        browser_name: Option<&str>,
        options: &FetchOptions,
    ) -> Resource {
        for attempt in 0..=FETCH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_PAUSE).await;
            }

            let mut request = self.http.get(url);
            if let Some(referer) = &options.referer {
                request = request.header(header::REFERER, referer);
            }
            if let Some(user_agent) = &options.user_agent {
                request = request.header(header::USER_AGENT, user_agent);
            }
            if let Some(cookies) = &options.cookies {
                request = request.header(header::COOKIE, cookies);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        debug!(%url, %status, "resource unavailable");
                        return Resource::unavailable(url, status.as_u16(), browser_name);
                    }
                    let content_type = response
                        .headers()
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    match response.bytes().await {
                        Ok(body) => {
                            let dependencies = resolve_dependencies(url, &content_type, &body);
                            debug!(%url, size = body.len(), deps = dependencies.len(), "fetched");
                            return Resource::new(url, content_type, body.to_vec(), browser_name)
                                .with_dependencies(dependencies);
                        }
                        Err(err) => {
                            warn!(%url, error = %err, attempt, "body read failed");
                        }
                    }
                }
                Err(err) => {
                    warn!(%url, error = %err, attempt, "fetch failed");
                }
            }
        }
        // Transport-level failure after every retry maps to a gateway
        // timeout placeholder.
        Resource::unavailable(url, 504, browser_name)
    }
}
