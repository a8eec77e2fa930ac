//! Snapshot processing
//!
//! Walks a captured DOM snapshot, resolves every resource it references
//! (preloaded contents, plain URLs, and the dependencies those pull in),
//! persists them to the rendering service, and produces the hash mapping a
//! render request needs.

use crate::cache::ResourceStore;
use crate::fetch::{FetchOptions, ResourceFetcher};
use crate::resource::{create_dom_resource, resource_id, Resource};
use crate::upload::ResourceUploader;
use ocular_common::Result;
use ocular_transport::ResourceRef;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;

/// A captured page: CDT node array, referenced resources, and nested
/// frames. Produced by the embedding capture layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomSnapshot {
    pub url: String,
    pub cdt: serde_json::Value,
    /// Resources the capture layer saw but did not download.
    pub resource_urls: Vec<String>,
    /// Resources captured with their bytes in hand.
    pub resource_contents: HashMap<String, SnapshotResource>,
    pub frames: Vec<DomSnapshot>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotResource {
    pub url: String,
    pub content_type: Option<String>,
    pub value: Option<Vec<u8>>,
    pub error_status_code: Option<u16>,
}

/// The render-ready view of one page for one browser.
#[derive(Debug, Clone)]
pub struct ResourceMapping {
    pub dom: ResourceRef,
    /// Every resource the page needs, keyed by URL.
    pub resources: HashMap<String, ResourceRef>,
}

/// Resolve and persist everything `snapshot` needs, recursively through
/// frames, and return the mapping for a render request. URLs already
/// resolved in this walk are never resolved twice.
pub async fn create_resource_mapping(
    snapshot: &DomSnapshot,
    browser_name: Option<&str>,
    fetcher: &ResourceFetcher,
    store: &ResourceStore,
    uploader: &ResourceUploader,
    options: &FetchOptions,
) -> Result<ResourceMapping> {
    let mut manifest: BTreeMap<String, ResourceRef> = BTreeMap::new();
    let mut fresh: Vec<Resource> = Vec::new();

    // Frames first; each frame's DOM becomes a resource of the parent and
    // its resources join the shared pool.
    for frame in &snapshot.frames {
        let frame_mapping = Box::pin(create_resource_mapping(
            frame,
            browser_name,
            fetcher,
            store,
            uploader,
            options,
        ))
        .await?;
        manifest.insert(frame.url.clone(), frame_mapping.dom);
        for (url, hash) in frame_mapping.resources {
            manifest.entry(url).or_insert(hash);
        }
    }

    // Preloaded contents next: no fetch needed.
    for captured in snapshot.resource_contents.values() {
        let resource = match captured.error_status_code {
            Some(status) => Resource::unavailable(&captured.url, status, browser_name),
            None => {
                let content_type = captured.content_type.clone().unwrap_or_default();
                let value = captured.value.clone().unwrap_or_default();
                let dependencies =
                    crate::css::resolve_dependencies(&captured.url, &content_type, &value);
                Resource::new(&captured.url, content_type, value, browser_name)
                    .with_dependencies(dependencies)
            }
        };
        let stored = store.insert(&resource);
        manifest.insert(captured.url.clone(), stored.hash.clone());
        let mut queue: VecDeque<String> = resource.dependencies.iter().cloned().collect();
        fresh.push(resource);
        resolve_urls(
            &mut queue, &mut manifest, &mut fresh, browser_name, fetcher, store, options,
        )
        .await;
    }

    // Remaining plain URLs, breadth-first through their dependencies.
    let mut queue: VecDeque<String> = snapshot.resource_urls.iter().cloned().collect();
    resolve_urls(
        &mut queue, &mut manifest, &mut fresh, browser_name, fetcher, store, options,
    )
    .await;

    uploader.put_resources(&fresh).await?;

    // The DOM resource is built last, over the full manifest.
    let dom = create_dom_resource(&snapshot.url, &snapshot.cdt, &manifest);
    let dom_hash = dom.hash();
    store.insert(&dom);
    uploader.put_resources(std::slice::from_ref(&dom)).await?;

    debug!(
        url = %snapshot.url,
        resources = manifest.len(),
        fetched = fresh.len(),
        "resource mapping ready"
    );
    Ok(ResourceMapping {
        dom: dom_hash,
        resources: manifest.into_iter().collect(),
    })
}

async fn resolve_urls(
    queue: &mut VecDeque<String>,
    manifest: &mut BTreeMap<String, ResourceRef>,
    fresh: &mut Vec<Resource>,
    browser_name: Option<&str>,
    fetcher: &ResourceFetcher,
    store: &ResourceStore,
    options: &FetchOptions,
) {
    let mut visited: HashSet<String> = manifest.keys().cloned().collect();
    while let Some(url) = queue.pop_front() {
        if !visited.insert(url.clone()) {
            continue;
        }

        let id = resource_id(&url, browser_name);
        if let Some(stored) = store.get(&id) {
            manifest.insert(url, stored.hash.clone());
            queue.extend(stored.dependencies.iter().cloned());
            continue;
        }

        let resource = fetcher.fetch(&url, browser_name, options).await;
        let stored = store.insert(&resource);
        manifest.insert(url, stored.hash);
        queue.extend(resource.dependencies.iter().cloned());
        fresh.push(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use ocular_common::Config;
    use ocular_transport::{RenderingInfo, ServerClient};
    use std::sync::Arc;

    fn pipeline(server: &MockServer) -> (ResourceFetcher, Arc<ResourceStore>, ResourceUploader) {
        let mut config = Config::default();
        config.api_key = "k".into();
        config.server_url = server.base_url();
        let client = ServerClient::new(config).unwrap();
        client.set_rendering_info(RenderingInfo {
            service_url: server.base_url(),
            access_token: "t".into(),
            results_url: String::new(),
            stitching_service_url: None,
        });
        let client = Arc::new(client);
        let store = Arc::new(ResourceStore::new());
        let uploader = ResourceUploader::new(client, Arc::clone(&store));
        (ResourceFetcher::new(None, false).unwrap(), store, uploader)
    }

    async fn accept_everything(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/resources/query/resources-exist/");
                then.status(200).json_body(serde_json::json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_contains("/resources/sha256/");
                then.status(200);
            })
            .await;
    }

    #[tokio::test]
    async fn nested_css_dependencies_are_resolved_once() {
        let server = MockServer::start_async().await;
        accept_everything(&server).await;
        let style = server
            .mock_async(|when, then| {
                when.method(GET).path("/a.css");
                then.status(200)
                    .header("content-type", "text/css")
                    .body(".x { background: url('bg.png'); } @import 'b.css';");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/b.css");
                then.status(200)
                    .header("content-type", "text/css")
                    // Cycle back to a.css: must not loop.
                    .body("@import 'a.css';");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bg.png");
                then.status(200).header("content-type", "image/png").body("png");
            })
            .await;

        let (fetcher, store, uploader) = pipeline(&server);
        let snapshot = DomSnapshot {
            url: server.url("/"),
            cdt: serde_json::json!([]),
            resource_urls: vec![server.url("/a.css")],
            ..Default::default()
        };
        let mapping = create_resource_mapping(
            &snapshot,
            None,
            &fetcher,
            &store,
            &uploader,
            &FetchOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(mapping.resources.len(), 3);
        assert!(mapping.resources.contains_key(&server.url("/bg.png")));
        assert_eq!(style.hits_async().await, 1);
    }

    #[tokio::test]
    async fn frame_dom_becomes_parent_resource() {
        let server = MockServer::start_async().await;
        accept_everything(&server).await;

        let (fetcher, store, uploader) = pipeline(&server);
        let snapshot = DomSnapshot {
            url: server.url("/"),
            cdt: serde_json::json!([{"nodeType": 9}]),
            frames: vec![DomSnapshot {
                url: server.url("/frame.html"),
                cdt: serde_json::json!([{"nodeType": 9}]),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mapping = create_resource_mapping(
            &snapshot,
            None,
            &fetcher,
            &store,
            &uploader,
            &FetchOptions::default(),
        )
        .await
        .unwrap();

        let frame_hash = &mapping.resources[&server.url("/frame.html")];
        assert!(frame_hash.hash.is_some());
        assert_ne!(frame_hash, &mapping.dom);
    }

    #[tokio::test]
    async fn preloaded_contents_skip_fetching() {
        let server = MockServer::start_async().await;
        accept_everything(&server).await;

        let (fetcher, store, uploader) = pipeline(&server);
        let mut contents = HashMap::new();
        contents.insert(
            server.url("/inline.css"),
            SnapshotResource {
                url: server.url("/inline.css"),
                content_type: Some("text/css".into()),
                value: Some(b".a{}".to_vec()),
                error_status_code: None,
            },
        );
        let snapshot = DomSnapshot {
            url: server.url("/"),
            resource_contents: contents,
            ..Default::default()
        };
        let mapping = create_resource_mapping(
            &snapshot,
            None,
            &fetcher,
            &store,
            &uploader,
            &FetchOptions::default(),
        )
        .await
        .unwrap();

        // No GET mock exists for inline.css; reaching here proves no fetch.
        assert!(mapping.resources.contains_key(&server.url("/inline.css")));
    }
}
