//! Resource upload path
//!
//! Asks the rendering service which content hashes it already stores and
//! uploads only the missing ones, bounded by an upload throat and the
//! store's one-upload-per-hash guarantee.

use crate::cache::ResourceStore;
use crate::resource::Resource;
use ocular_common::Result;
use ocular_transport::{ResourceRef, ServerClient};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

const UPLOAD_CONCURRENCY: usize = 100;

pub struct ResourceUploader {
    client: Arc<ServerClient>,
    store: Arc<ResourceStore>,
    throat: Arc<Semaphore>,
}

impl ResourceUploader {
    pub fn new(client: Arc<ServerClient>, store: Arc<ResourceStore>) -> Self {
        Self {
            client,
            store,
            throat: Arc::new(Semaphore::new(UPLOAD_CONCURRENCY)),
        }
    }

    /// Make every given resource available to the rendering service.
    /// Placeholder (error) resources have no content and are skipped.
    pub async fn put_resources(&self, resources: &[Resource]) -> Result<()> {
        let mut by_hash: HashMap<String, &Resource> = HashMap::new();
        for resource in resources {
            if resource.error_status_code.is_some() {
                continue;
            }
            if let Some(hash) = resource.hash().hash {
                by_hash.entry(hash).or_insert(resource);
            }
        }
        if by_hash.is_empty() {
            return Ok(());
        }

        let hashes: Vec<String> = by_hash.keys().cloned().collect();
        let refs: Vec<ResourceRef> = hashes
            .iter()
            .map(|hash| ResourceRef::sha256(hash.clone(), by_hash[hash].content_type.clone()))
            .collect();
        let present = self.client.check_resources(&refs).await?;

        let mut pending = Vec::new();
        for (hash, exists) in hashes.iter().zip(present) {
            if exists {
                continue;
            }
            let resource = by_hash[hash];
            let hash = hash.clone();
            let client = Arc::clone(&self.client);
            let store = Arc::clone(&self.store);
            let throat = Arc::clone(&self.throat);
            let content_type = resource.content_type.clone();
            let value = resource.value.clone();
            pending.push(async move {
                store
                    .upload_once(&hash, || async {
                        let _permit = throat.acquire().await.map_err(|_| {
                            ocular_common::Error::Internal("upload throat closed".into())
                        })?;
                        debug!(%hash, size = value.len(), "uploading resource");
                        client.put_resource(&hash, &content_type, value).await
                    })
                    .await
            });
        }
        debug!(total = refs.len(), missing = pending.len(), "resource batch checked");
        futures::future::try_join_all(pending).await?;
        Ok(())
    }
}
