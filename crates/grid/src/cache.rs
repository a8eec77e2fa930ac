//! Resource bookkeeping shared across checks of one runner
//!
//! The store is an explicit collaborator passed to the pipeline, never a
//! process-global. It remembers which resource ids have been processed
//! (hash and dependency list) and guarantees at most one in-flight upload
//! per content hash.

use crate::resource::Resource;
use dashmap::DashMap;
use ocular_common::Result;
use ocular_transport::ResourceRef;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// What the store remembers about a processed resource.
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub url: Option<String>,
    pub hash: ResourceRef,
    pub dependencies: Vec<String>,
}

#[derive(Default)]
pub struct ResourceStore {
    entries: DashMap<String, StoredResource>,
    uploads: DashMap<String, Arc<OnceCell<()>>>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<StoredResource> {
        self.entries.get(id).map(|entry| entry.clone())
    }

    pub fn insert(&self, resource: &Resource) -> StoredResource {
        let stored = StoredResource {
            url: resource.url.clone(),
            hash: resource.hash(),
            dependencies: resource.dependencies.clone(),
        };
        self.entries.insert(resource.id.clone(), stored.clone());
        stored
    }

    /// Run `upload` at most once per content hash. Concurrent callers for
    /// the same hash await the single in-flight upload; a failed upload
    /// leaves the slot empty so a later step may retry.
    pub async fn upload_once<F, Fut>(&self, hash: &str, upload: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cell = self
            .uploads
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_try_init(upload).await.map(|_| ())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
