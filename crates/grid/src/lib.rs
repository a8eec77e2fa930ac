//! Ocular rendering-grid support
//!
//! Turns a captured DOM snapshot into content-addressed resources, uploads
//! the ones the rendering service is missing, and drives render jobs
//! through submission and status polling.

pub mod cache;
pub mod css;
pub mod fetch;
pub mod mapping;
pub mod render;
pub mod resource;
pub mod upload;

pub use cache::ResourceStore;
pub use fetch::ResourceFetcher;
pub use mapping::{create_resource_mapping, DomSnapshot, ResourceMapping};
pub use render::{RenderOrchestrator, ResolvedRegions};
pub use resource::{create_dom_resource, Resource};
pub use upload::ResourceUploader;
