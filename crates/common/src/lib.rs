//! Ocular Common Library
//!
//! Shared types, configuration, and error handling for the Ocular
//! visual regression testing client.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Ocular version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Full agent identifier sent with every request
pub fn default_agent_id() -> String {
    format!("ocular/{}", VERSION)
}
