//! Resilient HTTP transport for the Ocular baseline and rendering services
//!
//! Every outbound call goes through one send loop that layers long-request
//! continuation (202 + Location polling), concurrency backoff on 503, and
//! generic retry for transient failures.

pub mod api;
pub mod client;
pub mod retry;

pub use api::*;
pub use client::ServerClient;
pub use retry::{RetryPolicy, CONCURRENCY_BACKOFF, DELAY_BEFORE_POLLING};
