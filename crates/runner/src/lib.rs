//! Ocular test runner
//!
//! Session lifecycle (open, check, close, abort), the bounded match retry
//! loop, per-browser fan-out against the rendering grid, and end-of-run
//! aggregation into a summary.

pub mod controller;
pub mod grid_check;
pub mod match_task;
pub mod runner;
pub mod session;
pub mod step_queue;

pub use controller::{GlobalState, TestController};
pub use grid_check::{GridCheckSettings, GridTest};
pub use match_task::{CaptureProvider, CheckSettings, MatchTask};
pub use runner::{TestResultContainer, TestResultsSummary, VisualRunner};
pub use session::{ClassicSession, Session, SessionCore};
pub use step_queue::StepQueue;
