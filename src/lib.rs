//! # shotqueue
//!
//! A durable web capture queue. Requests (a URL plus rendering flags) are
//! persisted in SQLite, claimed exactly once by a bounded pool of polling
//! workers, rendered with headless Chrome and delivered back to the requester
//! through a chat transport. Failures reach operators through a debounced
//! alerter.
//!
//! ## Pipeline
//!
//! | Stage | Component | Notes |
//! |-------|-----------|-------|
//! | Intake | [`Intake`] | URL validation, flag parsing, `(position, depth)` feedback |
//! | Queue | [`JobStore`] | FIFO by `(created_at, id)`, atomic claim, leases |
//! | Planning | [`CapturePlan`] | device profile, pdf / slice / full strategy, delay |
//! | Rendering | [`Renderer`], [`ChromeRenderer`] | navigation and overall timeouts |
//! | Delivery | [`Transport`] | Telegram Bot API or a local directory |
//! | Alerts | [`Alerter`] | level filter, debounce per (level, name, masked URL) |
//!
//! ## Job lifecycle
//!
//! ```text
//! queued ──claim──▶ running ──complete──▶ done | failed
//!    ▲                 │
//!    └──lease expired──┘   (reaper; failed once attempts run out)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shotqueue::{CaptureFlags, CapturePlan, JobStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = JobStore::connect(&StoreConfig::default()).await?;
//!
//!     let flags = CaptureFlags::parse("https://example.com --desktop --full");
//!     let job_id = store.enqueue(42, "https://example.com", &flags).await?;
//!     println!("position {} of {}", store.position_of(job_id).await?, store.depth().await?);
//!
//!     if let Some(job) = store.claim_next().await? {
//!         let plan = CapturePlan::from_flags(&job.params);
//!         println!("capturing {} as {:?}", job.url, plan);
//!         store.complete(job.id, job.attempts, true, None).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! shotqueue enqueue --user 42 https://example.com --desktop --delay=2000
//! shotqueue work --workers 5 --metrics-addr 127.0.0.1:9000
//! shotqueue status --job 17
//! ```

/// Configuration and settings
pub mod config;

/// Error types
pub mod error;

/// Durable job table and atomic claiming
pub mod store;

/// Request flags, capture plans and slice geometry
pub mod planner;

/// Request validation and enqueue
pub mod intake;

/// Debounced operator alerts
pub mod alerts;

/// Chrome rendering collaborator
pub mod renderer;

/// Artifact and message delivery
pub mod transport;

/// Polling workers and the orphaned-job reaper
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Metric handles and the Prometheus exporter
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use alerts::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use intake::*;
pub use self::metrics::*;
pub use planner::*;
pub use renderer::*;
pub use store::*;
pub use transport::*;
pub use utils::*;
pub use worker::*;
