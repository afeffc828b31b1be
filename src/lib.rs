// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod config;
pub mod identity;
pub mod images;
pub mod ingest;
pub mod keywords;
pub mod market;
pub mod metrics;
pub mod notify;
pub mod run;
pub mod text;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::config::NewsdeskConfig;
pub use crate::ingest::types::FeedItem;
pub use crate::run::{RunOrchestrator, RunPhase, RunSnapshot};
