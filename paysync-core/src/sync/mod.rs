//! Device ↔ server approval synchronization
//!
//! - version-cursor delta pulls, capped per page
//! - offline approve/reject queue replayed every cycle (local wins until confirmed)
//! - orphan reconciliation against freshly pulled orders

pub mod client;
pub mod config;
pub mod engine;
pub mod mirror;
pub mod queue;

pub use client::{HttpServerClient, ServerApi};
pub use config::{ServerEndpoint, SyncCursor};
pub use engine::{ActionOutcome, PullOutcome, PushOutcome, SyncEngine, SyncReport};
pub use mirror::ApprovalMirror;
pub use queue::{ActionQueue, PendingAction, QueuedAction};
