//! Sync engine
//!
//! The periodic pull of remote data into the account stores, the replay of
//! offline actions, and the notifications both emit.

pub mod action_queue;
pub mod engine;
pub mod events;

pub use action_queue::{DrainReport, ReplayResult};
pub use engine::{LoopState, PassReport, PullOutcome, SyncLoop, SyncLoopConfig};
pub use events::{CacheEvent, EventSink};
