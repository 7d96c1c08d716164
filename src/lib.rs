//! Air Cache - local-first cache and background sync
//!
//! Keeps mail, calendar and contact data for every connected account in a
//! local SQLite database so request handlers can answer without a network
//! round trip, keeps that data fresh with a periodic pull, and holds mutations
//! made while offline until they can be replayed.
//!
//! ## Module Organization
//!
//! - `adapters/`: SQLite pool, schema and the per-resource stores
//! - `backend/`: Remote service boundary consumed by the cache
//! - `config/`: Cache settings and paths
//! - `services/`: The [`AirCache`] root
//! - `state/`: Storage manager and online/offline state
//! - `sync/`: Sync loop, offline action replay and notifications
//! - `types/`: Cached records, queued actions and errors

pub mod adapters;
pub mod backend;
pub mod config;
pub mod services;
pub mod state;
pub mod sync;
pub mod types;

pub use backend::{RemoteError, RemoteService};
pub use config::{CacheConfig, CacheSettings};
pub use services::{AirCache, MaintenanceReport};
pub use state::{Connectivity, StorageManager};
pub use sync::{CacheEvent, LoopState, PassReport};
pub use types::action::{ActionOutcome, EmailAction, QueuedAction};
pub use types::error::{CacheError, Result};

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber for the host application.
///
/// `RUST_LOG` overrides the default filter. Does nothing if a global
/// subscriber is already set.
pub fn init_tracing() {
    // In debug builds, default to debug level for this crate
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("air_cache=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
