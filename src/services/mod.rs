//! Cache services
//!
//! The entry point a host application holds on to. It wires storage,
//! connectivity and the sync loops together and owns their lifecycle.

mod air_cache;

pub use air_cache::*;
