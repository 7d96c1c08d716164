//! Shared cache state
//!
//! Thread-safe owners of the resources every component touches: the
//! per-account storage handles and the online/offline flag.

pub mod connectivity;
pub mod storage_manager;

pub use connectivity::{Connectivity, DrainGuard};
pub use storage_manager::{AccountStorage, CacheStats, StorageHandle, StorageManager};
