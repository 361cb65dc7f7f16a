//! Versioned response cache for offline support.
//!
//! This module provides the request-interception side of the offline layer:
//! - Installs a namespace holding every critical resource, or nothing at all
//! - Activates by deleting every namespace but the current one
//! - Serves navigations network-first with a cache and fallback-page escape hatch
//! - Serves sub-resource reads cache-first, refreshing entries in the background
//! - Never caches mutating requests

mod manager;
mod storage;
mod traits;

pub use manager::{namespace_name, CacheManager, InstallReport};
pub use storage::SqliteStorage;
pub use traits::{CacheResult, CacheSource, Network, Request, Response};
