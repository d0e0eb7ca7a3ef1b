//! Per-project entity caches kept in memory for the lifetime of the process.
//!
//! This module provides:
//! - One independently locked store per entity family (`CacheKind`)
//! - A fixed registry pairing each store with its upstream fetcher
//! - Bootstrap of every store from the project listing
//! - Time-based refresh of projects upstream reports as changed
//! - Targeted update/removal after a confirmed upstream mutation

mod clock;
mod layer;
mod registry;
mod storage;
mod traits;

pub use clock::RefreshClock;
pub use layer::{CacheOrchestrator, RefreshOutcome};
pub use registry::CacheRegistry;
pub use traits::{CacheKind, EntityFetcher, ProjectId, ProjectLister};
