//! Local cache of materialized tenant data directories
//!
//! ```text
//!   <cache.root>/
//!     .staging/<tenant>-<uuid>/   extraction in progress
//!     <tenant>/                   ready working copy
//! ```
//!
//! A tenant directory appears at its final path only through an atomic
//! rename, so readers never observe a partial extraction. All mutation for
//! one tenant (materialize, evict) runs under that tenant's keyed lock.

mod keyed;
mod manager;
mod reclaimer;

pub use keyed::{KeyedGuard, KeyedLocks};
pub use manager::{CacheLease, CacheLimits, CacheManager, CacheState, CacheStats};
pub use reclaimer::{start_reclaimer, ReclaimReport};
