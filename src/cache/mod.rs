//! Preview cache
//!
//! Content-addressed (by source URL) store of transcoded clips, plus the
//! sweeper that keeps it within its size budget.

pub mod key;
pub mod store;
pub mod sweeper;

pub use key::CacheKey;
pub use store::{ArtifactStore, CacheStore};
pub use sweeper::{spawn_sweeper, sweep, CapacityPolicy};
