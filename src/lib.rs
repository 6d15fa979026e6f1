//! tiervec: vector search over a two-tier layout. A small in-memory
//! tree of cluster centroids routes each query to a handful of
//! disk-resident posting lists, which are scanned exactly and merged
//! into a bounded result set. Inserts append, deletes tombstone,
//! compaction reclaims, and every save publishes a crash-consistent
//! generation.

pub mod config;
pub mod distance;
pub mod error;
pub mod head;
pub mod index;
pub mod meta;
pub mod persist;
pub mod posting;
pub mod query;
pub mod tombstone;

pub use config::IndexConfig;
pub use distance::Metric;
pub use error::{Result, VectorError};
pub use index::{CompactionReport, IndexState, SearchOptions, TierIndex};
pub use query::{QueryResult, ResultSlot, SENTINEL_VID};
