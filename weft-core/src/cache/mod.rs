//! Bounded caches backing the scanner and the build pipeline.
//!
//! Both caches are content-addressed: a key change is the only way an entry
//! can change, so a hit never needs revalidation. Storage IO failures are
//! downgraded to misses and logged; the pipeline never stalls on the cache.

pub mod artifacts;
pub mod metadata;

pub use artifacts::{ArtifactCache, artifact_hash};
pub use metadata::{CacheKey, CacheStats, MetadataCache, MetadataCacheConfig};
