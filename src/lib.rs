//! imagestash - Disk-Backed Artifact Cache
//!
//! A single-node, filesystem-backed cache for opaque byte artifacts with
//! staged writes, atomic promotion, checksum validation, size-bounded LRU
//! pruning, and stall-detection cleanup.

pub mod audit;
pub mod cache;
pub mod config;
pub mod driver;
pub mod error;

pub use cache::{CachingIter, ImageCache};
pub use config::CacheConfig;
pub use driver::{CachedImage, DriverKind, StorageDriver};
pub use error::{BoxError, CacheError, CacheResult};
