//! Storage driver abstraction
//!
//! Provides a trait for cache persistence that can be implemented by
//! different metadata backends. All drivers share the same on-disk file
//! layout ([`layout::CacheLayout`]); they differ in where per-entry
//! metadata (access times, hit counts) lives:
//!
//! - [`XattrDriver`]: extended attributes on the cached files themselves
//! - [`SqliteDriver`]: an auxiliary SQLite catalog next to the cache

pub mod layout;
pub mod sqlite;
pub mod xattr;

pub use self::sqlite::SqliteDriver;
pub use self::xattr::XattrDriver;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use self::layout::CacheLayout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::time::Duration;
use tracing::debug;

/// Which storage driver tracks entry metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Filesystem layout with metadata in extended attributes
    #[default]
    Xattr,
    /// Filesystem layout with metadata in an auxiliary SQLite catalog
    Sqlite,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xattr => write!(f, "xattr"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// One fully cached artifact as reported by a driver
#[derive(Debug, Clone, Serialize)]
pub struct CachedImage {
    /// Opaque identifier
    pub id: String,
    /// Size in bytes
    pub size: u64,
    /// Read-open count since caching
    pub hits: u64,
    /// Last successful read-open (or promotion time if never read)
    pub last_accessed: DateTime<Utc>,
    /// When the entry was promoted into the cached area
    pub last_modified: DateTime<Utc>,
}

/// Scoped handle for a staged cache write.
///
/// The handle is a `Write` sink backed by a file in the `incomplete/` area.
/// Calling [`commit`](Self::commit) promotes the file into `cached/` and
/// records its metadata; calling [`invalidate`](Self::invalidate) moves it
/// to `invalid/`. Dropping the handle without either call invalidates the
/// partial file on a best-effort basis; callers who need the rollback
/// error should invalidate explicitly.
pub trait CacheWrite: Write + Send {
    /// The identifier being written
    fn id(&self) -> &str;

    /// Bytes written so far
    fn bytes_written(&self) -> u64;

    /// Promote the staged file to the cached area, returning its size
    fn commit(self: Box<Self>) -> CacheResult<u64>;

    /// Move the staged file to the invalid area
    fn invalidate(self: Box<Self>) -> CacheResult<()>;
}

/// Abstract cache storage interface
///
/// State queries and bookkeeping that only touch the shared file layout
/// have default implementations; drivers implement the metadata-bearing
/// operations (`open_for_write`, `open_for_read`, `get_cached_images`).
pub trait StorageDriver: Send + Sync {
    /// The shared directory layout this driver persists into
    fn layout(&self) -> &CacheLayout;

    /// Whether the identifier has a fully written, promoted entry
    fn is_cached(&self, id: &str) -> bool {
        self.layout().cached_path(id).is_file()
    }

    /// Whether a staging write is currently in flight for the identifier
    fn is_being_cached(&self, id: &str) -> bool {
        self.layout().incomplete_path(id).is_file()
    }

    /// Whether a failed write for the identifier sits in the invalid area
    fn is_invalid(&self, id: &str) -> bool {
        self.layout().invalid_path(id).is_file()
    }

    /// Whether the identifier is queued for future caching
    fn is_queued(&self, id: &str) -> bool {
        self.layout().queue_path(id).is_file()
    }

    /// True unless the identifier is staging, already cached, or marked invalid
    fn is_cacheable(&self, id: &str) -> bool {
        !(self.is_cached(id) || self.is_being_cached(id) || self.is_invalid(id))
    }

    /// Begin a staged write for the identifier
    fn open_for_write(&self, id: &str) -> CacheResult<Box<dyn CacheWrite>>;

    /// Open a cached entry for reading, bumping its access metadata.
    /// Fails with [`CacheError::NotFound`] if the identifier is not cached.
    fn open_for_read(&self, id: &str) -> CacheResult<File>;

    /// Size of one cached entry in bytes
    fn get_image_size(&self, id: &str) -> CacheResult<u64> {
        self.layout().cached_size(id)
    }

    /// Total size across all cached entries
    fn get_cache_size(&self) -> CacheResult<u64> {
        self.layout().cached_size_total()
    }

    /// All cached entries with metadata, least recently accessed first
    fn get_cached_images(&self) -> CacheResult<Vec<CachedImage>>;

    /// Remove one cached entry. Removing an absent entry is a no-op.
    fn delete_cached_image(&self, id: &str) -> CacheResult<()> {
        self.layout()
            .remove_if_exists(&self.layout().cached_path(id))?;
        Ok(())
    }

    /// Remove every cached entry, returning how many were removed
    fn delete_all_cached_images(&self) -> CacheResult<u64> {
        let mut count = 0;
        for image in self.get_cached_images()? {
            self.delete_cached_image(&image.id)?;
            count += 1;
        }
        debug!("Deleted all {} cached images", count);
        Ok(count)
    }

    /// Administrative removal of one entry from the invalid area
    fn delete_invalid_file(&self, id: &str) -> CacheResult<()> {
        self.layout()
            .remove_if_exists(&self.layout().invalid_path(id))?;
        Ok(())
    }

    /// Mark the identifier as wanted for future caching.
    /// Returns `false` without side effects if it is already queued,
    /// cached, or being cached.
    fn queue_image(&self, id: &str) -> CacheResult<bool> {
        layout::validate_id(id)?;

        if self.is_cached(id) {
            debug!("Not queueing {}: already cached", id);
            return Ok(false);
        }
        if self.is_being_cached(id) {
            debug!("Not queueing {}: caching in progress", id);
            return Ok(false);
        }
        if self.is_queued(id) {
            debug!("Not queueing {}: already queued", id);
            return Ok(false);
        }

        let path = self.layout().queue_path(id);
        std::fs::write(&path, b"")
            .map_err(|e| CacheError::io(format!("queueing image {}", id), e))?;
        debug!("Queued image {}", id);
        Ok(true)
    }

    /// Queued identifiers, oldest request first
    fn get_queued_images(&self) -> CacheResult<Vec<String>> {
        self.layout().list_queued()
    }

    /// Remove one queue marker. Removing an absent marker is a no-op.
    fn delete_queued_image(&self, id: &str) -> CacheResult<()> {
        self.layout()
            .remove_if_exists(&self.layout().queue_path(id))?;
        Ok(())
    }

    /// Remove every queue marker, returning how many were removed
    fn delete_all_queued_images(&self) -> CacheResult<u64> {
        let mut count = 0;
        for id in self.get_queued_images()? {
            self.delete_queued_image(&id)?;
            count += 1;
        }
        Ok(count)
    }

    /// Delete incomplete files older than `stall_time`, returning how many
    /// were reaped
    fn clean(&self, stall_time: Duration) -> CacheResult<u64> {
        self.layout().reap_stalled(stall_time)
    }
}

/// Construct the storage driver selected by the configuration
pub fn open_driver(config: &CacheConfig) -> CacheResult<Box<dyn StorageDriver>> {
    let driver: Box<dyn StorageDriver> = match config.driver {
        DriverKind::Xattr => Box::new(XattrDriver::open(&config.cache_dir)?),
        DriverKind::Sqlite => Box::new(SqliteDriver::open(&config.cache_dir)?),
    };
    debug!(
        "Opened {} cache driver at {}",
        config.driver,
        config.cache_dir.display()
    );
    Ok(driver)
}
