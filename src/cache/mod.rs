//! Cache controller
//!
//! [`ImageCache`] is the policy layer over a storage driver: read-through
//! population via the caching iterator, queueing, LRU pruning, and stall
//! cleanup. Construct it explicitly from a [`CacheConfig`]; there is no
//! process-wide singleton.

pub mod iter;

pub use iter::CachingIter;

use crate::audit::AuditLog;
use crate::config::CacheConfig;
use crate::driver::{self, CacheWrite, CachedImage, StorageDriver};
use crate::error::{BoxError, CacheError, CacheResult};
use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunk size for [`ImageCache::cache_image_file`] copies
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Disk-backed artifact cache with staged writes and LRU pruning
pub struct ImageCache {
    config: CacheConfig,
    driver: Box<dyn StorageDriver>,
    audit: AuditLog,
}

impl ImageCache {
    /// Open the cache described by the configuration, creating the on-disk
    /// areas and the selected driver's metadata store
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        let driver = driver::open_driver(&config)?;
        let audit = AuditLog::new(&config);
        Ok(Self {
            config,
            driver,
            audit,
        })
    }

    /// The configuration this cache was opened with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn driver(&self) -> &dyn StorageDriver {
        self.driver.as_ref()
    }

    pub(crate) fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Whether the identifier has a fully cached entry
    pub fn is_cached(&self, id: &str) -> bool {
        self.driver.is_cached(id)
    }

    /// Whether the identifier is queued for future caching
    pub fn is_queued(&self, id: &str) -> bool {
        self.driver.is_queued(id)
    }

    /// Mark the identifier as wanted for future caching.
    /// Returns `Ok(false)` if it is already queued, cached, or in flight.
    pub fn queue_image(&self, id: &str) -> CacheResult<bool> {
        self.driver.queue_image(id)
    }

    /// Queued identifiers, oldest request first
    pub fn get_queued_images(&self) -> CacheResult<Vec<String>> {
        self.driver.get_queued_images()
    }

    /// Remove one queue marker
    pub fn delete_queued_image(&self, id: &str) -> CacheResult<()> {
        self.driver.delete_queued_image(id)
    }

    /// Copy a source stream into the cache in fixed-size chunks.
    ///
    /// Returns `Ok(false)` without reading the source when the identifier
    /// is not cacheable (already cached, in flight, or marked invalid).
    pub fn cache_image_file(&self, id: &str, mut source: impl Read) -> CacheResult<bool> {
        if !self.driver.is_cacheable(id) {
            debug!("Not caching {}: not cacheable", id);
            return Ok(false);
        }

        let mut writer = match self.driver.open_for_write(id) {
            Ok(w) => w,
            Err(CacheError::AlreadyBeingCached { .. }) => {
                debug!("Not caching {}: lost creation race", id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.driver.delete_queued_image(id)?;

        let mut buf = vec![0u8; WRITE_CHUNK_SIZE];
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    self.rollback(writer, "source_read_failure");
                    return Err(CacheError::io(format!("reading source stream for {}", id), e));
                }
            };
            if let Err(e) = writer.write_all(&buf[..n]) {
                self.rollback(writer, "write_failure");
                return Err(CacheError::io(format!("writing staged chunk for {}", id), e));
            }
        }

        let bytes = writer.commit()?;
        info!("Cached image {} ({} bytes)", id, bytes);
        self.audit
            .log("promoted", serde_json::json!({"id": id, "size": bytes}));
        Ok(true)
    }

    fn rollback(&self, writer: Box<dyn CacheWrite>, reason: &str) {
        let id = writer.id().to_string();
        if let Err(e) = writer.invalidate() {
            warn!("Failed to invalidate partial write for {}: {}", id, e);
        }
        self.audit
            .log("invalidated", serde_json::json!({"id": id, "reason": reason}));
    }

    /// Tee a backend byte-stream into the cache while yielding it onward.
    ///
    /// The returned iterator is lazy, finite, and not restartable; dropping
    /// it before exhaustion abandons the staged write. `checksum` is an
    /// optional lowercase hex SHA-256 digest to validate on completion.
    pub fn get_caching_iter<'a, I>(
        &'a self,
        id: &str,
        checksum: Option<&str>,
        backend: I,
    ) -> CachingIter<'a, I>
    where
        I: Iterator<Item = Result<Vec<u8>, BoxError>>,
    {
        CachingIter::new(self, id, checksum, backend)
    }

    /// Open a cached entry for reading, bumping its access metadata
    pub fn open_for_read(&self, id: &str) -> CacheResult<File> {
        self.driver.open_for_read(id)
    }

    /// Size of one cached entry in bytes
    pub fn get_image_size(&self, id: &str) -> CacheResult<u64> {
        self.driver.get_image_size(id)
    }

    /// Total size across all cached entries
    pub fn get_cache_size(&self) -> CacheResult<u64> {
        self.driver.get_cache_size()
    }

    /// All cached entries with metadata, least recently accessed first
    pub fn get_cached_images(&self) -> CacheResult<Vec<CachedImage>> {
        self.driver.get_cached_images()
    }

    /// Remove one cached entry
    pub fn delete_cached_image(&self, id: &str) -> CacheResult<()> {
        self.driver.delete_cached_image(id)
    }

    /// Remove every cached entry, returning how many were removed
    pub fn delete_all_cached_images(&self) -> CacheResult<u64> {
        self.driver.delete_all_cached_images()
    }

    /// Evict least-recently-accessed entries until the total size fits the
    /// configured maximum. Returns the number of bytes freed.
    ///
    /// A maximum of zero is the "cache nothing" policy: every entry is
    /// evicted and an already-empty cache is not an error.
    pub fn prune(&self) -> CacheResult<u64> {
        let max_size = self.config.max_size;
        let mut current = self.driver.get_cache_size()?;
        if current <= max_size {
            debug!("Cache size {} within budget {}, nothing to prune", current, max_size);
            return Ok(0);
        }

        let mut freed = 0;
        for image in self.driver.get_cached_images()? {
            if current <= max_size {
                break;
            }
            self.driver.delete_cached_image(&image.id)?;
            debug!("Pruned {} ({} bytes)", image.id, image.size);
            self.audit.log(
                "evicted",
                serde_json::json!({"id": image.id, "size": image.size}),
            );
            current = current.saturating_sub(image.size);
            freed += image.size;
        }

        info!("Pruned {} bytes, cache size now {}", freed, current);
        Ok(freed)
    }

    /// Delete incomplete files whose writer appears to have died.
    ///
    /// `stall_time` defaults to the configured threshold; files older than
    /// it are discarded outright. Returns how many files were reaped.
    pub fn clean(&self, stall_time: Option<Duration>) -> CacheResult<u64> {
        let stall_time = stall_time.unwrap_or_else(|| self.config.stall_time());
        let reaped = self.driver.clean(stall_time)?;
        if reaped > 0 {
            info!("Reaped {} stalled incomplete files", reaped);
            self.audit
                .log("cleaned", serde_json::json!({"reaped": reaped}));
        }
        Ok(reaped)
    }
}
