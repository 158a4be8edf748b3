//! Filesystem driver with metadata in extended attributes
//!
//! Access times and hit counts live in `user.*` extended attributes on the
//! cached files themselves, so the cache directory is fully self-describing
//! and survives being copied between hosts with xattr-aware tools.
//!
//! On filesystems without user xattr support the driver degrades: metadata
//! writes are dropped and reads fall back to file modification times, which
//! turns LRU pruning into oldest-first pruning but never breaks correctness.

use crate::driver::layout::{self, CacheLayout, StagingFile};
use crate::driver::{CacheWrite, CachedImage, StorageDriver};
use crate::error::CacheResult;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

const ATTR_LAST_ACCESSED: &str = "user.imagestash.last_accessed";
const ATTR_HITS: &str = "user.imagestash.hits";

/// Storage driver backed by extended attributes
pub struct XattrDriver {
    layout: CacheLayout,
}

impl XattrDriver {
    /// Open the driver rooted at `base`, creating the area directories
    pub fn open(base: impl AsRef<Path>) -> CacheResult<Self> {
        Ok(Self {
            layout: CacheLayout::open(base.as_ref())?,
        })
    }
}

/// Read one attribute as a UTF-8 string, `None` when absent or unreadable
fn read_attr(path: &Path, name: &str) -> Option<String> {
    match xattr::get(path, name) {
        Ok(Some(raw)) => String::from_utf8(raw).ok(),
        Ok(None) => None,
        Err(e) => {
            debug!("Failed to read {} from {}: {}", name, path.display(), e);
            None
        }
    }
}

/// Write one attribute, dropping the value on unsupported filesystems
fn write_attr(path: &Path, name: &str, value: &str) {
    if let Err(e) = xattr::set(path, name, value.as_bytes()) {
        debug!("Failed to set {} on {}: {}", name, path.display(), e);
    }
}

fn read_last_accessed(path: &Path, fallback: DateTime<Utc>) -> DateTime<Utc> {
    read_attr(path, ATTR_LAST_ACCESSED)
        .and_then(|s| layout::parse_timestamp(&s))
        .unwrap_or(fallback)
}

fn read_hits(path: &Path) -> u64 {
    read_attr(path, ATTR_HITS)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

impl StorageDriver for XattrDriver {
    fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn open_for_write(&self, id: &str) -> CacheResult<Box<dyn CacheWrite>> {
        let staging = StagingFile::create(&self.layout, id)?;
        Ok(Box::new(XattrWriter { staging }))
    }

    fn open_for_read(&self, id: &str) -> CacheResult<File> {
        let file = self.layout.open_cached(id)?;

        let path = self.layout.cached_path(id);
        let hits = read_hits(&path);
        write_attr(&path, ATTR_HITS, &(hits + 1).to_string());
        write_attr(
            &path,
            ATTR_LAST_ACCESSED,
            &layout::format_timestamp(Utc::now()),
        );

        Ok(file)
    }

    fn get_cached_images(&self) -> CacheResult<Vec<CachedImage>> {
        let mut images = Vec::new();

        for (id, meta) in self.layout.list_cached()? {
            let path = self.layout.cached_path(&id);
            let modified = meta
                .modified()
                .map(layout::timestamp_from_system)
                .unwrap_or_else(|_| Utc::now());

            images.push(CachedImage {
                last_accessed: read_last_accessed(&path, modified),
                hits: read_hits(&path),
                size: meta.len(),
                last_modified: modified,
                id,
            });
        }

        images.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(images)
    }
}

/// Scoped write handle that stamps initial metadata on commit
struct XattrWriter {
    staging: StagingFile,
}

impl Write for XattrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staging.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

impl CacheWrite for XattrWriter {
    fn id(&self) -> &str {
        self.staging.id()
    }

    fn bytes_written(&self) -> u64 {
        self.staging.bytes_written()
    }

    fn commit(self: Box<Self>) -> CacheResult<u64> {
        let (path, bytes) = self.staging.promote()?;

        write_attr(&path, ATTR_HITS, "0");
        write_attr(
            &path,
            ATTR_LAST_ACCESSED,
            &layout::format_timestamp(Utc::now()),
        );

        Ok(bytes)
    }

    fn invalidate(self: Box<Self>) -> CacheResult<()> {
        self.staging.invalidate()?;
        Ok(())
    }
}
