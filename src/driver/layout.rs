//! Shared on-disk layout for cache storage drivers
//!
//! Every driver uses the same directory tree under the cache root:
//!
//! ```text
//! cache_dir/
//!   cached/<id>        fully written, promoted artifacts
//!   incomplete/<id>    staging files under active write
//!   invalid/<id>       failed or aborted writes, kept for diagnosis
//!   queue/<id>         empty markers for images queued for caching
//! ```
//!
//! State transitions between areas are single `rename` calls, so a reader
//! never observes a partially written file in `cached/`.

use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Render a metadata timestamp with nanosecond precision so access-order
/// comparisons stay stable across rapid consecutive reads
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored metadata timestamp
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert a filesystem time to the metadata timestamp type
pub fn timestamp_from_system(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

/// Directory tree shared by all storage drivers
#[derive(Debug, Clone)]
pub struct CacheLayout {
    base: PathBuf,
    cached: PathBuf,
    incomplete: PathBuf,
    invalid: PathBuf,
    queue: PathBuf,
}

/// Reject identifiers that cannot be used as a single file name
pub fn validate_id(id: &str) -> CacheResult<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');

    if bad {
        return Err(CacheError::InvalidIdentifier { id: id.to_string() });
    }
    Ok(())
}

impl CacheLayout {
    /// Create the layout rooted at `base` and ensure all areas exist
    pub fn open(base: impl Into<PathBuf>) -> CacheResult<Self> {
        let base = base.into();
        let layout = Self {
            cached: base.join("cached"),
            incomplete: base.join("incomplete"),
            invalid: base.join("invalid"),
            queue: base.join("queue"),
            base,
        };

        for dir in [
            &layout.cached,
            &layout.incomplete,
            &layout.invalid,
            &layout.queue,
        ] {
            fs::create_dir_all(dir)
                .map_err(|e| CacheError::io(format!("creating cache directory {}", dir.display()), e))?;
        }

        Ok(layout)
    }

    /// The cache root directory
    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn cached_path(&self, id: &str) -> PathBuf {
        self.cached.join(id)
    }

    pub fn incomplete_path(&self, id: &str) -> PathBuf {
        self.incomplete.join(id)
    }

    pub fn invalid_path(&self, id: &str) -> PathBuf {
        self.invalid.join(id)
    }

    pub fn queue_path(&self, id: &str) -> PathBuf {
        self.queue.join(id)
    }

    /// Open a cached file for reading, mapping a missing file to `NotFound`
    pub fn open_cached(&self, id: &str) -> CacheResult<File> {
        File::open(self.cached_path(id)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CacheError::not_found(id)
            } else {
                CacheError::io(format!("opening cached image {}", id), e)
            }
        })
    }

    /// Size of one cached entry, `NotFound` if absent
    pub fn cached_size(&self, id: &str) -> CacheResult<u64> {
        match fs::metadata(self.cached_path(id)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::not_found(id)),
            Err(e) => Err(CacheError::io(format!("sizing cached image {}", id), e)),
        }
    }

    /// Total size across all cached entries
    pub fn cached_size_total(&self) -> CacheResult<u64> {
        let mut total = 0;
        for (_, meta) in self.list_area(&self.cached)? {
            total += meta.len();
        }
        Ok(total)
    }

    /// List `(file_name, metadata)` pairs in one area, skipping unreadable entries
    pub fn list_area(&self, area: &Path) -> CacheResult<Vec<(String, fs::Metadata)>> {
        let entries = fs::read_dir(area)
            .map_err(|e| CacheError::io(format!("listing {}", area.display()), e))?;

        let mut result = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable directory entry in {}: {}", area.display(), e);
                    continue;
                }
            };
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => {
                    warn!("Skipping non-UTF-8 entry in {}", area.display());
                    continue;
                }
            };
            match entry.metadata() {
                Ok(meta) if meta.is_file() => result.push((name, meta)),
                Ok(_) => {}
                Err(e) => warn!("Skipping unstattable entry {}: {}", name, e),
            }
        }
        Ok(result)
    }

    /// List the cached area
    pub fn list_cached(&self) -> CacheResult<Vec<(String, fs::Metadata)>> {
        self.list_area(&self.cached)
    }

    /// Queued identifiers, oldest request first
    pub fn list_queued(&self) -> CacheResult<Vec<String>> {
        let mut entries = self.list_area(&self.queue)?;
        entries.sort_by_key(|(name, meta)| {
            (meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), name.clone())
        });
        Ok(entries.into_iter().map(|(name, _)| name).collect())
    }

    /// Remove a file if it exists, returning whether it was present
    pub fn remove_if_exists(&self, path: &Path) -> CacheResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// Delete incomplete files older than `stall_time`, returning how many
    /// were reaped. A stalled write has no writer left to learn anything
    /// from, so the file is discarded rather than moved to `invalid/`.
    /// Per-entry failures are logged and skipped.
    pub fn reap_stalled(&self, stall_time: Duration) -> CacheResult<u64> {
        let now = SystemTime::now();
        let mut reaped = 0;

        for (name, meta) in self.list_area(&self.incomplete)? {
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);

            if age >= stall_time {
                match fs::remove_file(self.incomplete_path(&name)) {
                    Ok(()) => {
                        debug!("Reaped stalled incomplete file {} (age {:?})", name, age);
                        reaped += 1;
                    }
                    Err(e) => warn!("Failed to reap stalled file {}: {}", name, e),
                }
            }
        }

        Ok(reaped)
    }
}

/// A staging file under active write in `incomplete/`.
///
/// Exactly one of three things happens to it:
/// - [`promote`](Self::promote) renames it into `cached/`;
/// - [`invalidate`](Self::invalidate) renames it into `invalid/`;
/// - dropping it without either call invalidates it (best effort).
///
/// In every case the `incomplete/` entry is gone afterwards, so the staging
/// area never leaks abandoned handles.
#[derive(Debug)]
pub struct StagingFile {
    id: String,
    file: Option<File>,
    bytes: u64,
    incomplete: PathBuf,
    cached: PathBuf,
    invalid: PathBuf,
    finished: bool,
}

impl StagingFile {
    /// Create the staging file.
    ///
    /// Uses `create_new` so a concurrent writer for the same identifier
    /// fails with [`CacheError::AlreadyBeingCached`] instead of clobbering
    /// the other writer's bytes.
    pub fn create(layout: &CacheLayout, id: &str) -> CacheResult<Self> {
        validate_id(id)?;

        let incomplete = layout.incomplete_path(id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&incomplete)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    CacheError::AlreadyBeingCached { id: id.to_string() }
                } else {
                    CacheError::io(format!("creating staging file for {}", id), e)
                }
            })?;

        debug!("Started staging write for {}", id);
        Ok(Self {
            id: id.to_string(),
            file: Some(file),
            bytes: 0,
            incomplete,
            cached: layout.cached_path(id),
            invalid: layout.invalid_path(id),
            finished: false,
        })
    }

    /// The identifier being written
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    fn close_file(&mut self) -> CacheResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .map_err(|e| CacheError::io(format!("flushing staging file for {}", self.id), e))?;
        }
        Ok(())
    }

    /// Atomically move the finished file into the cached area and return
    /// its new path and size. On error the file ends up in `invalid/` via
    /// the drop path.
    pub fn promote(mut self) -> CacheResult<(PathBuf, u64)> {
        self.close_file()?;
        fs::rename(&self.incomplete, &self.cached)
            .map_err(|e| CacheError::io(format!("promoting image {}", self.id), e))?;
        self.finished = true;
        debug!("Promoted image {} ({} bytes)", self.id, self.bytes);
        Ok((self.cached.clone(), self.bytes))
    }

    /// Move the partial file into the invalid area for later diagnosis
    pub fn invalidate(mut self) -> CacheResult<PathBuf> {
        self.close_file()?;
        fs::rename(&self.incomplete, &self.invalid)
            .map_err(|e| CacheError::io(format!("invalidating image {}", self.id), e))?;
        self.finished = true;
        debug!("Invalidated partial write for {}", self.id);
        Ok(self.invalid.clone())
    }
}

impl Write for StagingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "staging file already finalized"))?;
        let n = file.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Last-resort rollback for abandoned writers.
        drop(self.file.take());
        if let Err(e) = fs::rename(&self.incomplete, &self.invalid) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to invalidate abandoned write for {}: {}", self.id, e);
            }
        } else {
            debug!("Abandoned write for {} moved to invalid area", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> (TempDir, CacheLayout) {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::open(dir.path()).unwrap();
        (dir, layout)
    }

    #[test]
    fn open_creates_all_areas() {
        let (dir, _) = layout();
        for area in ["cached", "incomplete", "invalid", "queue"] {
            assert!(dir.path().join(area).is_dir());
        }
    }

    #[test]
    fn rejects_bad_identifiers() {
        for id in ["", ".", "..", "a/b", "a\\b", "nul\0byte"] {
            assert!(validate_id(id).is_err(), "expected {:?} to be rejected", id);
        }
        assert!(validate_id("6bbe7cac-8b31-4d4c-8b1f").is_ok());
        assert!(validate_id("..leading-dots-are-fine").is_ok());
    }

    #[test]
    fn promote_moves_to_cached() {
        let (_dir, layout) = layout();
        let mut staging = StagingFile::create(&layout, "img").unwrap();
        staging.write_all(b"hello").unwrap();

        let (path, bytes) = staging.promote().unwrap();

        assert_eq!(bytes, 5);
        assert_eq!(path, layout.cached_path("img"));
        assert_eq!(fs::read(path).unwrap(), b"hello");
        assert!(!layout.incomplete_path("img").exists());
    }

    #[test]
    fn invalidate_moves_to_invalid() {
        let (_dir, layout) = layout();
        let mut staging = StagingFile::create(&layout, "img").unwrap();
        staging.write_all(b"partial").unwrap();

        staging.invalidate().unwrap();

        assert!(layout.invalid_path("img").exists());
        assert!(!layout.incomplete_path("img").exists());
        assert!(!layout.cached_path("img").exists());
    }

    #[test]
    fn drop_invalidates_abandoned_write() {
        let (_dir, layout) = layout();
        {
            let mut staging = StagingFile::create(&layout, "img").unwrap();
            staging.write_all(b"abandoned").unwrap();
        }

        assert!(layout.invalid_path("img").exists());
        assert!(!layout.incomplete_path("img").exists());
    }

    #[test]
    fn duplicate_writer_is_rejected() {
        let (_dir, layout) = layout();
        let _first = StagingFile::create(&layout, "img").unwrap();

        let err = StagingFile::create(&layout, "img").unwrap_err();
        assert!(matches!(err, CacheError::AlreadyBeingCached { .. }));
    }

    #[test]
    fn reap_stalled_respects_age() {
        let (_dir, layout) = layout();
        fs::write(layout.incomplete_path("old"), b"x").unwrap();
        fs::write(layout.incomplete_path("fresh"), b"y").unwrap();

        let past = SystemTime::now() - Duration::from_secs(600);
        filetime::set_file_mtime(
            layout.incomplete_path("old"),
            filetime::FileTime::from_system_time(past),
        )
        .unwrap();

        let reaped = layout.reap_stalled(Duration::from_secs(300)).unwrap();

        assert_eq!(reaped, 1);
        assert!(!layout.incomplete_path("old").exists());
        assert!(layout.incomplete_path("fresh").exists());
    }

    #[test]
    fn reap_stalled_zero_means_immediately() {
        let (_dir, layout) = layout();
        fs::write(layout.incomplete_path("any"), b"x").unwrap();

        let reaped = layout.reap_stalled(Duration::ZERO).unwrap();

        assert_eq!(reaped, 1);
        assert!(!layout.incomplete_path("any").exists());
    }

    #[test]
    fn queued_order_is_oldest_first() {
        let (_dir, layout) = layout();
        for (name, secs_ago) in [("newest", 10), ("oldest", 300), ("middle", 100)] {
            let path = layout.queue_path(name);
            fs::write(&path, b"").unwrap();
            let mtime = SystemTime::now() - Duration::from_secs(secs_ago);
            filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(mtime)).unwrap();
        }

        let queued = layout.list_queued().unwrap();
        assert_eq!(queued, ["oldest", "middle", "newest"]);
    }

    #[test]
    fn cached_size_total_sums_entries() {
        let (_dir, layout) = layout();
        fs::write(layout.cached_path("a"), vec![0u8; 100]).unwrap();
        fs::write(layout.cached_path("b"), vec![0u8; 250]).unwrap();

        assert_eq!(layout.cached_size_total().unwrap(), 350);
        assert_eq!(layout.cached_size("b").unwrap(), 250);
        assert!(layout.cached_size("missing").unwrap_err().is_not_found());
    }
}
