//! Filesystem driver with metadata in an auxiliary SQLite catalog
//!
//! Artifact bytes live in the shared file layout; access times, hit counts,
//! and sizes live in `index.sqlite` next to it. The filesystem remains the
//! source of truth for which entries exist: catalog rows are reconciled
//! against the cached area on every scan, so a crash between a rename and a
//! catalog write heals itself instead of corrupting the cache.

use crate::driver::layout::{self, CacheLayout, StagingFile};
use crate::driver::{CacheWrite, CachedImage, StorageDriver};
use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Schema for the metadata catalog
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cached_images (
    image_id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    hits INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT NOT NULL,
    last_modified TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cached_images_last_accessed
    ON cached_images(last_accessed);
"#;

/// Storage driver backed by a SQLite metadata catalog
pub struct SqliteDriver {
    layout: CacheLayout,
    conn: Arc<Mutex<Connection>>,
}

fn lock_conn(conn: &Mutex<Connection>) -> CacheResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| CacheError::Internal("cache index lock poisoned".to_string()))
}

impl SqliteDriver {
    /// Open the driver rooted at `base`, creating the area directories and
    /// running catalog migrations
    pub fn open(base: impl AsRef<Path>) -> CacheResult<Self> {
        let layout = CacheLayout::open(base.as_ref())?;

        let conn = Connection::open(layout.base_dir().join("index.sqlite"))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            layout,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// All catalog rows keyed by identifier. Sizes are intentionally not
    /// read back: the filesystem is the source of truth for entry sizes.
    fn catalog_rows(&self) -> CacheResult<HashMap<String, CatalogRow>> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt =
            conn.prepare("SELECT image_id, hits, last_accessed, last_modified FROM cached_images")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                CatalogRow {
                    hits: row.get::<_, i64>(1)? as u64,
                    last_accessed: row.get::<_, String>(2)?,
                    last_modified: row.get::<_, String>(3)?,
                },
            ))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (id, data) = row?;
            map.insert(id, data);
        }
        Ok(map)
    }

    fn insert_row(
        conn: &Connection,
        id: &str,
        size: u64,
        hits: u64,
        last_accessed: DateTime<Utc>,
        last_modified: DateTime<Utc>,
    ) -> CacheResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO cached_images (image_id, size, hits, last_accessed, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                size as i64,
                hits as i64,
                layout::format_timestamp(last_accessed),
                layout::format_timestamp(last_modified),
            ],
        )?;
        Ok(())
    }

    fn delete_row(&self, id: &str) -> CacheResult<()> {
        let conn = lock_conn(&self.conn)?;
        conn.execute("DELETE FROM cached_images WHERE image_id = ?1", params![id])?;
        Ok(())
    }
}

struct CatalogRow {
    hits: u64,
    last_accessed: String,
    last_modified: String,
}

impl StorageDriver for SqliteDriver {
    fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn open_for_write(&self, id: &str) -> CacheResult<Box<dyn CacheWrite>> {
        let staging = StagingFile::create(&self.layout, id)?;
        Ok(Box::new(SqliteWriter {
            staging,
            conn: Arc::clone(&self.conn),
        }))
    }

    fn open_for_read(&self, id: &str) -> CacheResult<File> {
        let file = self.layout.open_cached(id)?;

        // Metadata bump is best effort: the bytes are already promoted and
        // readable, and a catalog hiccup must not block delivery.
        if let Err(e) = self.record_access(id) {
            warn!("Failed to record access for {}: {}", id, e);
        }

        Ok(file)
    }

    fn get_cached_images(&self) -> CacheResult<Vec<CachedImage>> {
        let files = self.layout.list_cached()?;
        let mut rows = self.catalog_rows()?;
        let mut images = Vec::with_capacity(files.len());

        for (id, meta) in files {
            let modified = meta
                .modified()
                .map(layout::timestamp_from_system)
                .unwrap_or_else(|_| Utc::now());

            let image = match rows.remove(&id) {
                Some(row) => CachedImage {
                    size: meta.len(),
                    hits: row.hits,
                    last_accessed: layout::parse_timestamp(&row.last_accessed)
                        .unwrap_or(modified),
                    last_modified: layout::parse_timestamp(&row.last_modified)
                        .unwrap_or(modified),
                    id,
                },
                None => {
                    // File present without a row: a write landed but the
                    // catalog insert was lost. Re-register from file state.
                    debug!("Re-registering untracked cached file {}", id);
                    let conn = lock_conn(&self.conn)?;
                    Self::insert_row(&conn, &id, meta.len(), 0, modified, modified)?;
                    CachedImage {
                        size: meta.len(),
                        hits: 0,
                        last_accessed: modified,
                        last_modified: modified,
                        id,
                    }
                }
            };
            images.push(image);
        }

        // Remaining rows have no backing file; drop them.
        for stale in rows.keys() {
            debug!("Purging stale catalog row for {}", stale);
            self.delete_row(stale)?;
        }

        images.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(images)
    }

    fn delete_cached_image(&self, id: &str) -> CacheResult<()> {
        self.layout
            .remove_if_exists(&self.layout.cached_path(id))?;
        self.delete_row(id)
    }
}

impl SqliteDriver {
    fn record_access(&self, id: &str) -> CacheResult<()> {
        let conn = lock_conn(&self.conn)?;
        let updated = conn.execute(
            "UPDATE cached_images SET hits = hits + 1, last_accessed = ?1 WHERE image_id = ?2",
            params![layout::format_timestamp(Utc::now()), id],
        )?;

        if updated == 0 {
            // Untracked file read before any scan re-registered it.
            let size = self.layout.cached_size(id)?;
            let now = Utc::now();
            Self::insert_row(&conn, id, size, 1, now, now)?;
        }
        Ok(())
    }
}

/// Scoped write handle that registers the catalog row on commit
struct SqliteWriter {
    staging: StagingFile,
    conn: Arc<Mutex<Connection>>,
}

impl Write for SqliteWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staging.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

impl CacheWrite for SqliteWriter {
    fn id(&self) -> &str {
        self.staging.id()
    }

    fn bytes_written(&self) -> u64 {
        self.staging.bytes_written()
    }

    fn commit(self: Box<Self>) -> CacheResult<u64> {
        let SqliteWriter { staging, conn } = *self;
        let id = staging.id().to_string();
        let size = staging.bytes_written();
        let now = Utc::now();

        // Row first, rename second: a row without a file is purged on the
        // next scan, whereas promoting before registering would widen the
        // untracked-file window to every commit.
        {
            let guard = lock_conn(&conn)?;
            SqliteDriver::insert_row(&guard, &id, size, 0, now, now)?;
        }

        match staging.promote() {
            Ok((_, bytes)) => Ok(bytes),
            Err(e) => {
                // Promotion failed; drop the speculative row.
                if let Ok(guard) = lock_conn(&conn) {
                    if let Err(del) =
                        guard.execute("DELETE FROM cached_images WHERE image_id = ?1", params![id])
                    {
                        warn!("Failed to drop catalog row for {}: {}", id, del);
                    }
                }
                Err(e)
            }
        }
    }

    fn invalidate(self: Box<Self>) -> CacheResult<()> {
        self.staging.invalidate()?;
        Ok(())
    }
}
