//! Streaming tee over a backend byte-stream
//!
//! [`CachingIter`] pulls chunks from a backend producer, writes each one to
//! a staged cache file, and yields it onward unmodified, holding at most
//! one chunk in memory and never altering chunk boundaries. On clean
//! exhaustion with a matching checksum the staged file is promoted; on
//! backend failure, write failure, checksum mismatch, or abandonment it
//! lands in the invalid area.
//!
//! Data delivery is never held hostage to the caching outcome: every chunk
//! the backend produced before a failure has already been yielded by the
//! time the error surfaces.

use crate::cache::ImageCache;
use crate::driver::CacheWrite;
use crate::error::{BoxError, CacheError, CacheResult};
use sha2::{Digest, Sha256};
use std::io::Write;
use tracing::{debug, warn};

enum TeeState {
    /// No chunk pulled yet; the write scope is not open
    NotStarted,
    /// Chunks are being written to a staging file as they pass through
    Writing,
    /// Caching is impossible for this call; bytes flow through untouched
    Passthrough,
    /// Terminal: completed, failed, or already reported an error
    Done,
}

/// Lazy tee over a backend iterator of byte chunks.
///
/// Yields exactly the backend's chunks. Dropping the iterator before
/// exhaustion abandons the write: the partial file is moved to the invalid
/// area. Callers who want that rollback error surfaced should call
/// [`close`](Self::close) instead of dropping.
pub struct CachingIter<'a, I> {
    cache: &'a ImageCache,
    id: String,
    expected: Option<String>,
    backend: I,
    hasher: Sha256,
    writer: Option<Box<dyn CacheWrite>>,
    state: TeeState,
}

impl<'a, I> CachingIter<'a, I> {
    pub(crate) fn new(
        cache: &'a ImageCache,
        id: &str,
        checksum: Option<&str>,
        backend: I,
    ) -> Self {
        Self {
            cache,
            id: id.to_string(),
            expected: checksum.map(|c| c.to_lowercase()),
            backend,
            hasher: Sha256::new(),
            writer: None,
            state: TeeState::NotStarted,
        }
    }

    /// The identifier this iterator caches under
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Abandon the stream explicitly, surfacing the rollback error that a
    /// plain drop would only log
    pub fn close(mut self) -> CacheResult<()> {
        if let Some(writer) = self.writer.take() {
            debug!("Caching of {} closed before completion", self.id);
            self.cache
                .audit_log()
                .log("invalidated", serde_json::json!({"id": self.id, "reason": "closed"}));
            writer.invalidate()?;
        }
        self.state = TeeState::Done;
        Ok(())
    }

    /// Open the write scope on the first pull. Falls back to passthrough
    /// whenever caching is impossible so the byte stream keeps flowing.
    fn start(&mut self) {
        // The image stops being "queued" the moment caching begins.
        if let Err(e) = self.cache.driver().delete_queued_image(&self.id) {
            debug!("Failed to drop queue marker for {}: {}", self.id, e);
        }

        if !self.cache.driver().is_cacheable(&self.id) {
            debug!("Image {} not cacheable, passing stream through", self.id);
            self.state = TeeState::Passthrough;
            return;
        }

        match self.cache.driver().open_for_write(&self.id) {
            Ok(writer) => {
                self.writer = Some(writer);
                self.state = TeeState::Writing;
            }
            Err(CacheError::AlreadyBeingCached { .. }) => {
                debug!("Image {} already being cached elsewhere, passing through", self.id);
                self.state = TeeState::Passthrough;
            }
            Err(e) => {
                warn!("Cannot stage write for {}, passing through: {}", self.id, e);
                self.state = TeeState::Passthrough;
            }
        }
    }

    fn invalidate_writer(&mut self, reason: &str) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.invalidate() {
                warn!("Failed to invalidate partial write for {}: {}", self.id, e);
            }
            self.cache
                .audit_log()
                .log("invalidated", serde_json::json!({"id": self.id, "reason": reason}));
        }
    }

    /// Handle clean backend exhaustion: verify the checksum, then promote
    fn finish(&mut self) -> Option<CacheResult<Vec<u8>>> {
        let actual = hex::encode(self.hasher.clone().finalize());

        if let Some(expected) = &self.expected {
            if *expected != actual {
                let expected = expected.clone();
                match self.state {
                    TeeState::Writing => {
                        warn!(
                            "Checksum mismatch for {}: expected {}, got {}",
                            self.id, expected, actual
                        );
                        self.invalidate_writer("checksum_mismatch");
                        self.cache.audit_log().log(
                            "checksum_mismatch",
                            serde_json::json!({"id": self.id, "expected": expected, "actual": actual}),
                        );
                        return Some(Err(CacheError::ChecksumMismatch {
                            id: self.id.clone(),
                            expected,
                            actual,
                        }));
                    }
                    _ => {
                        // Nothing was written; the stream already went to the
                        // caller, so there is nothing to roll back or refuse.
                        warn!(
                            "Checksum mismatch on passthrough stream for {}: expected {}, got {}",
                            self.id, expected, actual
                        );
                        return None;
                    }
                }
            }
        }

        if let Some(writer) = self.writer.take() {
            match writer.commit() {
                Ok(bytes) => {
                    debug!("Cached image {} ({} bytes)", self.id, bytes);
                    self.cache
                        .audit_log()
                        .log("promoted", serde_json::json!({"id": self.id, "size": bytes}));
                }
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

impl<I> Iterator for CachingIter<'_, I>
where
    I: Iterator<Item = Result<Vec<u8>, BoxError>>,
{
    type Item = CacheResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, TeeState::Done) {
            return None;
        }
        if matches!(self.state, TeeState::NotStarted) {
            self.start();
        }

        match self.backend.next() {
            Some(Ok(chunk)) => {
                self.hasher.update(&chunk);

                if let Some(writer) = self.writer.as_mut() {
                    if let Err(e) = writer.write_all(&chunk) {
                        self.invalidate_writer("write_failure");
                        self.state = TeeState::Done;
                        return Some(Err(CacheError::io(
                            format!("writing staged chunk for {}", self.id),
                            e,
                        )));
                    }
                }

                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                debug!("Backend stream for {} failed mid-transfer", self.id);
                self.invalidate_writer("backend_failure");
                self.state = TeeState::Done;
                Some(Err(CacheError::backend(self.id.clone(), e)))
            }
            None => {
                let result = self.finish();
                self.state = TeeState::Done;
                result
            }
        }
    }
}

impl<I> Drop for CachingIter<'_, I> {
    fn drop(&mut self) {
        // Last-resort cleanup for callers who stop pulling mid-stream.
        if self.writer.is_some() {
            debug!("Caching of {} abandoned before completion", self.id);
            self.invalidate_writer("abandoned");
        }
    }
}
