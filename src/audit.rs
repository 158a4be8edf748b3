//! Audit journal for cache lifecycle events
//!
//! Writes JSON lines to `<cache_dir>/audit.log` when enabled. Records
//! promotions, invalidations, evictions, and stall sweeps so operators can
//! reconstruct why an entry appeared or disappeared.

use crate::config::CacheConfig;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.audit_log,
            path: config.cache_dir.join("audit.log"),
        }
    }

    /// Log an audit event as a JSON line
    ///
    /// Silently drops events on IO failure. Audit logging must never
    /// block or fail the primary cache workflow.
    pub fn log(&self, event: &str, data: serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line) {
            warn!("Failed to write audit log: {}", e);
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
