//! Advisory file locks for cross-process goal claiming.
//!
//! A lock is a JSON record created with `create_new` semantics, so exactly
//! one claimant wins regardless of how many processes race. Locks carry a
//! TTL; a record whose TTL has lapsed belongs to a crashed holder and may
//! be reclaimed.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::errors::{EngineError, Result};

/// On-disk lock record. Readable by any process for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl LockRecord {
    /// A record past its TTL belongs to a holder that stopped renewing,
    /// almost always a crashed process.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age.num_seconds() >= self.ttl_seconds as i64
    }
}

/// Manages locks for one holder under a shared lock directory.
pub struct FileLockManager {
    dir: PathBuf,
    holder: String,
    ttl: Duration,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>, holder: impl Into<String>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            holder: holder.into(),
            ttl,
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        // Resource ids may contain path separators; flatten them.
        let name: String = resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    /// Single acquisition attempt. `LockHeld` when another live holder has
    /// it; stale records are reclaimed first.
    pub fn try_acquire(&self, resource: &str) -> Result<()> {
        let path = self.lock_path(resource);

        if let Some(existing) = self.read_record(&path)? {
            if existing.is_stale(Utc::now()) {
                warn!(
                    resource,
                    holder = %existing.holder,
                    "reclaiming stale lock"
                );
                fs::remove_file(&path).ok();
            } else {
                return Err(EngineError::LockHeld {
                    resource: resource.to_string(),
                    holder: existing.holder,
                });
            }
        }

        let record = LockRecord {
            resource: resource.to_string(),
            holder: self.holder.clone(),
            acquired_at: Utc::now(),
            ttl_seconds: self.ttl.as_secs(),
        };
        // create_new is the atomicity point: the first writer wins, every
        // racer gets AlreadyExists.
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = self
                    .read_record(&path)?
                    .map(|r| r.holder)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(EngineError::LockHeld {
                    resource: resource.to_string(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
        debug!(resource, holder = %self.holder, "lock acquired");
        Ok(())
    }

    /// Acquire with a bounded wait, polling until `timeout` lapses.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_acquire(resource) {
                Ok(()) => return Ok(()),
                Err(EngineError::LockHeld { .. }) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(EngineError::LockTimeout {
                            resource: resource.to_string(),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release a lock this manager holds. Releasing someone else's lock is
    /// an error; releasing a missing lock is not.
    pub fn release(&self, resource: &str) -> Result<()> {
        let path = self.lock_path(resource);
        match self.read_record(&path)? {
            None => Ok(()),
            Some(record) if record.holder == self.holder => {
                fs::remove_file(&path)?;
                debug!(resource, "lock released");
                Ok(())
            }
            Some(record) => Err(EngineError::LockHeld {
                resource: resource.to_string(),
                holder: record.holder,
            }),
        }
    }

    /// Release every lock held by a given holder, for cleanup after a
    /// worker death.
    pub fn release_all_for(&self, holder: &str) -> Result<Vec<String>> {
        let mut released = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if let Some(record) = self.read_record(&path)? {
                if record.holder == holder {
                    fs::remove_file(&path)?;
                    released.push(record.resource);
                }
            }
        }
        Ok(released)
    }

    pub fn inspect(&self, resource: &str) -> Result<Option<LockRecord>> {
        self.read_record(&self.lock_path(resource))
    }

    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            // Deleted between the exists check and the read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // A torn write from a crashed holder is treated as stale.
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(_) => {
                warn!(path = %path.display(), "unparseable lock record; removing");
                fs::remove_file(path).ok();
                Ok(None)
            }
        }
    }
}
