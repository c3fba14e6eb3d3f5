//! Atomic JSON-file persistence for one bot namespace.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::types::{Job, Schedule};

/// Store schema version stamped into every snapshot envelope.
pub const STORE_VERSION: u32 = 1;

const STORE_FILE: &str = "jobs.json";

/// On-disk snapshot envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub version: u32,
    pub updated_at_ms: i64,
    pub jobs: Vec<Job>,
}

/// Job store at `<root>/<bot_name>/jobs.json`. Writes go through a
/// temp file and an atomic rename; a new snapshot fully replaces the
/// previous one.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(root: &Path, bot_name: &str) -> Self {
        Self {
            path: root.join(bot_name).join(STORE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all readable jobs.
    ///
    /// Fail-open on purpose: a missing or corrupt store yields an empty
    /// set, and individual records that fail to decode or validate are
    /// skipped with a warning. The process never refuses to start over
    /// bad persisted state.
    pub async fn load(&self) -> Vec<Job> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), "cannot read job store: {e}");
                return Vec::new();
            }
        };

        let raw: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), "job store is corrupt, starting empty: {e}");
                return Vec::new();
            }
        };

        let Some(entries) = raw.get("jobs").and_then(Value::as_array) else {
            warn!(path = %self.path.display(), "job store has no jobs array, starting empty");
            return Vec::new();
        };

        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let job = match serde_json::from_value::<Job>(entry.clone()) {
                Ok(job) => job,
                Err(e) => {
                    warn!("skipping unreadable job record: {e}");
                    continue;
                }
            };
            if let Some(reason) = record_defect(&job) {
                warn!(job_id = %job.id, "skipping invalid job record: {reason}");
                continue;
            }
            jobs.push(job);
        }

        debug!(count = jobs.len(), path = %self.path.display(), "job store loaded");
        jobs
    }

    /// Write a full snapshot: serialize, write `<path>.tmp`, then rename
    /// over the real path. A rename that trips over a stale destination
    /// removes it and retries exactly once before giving up.
    pub async fn write(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;

        if let Err(first) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&self.path).await;
            tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
                SchedulerError::Store(format!(
                    "cannot replace {}: {e} (first attempt: {first})",
                    self.path.display()
                ))
            })?;
        }
        Ok(())
    }
}

/// Validation applied to loaded records; decode success is not enough.
fn record_defect(job: &Job) -> Option<String> {
    if job.id.is_empty() {
        return Some("empty id".to_string());
    }
    if job.prompt.trim().is_empty() {
        return Some("empty prompt".to_string());
    }
    match &job.schedule {
        Schedule::At { at_ms } if *at_ms <= 0 => Some(format!("non-positive atMs {at_ms}")),
        Schedule::Every { every_ms, .. } if *every_ms < 1000 => {
            Some(format!("everyMs {every_ms} below 1000"))
        }
        Schedule::Cron { expr, .. } if expr.trim().is_empty() => {
            Some("empty cron expression".to_string())
        }
        _ => None,
    }
}
