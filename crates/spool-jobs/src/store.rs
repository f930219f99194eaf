//! Durable job records and the per-worker directory store.
//!
//! Each worker owns one location directory. A job is a directory named by its
//! id holding the serialized arguments, a schedule file with the next eligible
//! time, a `retries/` directory of empty markers, and, while an attempt or a
//! cancel owns it, a `claim` marker:
//!
//! ```text
//! worker-0/
//!   .staging/                 new containers are built here, then renamed in
//!   0193b7c2-.../
//!     arguments.json
//!     schedule.json
//!     retries/<uuid>
//!     claim
//! ```
//!
//! Publication and deletion are single renames, so a listing never observes a
//! half-written or half-deleted job. Entries that fail to parse are skipped.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use spool_core::defaults::{ARGUMENTS_FILE, CLAIM_FILE, RETRIES_DIR, SCHEDULE_FILE, STAGING_DIR};
use spool_core::{Error, JobArguments, JobSnapshot, Result};

use crate::backoff::BackoffStrategy;

/// Upper bound on a single reschedule.
const MAX_RESCHEDULE_DAYS: i64 = 36_500;

/// Persisted shape of `schedule.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Schedule {
    next_eligible_at: DateTime<Utc>,
}

/// One unit of work as read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    id: String,
    arguments: JobArguments,
    next_eligible_at: DateTime<Utc>,
    retry_count: u32,
}

impl JobRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn arguments(&self) -> &JobArguments {
        &self.arguments
    }

    pub fn next_eligible_at(&self) -> DateTime<Utc> {
        self.next_eligible_at
    }

    /// Number of retry markers at the time the record was read.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// A record is eligible once its due time has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::new(self.id.clone())
    }
}

/// Pick the record to attempt next: eligible, not in `skip`, earliest due
/// time first, ties broken by id.
pub fn select_next<'a>(
    records: &'a [JobRecord],
    now: DateTime<Utc>,
    skip: &HashSet<String>,
) -> Option<&'a JobRecord> {
    records
        .iter()
        .filter(|r| r.is_eligible(now) && !skip.contains(&r.id))
        .min_by(|a, b| {
            a.next_eligible_at
                .cmp(&b.next_eligible_at)
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Directory-backed record store for a single worker location.
#[derive(Debug, Clone)]
pub struct JobStore {
    location: PathBuf,
    staging: PathBuf,
}

impl JobStore {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        let location = location.into();
        let staging = location.join(STAGING_DIR);
        Self { location, staging }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    fn job_dir(&self, id: &str) -> PathBuf {
        self.location.join(id)
    }

    /// Create the location and its staging area.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.staging).await?;
        Ok(())
    }

    /// Clear leftovers of a previous process: claim markers (no attempt can be
    /// in flight before the worker starts) and abandoned staging entries.
    ///
    /// Returns the number of entries cleaned up.
    pub async fn recover(&self) -> Result<usize> {
        let mut cleaned = 0;

        for name in self.job_names().await? {
            match fs::remove_file(self.job_dir(&name).join(CLAIM_FILE)).await {
                Ok(()) => {
                    debug!(job_id = %name, "store: released stale claim");
                    cleaned += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(job_id = %name, error = %e, "store: failed to release stale claim"),
            }
        }

        let mut entries = fs::read_dir(&self.staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let removed = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => cleaned += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "store: failed to clear staging entry"),
            }
        }

        Ok(cleaned)
    }

    /// Write a new record and publish it under `id`.
    ///
    /// The container is assembled in the staging area and moved into the
    /// location with one rename.
    pub async fn create(&self, id: &str, arguments: &JobArguments) -> Result<JobRecord> {
        let now = Utc::now();
        let staged = self.staging.join(id);
        fs::create_dir_all(staged.join(RETRIES_DIR)).await?;

        let payload = serde_json::to_vec(arguments)?;
        write_synced(&staged.join(ARGUMENTS_FILE), &payload).await?;

        let schedule = serde_json::to_vec(&Schedule {
            next_eligible_at: now,
        })?;
        write_synced(&staged.join(SCHEDULE_FILE), &schedule).await?;

        if let Err(e) = fs::rename(&staged, self.job_dir(id)).await {
            warn!(job_id = %id, error = %e, "store: publish rename failed");
            let _ = fs::remove_dir_all(&staged).await;
            return Err(e.into());
        }

        trace!(job_id = %id, "store: record published");
        Ok(JobRecord {
            id: id.to_string(),
            arguments: arguments.clone(),
            next_eligible_at: now,
            retry_count: 0,
        })
    }

    /// Read every parsable record in the location.
    ///
    /// Only a failure to read the location itself is an error.
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for name in self.job_names().await? {
            if let Some(record) = self.load(&name).await {
                records.push(record);
            }
        }
        trace!(location = %self.location.display(), record_count = records.len(), "store: listed");
        Ok(records)
    }

    /// Read a single record, `None` if it is missing or damaged.
    pub async fn load(&self, id: &str) -> Option<JobRecord> {
        let dir = self.job_dir(id);

        let arguments = match read_json::<JobArguments>(&dir.join(ARGUMENTS_FILE)).await {
            Ok(arguments) => arguments,
            Err(e) => {
                debug!(job_id = %id, error = %e, "store: skipping unreadable payload");
                return None;
            }
        };
        let schedule = match read_json::<Schedule>(&dir.join(SCHEDULE_FILE)).await {
            Ok(schedule) => schedule,
            Err(e) => {
                debug!(job_id = %id, error = %e, "store: skipping unreadable schedule");
                return None;
            }
        };
        let retry_count = match self.retry_count(id).await {
            Ok(n) => n,
            Err(e) => {
                debug!(job_id = %id, error = %e, "store: skipping unreadable retry markers");
                return None;
            }
        };

        Some(JobRecord {
            id: id.to_string(),
            arguments,
            next_eligible_at: schedule.next_eligible_at,
            retry_count,
        })
    }

    /// Number of job containers in the location, parsable or not.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.job_names().await?.len())
    }

    /// Count of persisted retry markers for a job.
    pub async fn retry_count(&self, id: &str) -> Result<u32> {
        let mut entries = match fs::read_dir(self.job_dir(id).join(RETRIES_DIR)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut count = 0u32;
        while entries.next_entry().await?.is_some() {
            count = count.saturating_add(1);
        }
        Ok(count)
    }

    /// Record one more failed attempt and push the due time out by
    /// `backoff.delay(new_retry_count)`.
    ///
    /// The marker name is a fresh UUID, so concurrent or repeated increments
    /// never collapse into one marker. Returns `None` if the record is gone;
    /// its container is never recreated.
    pub async fn increment_retry(
        &self,
        id: &str,
        backoff: &dyn BackoffStrategy,
    ) -> Result<Option<JobRecord>> {
        let dir = self.job_dir(id);
        if !self.add_retry_marker(&dir).await? {
            trace!(job_id = %id, "store: reschedule of missing record");
            return Ok(None);
        }

        let retry_count = self.retry_count(id).await?;
        let now = Utc::now();
        let delay = chrono::Duration::from_std(backoff.delay(retry_count))
            .unwrap_or_else(|_| chrono::Duration::days(MAX_RESCHEDULE_DAYS))
            .min(chrono::Duration::days(MAX_RESCHEDULE_DAYS));
        let next_eligible_at = now.checked_add_signed(delay).unwrap_or(now);

        let schedule = serde_json::to_vec(&Schedule { next_eligible_at })?;
        let tmp = dir.join(format!(".{SCHEDULE_FILE}.{}", Uuid::new_v4()));
        match write_synced(&tmp, &schedule).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        }
        if let Err(e) = fs::rename(&tmp, dir.join(SCHEDULE_FILE)).await {
            let _ = fs::remove_file(&tmp).await;
            if e.kind() == ErrorKind::NotFound {
                return Ok(None);
            }
            return Err(e.into());
        }

        debug!(job_id = %id, retry_count, %next_eligible_at, "store: rescheduled");
        Ok(self.load(id).await)
    }

    /// Drop one empty marker into `<dir>/retries`. `false` if `dir` is gone.
    async fn add_retry_marker(&self, dir: &Path) -> Result<bool> {
        let retries = dir.join(RETRIES_DIR);
        let marker = retries.join(Uuid::new_v4().to_string());

        match fs::File::create(&marker).await {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Only `retries/` may be missing; `create_dir` never creates `dir`.
        match fs::create_dir(&retries).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        match fs::File::create(&marker).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a record with all its markers. A record that is already gone is
    /// not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let trash = self.staging.join(format!("trash-{}", Uuid::new_v4()));
        match fs::rename(self.job_dir(id), &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(job_id = %id, "store: delete of missing record");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // The record is already invisible; leftovers are swept by `recover`.
        if let Err(e) = fs::remove_dir_all(&trash).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(job_id = %id, error = %e, "store: failed to purge deleted record");
            }
        }
        Ok(())
    }

    /// Atomically take ownership of a record.
    ///
    /// Returns `false` if someone else holds the claim or the record is gone.
    pub async fn claim(&self, id: &str) -> Result<bool> {
        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.job_dir(id).join(CLAIM_FILE))
            .await;
        match opened {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a claim taken with [`JobStore::claim`].
    pub async fn release(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.job_dir(id).join(CLAIM_FILE)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the job containers in the location (hidden entries excluded).
    pub async fn job_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.location).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => names.push(name),
                _ => {}
            }
        }
        Ok(names)
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

fn is_not_found(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.kind() == ErrorKind::NotFound)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
