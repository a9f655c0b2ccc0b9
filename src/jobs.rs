//! Durable job history.
//!
//! Every job lives in one [`JobStore`] guarded by a single mutex; the whole
//! history is rewritten (tmp file + rename) after each mutation so the file on
//! disk always matches the last completed operation. Worker threads only hold
//! a job id and go through the store for every change.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::write_atomic;
use crate::request::DownloadRequest;

pub const DEFAULT_LABEL: &str = "Radarr Download";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub metadata: Vec<String>,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub request: DownloadRequest,
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

/// Read-only view handed to callers. The stored request is never exposed and
/// logs are only included on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub label: String,
    pub subtitle: String,
    pub status: JobStatus,
    pub progress: f64,
    pub metadata: Vec<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
}

impl JobSnapshot {
    fn of(record: &JobRecord, include_logs: bool) -> Self {
        Self {
            id: record.id.clone(),
            label: record.label.clone(),
            subtitle: record.subtitle.clone(),
            status: record.status,
            progress: record.progress,
            metadata: record.metadata.clone(),
            message: record.message.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
            logs: include_logs.then(|| record.logs.clone()),
        }
    }
}

/// Fields supplied when a job is first recorded.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub id: String,
    pub label: String,
    pub subtitle: String,
    pub metadata: Vec<String>,
    pub logs: Vec<String>,
    pub request: DownloadRequest,
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub label: Option<String>,
    pub subtitle: Option<String>,
    pub metadata: Option<Vec<String>>,
    pub message: Option<String>,
    pub request: Option<DownloadRequest>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_items: usize,
    pub max_logs: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_logs: 200,
        }
    }
}

pub struct JobStore {
    path: PathBuf,
    limits: StoreLimits,
    records: Mutex<Vec<JobRecord>>,
}

impl JobStore {
    /// Loads the history at `path`. A missing file starts an empty history;
    /// an unreadable one is reported and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>, limits: StoreLimits) -> Self {
        let path = path.into();
        let mut records = match load_records(&path) {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %path.display(), "failed to load job history: {err:#}");
                Vec::new()
            }
        };
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limits.max_items);
        Self {
            path,
            limits,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self, job: NewJob) -> Result<JobSnapshot> {
        if job.id.trim().is_empty() {
            bail!("job identifier is required");
        }
        let now = Utc::now();
        let mut logs = job.logs;
        trim_logs(&mut logs, self.limits.max_logs);
        let record = JobRecord {
            id: job.id,
            label: if job.label.trim().is_empty() {
                default_label()
            } else {
                job.label
            },
            subtitle: job.subtitle,
            status: JobStatus::Queued,
            progress: 0.0,
            metadata: job.metadata,
            message: String::new(),
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            logs,
            request: job.request,
        };

        let mut records = self.records.lock();
        if records.iter().any(|existing| existing.id == record.id) {
            bail!("job {} already exists", record.id);
        }
        let snapshot = JobSnapshot::of(&record, true);
        records.insert(0, record);
        records.truncate(self.limits.max_items);
        self.persist(&records);
        Ok(snapshot)
    }

    pub fn get(&self, id: &str, include_logs: bool) -> Option<JobSnapshot> {
        let records = self.records.lock();
        records
            .iter()
            .find(|record| record.id == id)
            .map(|record| JobSnapshot::of(record, include_logs))
    }

    /// The validated request a job was created from.
    pub fn request(&self, id: &str) -> Option<DownloadRequest> {
        let records = self.records.lock();
        records
            .iter()
            .find(|record| record.id == id)
            .map(|record| record.request.clone())
    }

    /// All retained jobs, newest first.
    pub fn list(&self, include_logs: bool) -> Vec<JobSnapshot> {
        let mut items: Vec<JobSnapshot> = {
            let records = self.records.lock();
            records
                .iter()
                .map(|record| JobSnapshot::of(record, include_logs))
                .collect()
        };
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    pub fn update(&self, id: &str, update: JobUpdate) -> Option<JobSnapshot> {
        self.mutate(id, |record| apply_update(record, update))
    }

    /// Moves a job to `status`. Entering `processing` stamps `started_at` the
    /// first time.
    pub fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        progress: Option<f64>,
    ) -> Option<JobSnapshot> {
        let started_at = (status == JobStatus::Processing).then(Utc::now);
        self.update(
            id,
            JobUpdate {
                status: Some(status),
                progress,
                started_at,
                ..JobUpdate::default()
            },
        )
    }

    pub fn append_logs<I, S>(&self, id: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            return;
        }
        let max_logs = self.limits.max_logs;
        self.mutate(id, |record| {
            record.logs.extend(lines);
            trim_logs(&mut record.logs, max_logs);
        });
    }

    /// Overwrites the newest log line, or appends when the job has none.
    pub fn replace_last_log(&self, id: &str, line: impl Into<String>) {
        let line = line.into();
        self.mutate(id, |record| match record.logs.last_mut() {
            Some(last) => *last = line,
            None => record.logs.push(line),
        });
    }

    pub fn mark_success(&self, id: &str) -> Option<JobSnapshot> {
        self.update(
            id,
            JobUpdate {
                status: Some(JobStatus::Complete),
                message: Some(String::new()),
                progress: Some(100.0),
                completed_at: Some(Utc::now()),
                ..JobUpdate::default()
            },
        )
    }

    pub fn mark_failure(&self, id: &str, message: impl Into<String>) -> Option<JobSnapshot> {
        self.update(
            id,
            JobUpdate {
                status: Some(JobStatus::Failed),
                message: Some(message.into()),
                progress: Some(100.0),
                completed_at: Some(Utc::now()),
                ..JobUpdate::default()
            },
        )
    }

    fn mutate<F>(&self, id: &str, change: F) -> Option<JobSnapshot>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut records = self.records.lock();
        let record = records.iter_mut().find(|record| record.id == id)?;
        change(record);
        record.updated_at = Utc::now();
        let snapshot = JobSnapshot::of(record, true);
        self.persist(&records);
        Some(snapshot)
    }

    /// Called with the lock held. Failures are logged and swallowed so the
    /// in-memory state still reflects the update.
    fn persist(&self, records: &[JobRecord]) {
        if let Err(err) = write_history(&self.path, records) {
            warn!(path = %self.path.display(), "failed to persist job history: {err:#}");
        }
    }
}

fn apply_update(record: &mut JobRecord, update: JobUpdate) {
    let locked = record.status.is_terminal();

    if let Some(value) = update.progress.filter(|value| value.is_finite()) {
        record.progress = record.progress.max(value.clamp(0.0, 100.0));
    }
    if let Some(status) = update.status
        && !locked
    {
        record.status = status;
    }
    if let Some(label) = update.label.filter(|label| !label.is_empty()) {
        record.label = label;
    }
    if let Some(subtitle) = update.subtitle {
        record.subtitle = subtitle;
    }
    if let Some(metadata) = update.metadata {
        record.metadata = metadata;
    }
    if let Some(message) = update.message
        && !locked
    {
        record.message = message;
    }
    if let Some(request) = update.request {
        record.request = request;
    }
    if record.started_at.is_none() {
        record.started_at = update.started_at;
    }
    if record.completed_at.is_none() && record.status.is_terminal() {
        record.completed_at = update.completed_at;
    }
}

fn trim_logs(logs: &mut Vec<String>, max_logs: usize) {
    if logs.len() > max_logs {
        let excess = logs.len() - max_logs;
        logs.drain(..excess);
    }
}

fn load_records(path: &Path) -> Result<Vec<JobRecord>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let entries: Vec<Value> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .filter(|record: &JobRecord| !record.id.is_empty())
        .collect())
}

fn write_history(path: &Path, records: &[JobRecord]) -> Result<()> {
    let payload = serde_json::to_vec_pretty(records)?;
    write_atomic(path, &payload)
}

const NOISY_WARNING_SNIPPETS: &[&str] = &[
    "[youtube]",
    "sabr streaming",
    "web client https formats have been skipped",
    "web_safari client https formats have been skipped",
    "tv client https formats have been skipped",
];

const ESSENTIAL_PHRASES: &[&str] = &[
    "success! video saved",
    "success! saved",
    "renaming downloaded file",
    "treating video as main video file",
    "storing video in subfolder",
    "created movie folder",
    "fetching radarr details",
    "resolved youtube format",
    "merging playlist videos",
    "saving playlist extra",
];

const SIGNIFICANT_PREFIXES: &[&str] = &["error:", "warning:", "[download]", "[ffmpeg]", "[merger]"];

/// Reduces a job log to what a user needs to see. Debug mode keeps every
/// non-blank line.
pub fn filter_logs_for_display(logs: &[String], debug: bool) -> Vec<String> {
    logs.iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .filter(|line| debug || is_significant(line))
        .map(str::to_string)
        .collect()
}

fn is_significant(line: &str) -> bool {
    let lowered = line.to_lowercase();
    if lowered.starts_with("debug:") {
        return false;
    }
    if lowered.starts_with("warning:")
        && NOISY_WARNING_SNIPPETS
            .iter()
            .any(|snippet| lowered.contains(snippet))
    {
        return false;
    }
    SIGNIFICANT_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
        || ESSENTIAL_PHRASES
            .iter()
            .any(|phrase| lowered.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn store_in(dir: &Path, limits: StoreLimits) -> JobStore {
        JobStore::open(dir.join("jobs.json"), limits)
    }

    fn new_job(id: &str) -> NewJob {
        NewJob {
            id: id.to_string(),
            logs: vec!["Job queued.".to_string()],
            ..NewJob::default()
        }
    }

    #[test]
    fn create_requires_identifier_and_fills_defaults() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        assert!(store.create(new_job("  ")).is_err());

        let created = store.create(new_job("a")).unwrap();
        assert_eq!(created.status, JobStatus::Queued);
        assert_eq!(created.label, DEFAULT_LABEL);
        assert_eq!(created.progress, 0.0);
        assert_eq!(created.created_at, created.updated_at);
        assert_eq!(created.logs.as_deref(), Some(&["Job queued.".to_string()][..]));
        assert!(store.create(new_job("a")).is_err());
    }

    #[test]
    fn unwritable_history_keeps_in_memory_state() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let store = JobStore::open(blocker.join("jobs.json"), StoreLimits::default());

        store.create(new_job("w")).unwrap();
        let updated = store
            .update(
                "w",
                JobUpdate {
                    label: Some("Heat".into()),
                    status: Some(JobStatus::Processing),
                    ..JobUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.label, "Heat");
        store.append_logs("w", ["still here"]);

        let fetched = store.get("w", true).unwrap();
        assert_eq!(fetched.status, JobStatus::Processing);
        assert_eq!(fetched.label, "Heat");
        assert_eq!(fetched.logs.unwrap().last().unwrap(), "still here");
        assert!(!blocker.join("jobs.json").exists());
    }

    #[test]
    fn progress_never_decreases_and_stays_within_bounds() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        store.create(new_job("p")).unwrap();

        let mut last = 0.0;
        for value in [5.0, 42.0, 12.0, -3.0, f64::NAN, 180.0, 99.0] {
            let snapshot = store.set_status("p", JobStatus::Processing, Some(value)).unwrap();
            assert!(snapshot.progress >= last);
            assert!(snapshot.progress <= 100.0);
            last = snapshot.progress;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn started_at_is_set_once() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        store.create(new_job("s")).unwrap();

        let first = store
            .set_status("s", JobStatus::Processing, Some(1.0))
            .unwrap()
            .started_at
            .unwrap();
        let second = store
            .set_status("s", JobStatus::Processing, Some(10.0))
            .unwrap()
            .started_at
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        store.create(new_job("t")).unwrap();
        store.set_status("t", JobStatus::Processing, Some(20.0));

        let failed = store.mark_failure("t", "Download failed: boom").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.progress, 100.0);
        let completed_at = failed.completed_at.unwrap();

        let after_success = store.mark_success("t").unwrap();
        assert_eq!(after_success.status, JobStatus::Failed);
        assert_eq!(after_success.message, "Download failed: boom");
        assert_eq!(after_success.completed_at, Some(completed_at));

        let after_status = store.set_status("t", JobStatus::Processing, None).unwrap();
        assert_eq!(after_status.status, JobStatus::Failed);
    }

    #[test]
    fn success_clears_message_and_completes() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        store.create(new_job("ok")).unwrap();
        let done = store.mark_success("ok").unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.message, "");
        assert_eq!(done.progress, 100.0);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn logs_behave_like_a_ring_buffer() {
        let dir = tempdir().unwrap();
        let store = store_in(
            dir.path(),
            StoreLimits {
                max_items: 5,
                max_logs: 3,
            },
        );
        store.create(new_job("r")).unwrap();
        store.append_logs("r", ["one", "two"]);
        store.append_logs("r", vec!["three".to_string(), "four".to_string()]);

        let logs = store.get("r", true).unwrap().logs.unwrap();
        assert_eq!(logs, vec!["two", "three", "four"]);
        assert!(store.get("r", false).unwrap().logs.is_none());
    }

    #[test]
    fn replace_last_log_overwrites_or_appends() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        store
            .create(NewJob {
                id: "l".into(),
                ..NewJob::default()
            })
            .unwrap();
        store.replace_last_log("l", "[download] 10.0%");
        store.replace_last_log("l", "[download] 20.0%");
        assert_eq!(
            store.get("l", true).unwrap().logs.unwrap(),
            vec!["[download] 20.0%"]
        );
    }

    #[test]
    fn oldest_jobs_are_evicted_and_list_is_newest_first() {
        let dir = tempdir().unwrap();
        let store = store_in(
            dir.path(),
            StoreLimits {
                max_items: 2,
                max_logs: 10,
            },
        );
        for id in ["first", "second", "third"] {
            store.create(new_job(id)).unwrap();
        }
        let ids: Vec<_> = store.list(false).into_iter().map(|job| job.id).collect();
        assert_eq!(ids, vec!["third", "second"]);
        assert!(store.get("first", false).is_none());
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = store_in(dir.path(), StoreLimits::default());
            store.create(new_job("persisted")).unwrap();
            store.append_logs("persisted", ["[download] 50.0%"]);
            store.mark_success("persisted");
        }
        let reopened = store_in(dir.path(), StoreLimits::default());
        let job = reopened.get("persisted", true).unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.logs.unwrap().len(), 2);
        assert!(!dir.path().join("jobs.tmp").exists());
    }

    #[test]
    fn invalid_history_file_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("jobs.json"), "{not json").unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        assert!(store.list(true).is_empty());
        store.create(new_job("fresh")).unwrap();
        assert_eq!(store_in(dir.path(), StoreLimits::default()).list(false).len(), 1);
    }

    #[test]
    fn unknown_job_operations_are_no_ops() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), StoreLimits::default());
        assert!(store.update("missing", JobUpdate::default()).is_none());
        store.append_logs("missing", ["ignored"]);
        assert!(store.mark_failure("missing", "x").is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn concurrent_appends_are_all_retained() {
        let dir = tempdir().unwrap();
        let store = Arc::new(store_in(
            dir.path(),
            StoreLimits {
                max_items: 5,
                max_logs: 1000,
            },
        ));
        store
            .create(NewJob {
                id: "c".into(),
                ..NewJob::default()
            })
            .unwrap();
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for line in 0..25 {
                        store.append_logs("c", [format!("{worker}-{line}")]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("c", true).unwrap().logs.unwrap().len(), 100);
    }

    #[test]
    fn display_filter_hides_noise_unless_debugging() {
        let logs: Vec<String> = [
            "Job queued.",
            "DEBUG: [youtube] extracting",
            "WARNING: [youtube] sabr streaming forced",
            "WARNING: ffmpeg executable not found",
            "[download]  42.0% of 10MiB",
            "Fetching Radarr details for movie ID 7.",
            "   ",
            "ERROR: Download failed: nope",
            "Success! Video saved as '/movies/Heat.mp4'.",
        ]
        .iter()
        .map(|line| line.to_string())
        .collect();

        assert_eq!(
            filter_logs_for_display(&logs, false),
            vec![
                "WARNING: ffmpeg executable not found",
                "[download]  42.0% of 10MiB",
                "Fetching Radarr details for movie ID 7.",
                "ERROR: Download failed: nope",
                "Success! Video saved as '/movies/Heat.mp4'.",
            ]
        );
        assert_eq!(filter_logs_for_display(&logs, true).len(), 8);
    }
}
