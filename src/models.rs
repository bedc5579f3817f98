// src/models.rs

use serde::{Deserialize, Serialize};

/// What a caller hands to `DownloadManager::start_download`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Caller-chosen identifier. Must be unique within the manager.
    pub id: String,
    pub filename: String,
    pub url: String,
    /// Optional lowercase hex SHA-256 of the complete payload.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl JobDescriptor {
    pub fn new(id: impl Into<String>, filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            url: url.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }
}

/// The status of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in-progress",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// The persistent, observable part of a download job.
///
/// Transient transfer state (the cancellation token and the chunk buffers)
/// never lives here: the token belongs to the manager's active slot and the
/// chunk bytes live in the chunk tables of the `StateManager`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub status: JobStatus,
    /// Bytes received so far; always the sum of the persisted chunk lengths.
    pub received: u64,
    /// Expected length, 0 while unknown.
    pub total: u64,
    pub progress: u8,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Last failure reason, cleared when the job is queued again.
    #[serde(default)]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            id: descriptor.id,
            filename: descriptor.filename,
            url: descriptor.url,
            status: JobStatus::Queued,
            received: 0,
            total: 0,
            progress: 0,
            sha256: descriptor.sha256,
            error: None,
        }
    }

    /// Updates the byte counters and recomputes `progress`.
    pub fn set_counters(&mut self, received: u64, total: u64) {
        self.received = received;
        self.total = total;
        self.progress = progress_percent(received, total);
    }
}

/// `round(received / total * 100)`, or 0 while the total is unknown.
///
/// Not clamped: an undercounted `total` may briefly report more than 100.
pub fn progress_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (received as f64 / total as f64 * 100.0).round();
    percent.min(u8::MAX as f64) as u8
}
