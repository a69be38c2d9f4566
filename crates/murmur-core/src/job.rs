//! Job queue types for persistent embedding job management.
//!
//! Each job points at one piece of social content (a post or a comment) that
//! needs its embedding and entity metadata (re)generated.
//!
//! # Lifecycle
//!
//! ```text
//! pending → processing → completed
//!              ↓
//!           failed ──(manual / scheduled requeue)──→ pending
//!
//! processing ──(stuck past timeout, orphan reaper)──→ pending
//! ```
//!
//! A job is claimable only while `pending` and outside its cooldown window.
//! `attempts` only ever grows: it is incremented each time a job is marked `failed`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest priority a job can carry.
pub const MIN_PRIORITY: i16 = 1;
/// Highest priority a job can carry.
pub const MAX_PRIORITY: i16 = 10;

// =============================================================================
// Job Status
// =============================================================================

/// Status of an embedding job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is waiting to be claimed.
    Pending,
    /// Job has been claimed by a worker.
    Processing,
    /// Job completed successfully.
    Completed,
    /// Job failed; stays failed until requeued.
    Failed,
}

impl JobStatus {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns true if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Error type for parsing JobStatus from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseJobStatusError(String);

impl fmt::Display for ParseJobStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {}", self.0)
    }
}

impl std::error::Error for ParseJobStatusError {}

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(ParseJobStatusError(s.to_string())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Record references
// =============================================================================

/// Kind of content a job refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Post,
    Comment,
    /// Any other content kind; uses the fallback priority.
    Other(String),
}

impl RecordKind {
    pub fn as_str(&self) -> &str {
        match self {
            RecordKind::Post => "post",
            RecordKind::Comment => "comment",
            RecordKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for RecordKind {
    fn from(s: &str) -> Self {
        match s {
            "post" => RecordKind::Post,
            "comment" => RecordKind::Comment,
            other => RecordKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the content is new or an edit of something already processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Updated => "updated",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content item the producer has detected as new or changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRef {
    /// Identifier of the post or comment.
    pub record_id: String,
    pub record_kind: RecordKind,
    /// Free-form identifier of the table the record lives in.
    pub source_table: String,
    pub change: ChangeKind,
}

impl ContentRef {
    /// A new post stored in the `posts` table.
    pub fn new_post(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            record_kind: RecordKind::Post,
            source_table: "posts".to_string(),
            change: ChangeKind::New,
        }
    }

    /// A new comment stored in the `comments` table.
    pub fn new_comment(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            record_kind: RecordKind::Comment,
            source_table: "comments".to_string(),
            change: ChangeKind::New,
        }
    }

    /// Marks the reference as an update of already-processed content.
    pub fn updated(mut self) -> Self {
        self.change = ChangeKind::Updated;
        self
    }

    /// Overrides the source table identifier.
    pub fn with_source_table(mut self, table: impl Into<String>) -> Self {
        self.source_table = table.into();
        self
    }
}

// =============================================================================
// Priorities
// =============================================================================

/// Static mapping from (kind, change) to job priority.
///
/// Updates outrank fresh content of the same kind, and posts outrank comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityMap {
    pub new_post: i16,
    pub new_comment: i16,
    pub updated_post: i16,
    pub updated_comment: i16,
    /// Used for kinds the mapping does not know.
    pub fallback: i16,
}

impl Default for PriorityMap {
    fn default() -> Self {
        Self {
            new_post: 8,
            new_comment: 5,
            updated_post: 9,
            updated_comment: 6,
            fallback: 5,
        }
    }
}

impl PriorityMap {
    /// Returns the priority for a content reference, clamped into `[1, 10]`.
    pub fn priority_for(&self, kind: &RecordKind, change: ChangeKind) -> i16 {
        let raw = match (kind, change) {
            (RecordKind::Post, ChangeKind::New) => self.new_post,
            (RecordKind::Post, ChangeKind::Updated) => self.updated_post,
            (RecordKind::Comment, ChangeKind::New) => self.new_comment,
            (RecordKind::Comment, ChangeKind::Updated) => self.updated_comment,
            (RecordKind::Other(_), _) => self.fallback,
        };
        clamp_priority(raw)
    }
}

/// Clamps a priority into the valid `[1, 10]` range.
pub fn clamp_priority(priority: i16) -> i16 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

// =============================================================================
// Job
// =============================================================================

/// An embedding job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,

    /// Identifier of the referenced post or comment.
    pub record_id: String,

    /// Kind of the referenced record.
    pub record_kind: RecordKind,

    /// Table the record is stored in.
    pub source_table: String,

    /// 1..=10, higher is served first.
    pub priority: i16,

    /// Current job status.
    pub status: JobStatus,

    /// Number of times the job has been marked failed.
    pub attempts: u32,

    /// Failure reason from the last failed attempt.
    pub last_error: Option<String>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job was last claimed or finished.
    pub processed_at: Option<DateTime<Utc>>,

    /// The job cannot be claimed before this instant.
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Job {
    /// Returns true if the cooldown has expired (or was never set).
    pub fn cooldown_expired(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_none_or(|until| until <= now)
    }

    /// Returns true if a claimer may pick this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.cooldown_expired(now)
    }

    /// Timestamp the orphan reaper compares against its threshold.
    pub fn processing_since(&self) -> DateTime<Utc> {
        self.processed_at.unwrap_or(self.created_at)
    }
}

// =============================================================================
// Job Creation Request
// =============================================================================

/// Request to insert a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub record_id: String,
    pub record_kind: RecordKind,
    pub source_table: String,
    pub priority: i16,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Creates a new job request for the given content with a priority.
    ///
    /// The priority is clamped into `[1, 10]`.
    pub fn new(content: &ContentRef, priority: i16) -> Self {
        Self {
            record_id: content.record_id.clone(),
            record_kind: content.record_kind.clone(),
            source_table: content.source_table.clone(),
            priority: clamp_priority(priority),
            cooldown_until: None,
        }
    }

    /// Delays claiming until the given instant.
    pub fn with_cooldown_until(mut self, until: DateTime<Utc>) -> Self {
        self.cooldown_until = Some(until);
        self
    }
}

// =============================================================================
// Queue statistics
// =============================================================================

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Pending plus processing; the quantity the queue cap applies to.
    pub fn non_terminal(&self) -> u64 {
        self.pending + self.processing
    }

    pub fn terminal(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn total(&self) -> u64 {
        self.non_terminal() + self.terminal()
    }
}

// =============================================================================
// Tests
// =============================================================================
