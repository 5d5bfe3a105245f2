//! Tracking identifiers and the upload status machine.

use crate::db::{Repository, UploadRecord};
use crate::error::Error;
use crate::utils::human_size;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const MIN_ID_LEN: usize = 8;
const MAX_ID_LEN: usize = 36;

/// Public handle of one upload, e.g. `EMAIL-1A2B3C4D-9F0E-4821`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TrackerId(String);

impl TrackerId {
    /// `<PREFIX>-<8 hex>-<4 hex>-<4 digits>`, uppercase.
    ///
    /// Uniqueness is enforced by the `tracker_id` column, not here.
    pub fn generate(prefix: &str) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        let (head, rest) = uuid.split_at(8);
        let (_, tail) = rest.split_at(rest.len() - 4);
        let digits = Utc::now().timestamp().rem_euclid(10_000);
        Self(format!("{prefix}-{head}-{tail}-{digits:04}").to_ascii_uppercase())
    }

    /// Normalizes user input; `None` when it cannot be a tracker id at all.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_uppercase();
        let valid = (MIN_ID_LEN..=MAX_ID_LEN).contains(&normalized.len())
            && normalized
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-');
        valid.then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

impl ProcessingStatus {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Wording used in notification mails.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending review",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Rejected => "Rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Rejected)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Rejected)
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a status query returns about one upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub tracker_id: String,
    pub original_filename: String,
    pub file_size_bytes: i64,
    pub file_size: String,
    pub file_type_tag: String,
    pub status: ProcessingStatus,
    pub status_label: &'static str,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub source: String,
    pub source_subject: String,
    pub reviewer_id: Option<String>,
    pub review_comment: Option<String>,
}

impl From<UploadRecord> for StatusView {
    fn from(record: UploadRecord) -> Self {
        let rejection_reason = (record.processing_status == ProcessingStatus::Rejected)
            .then(|| {
                record
                    .extra_metadata
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| record.review_comment.clone())
            })
            .flatten();
        let source = record
            .extra_metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("email")
            .to_string();

        Self {
            file_size: human_size(u64::try_from(record.file_size_bytes).unwrap_or(0)),
            status_label: record.processing_status.label(),
            tracker_id: record.tracker_id,
            original_filename: record.original_filename,
            file_size_bytes: record.file_size_bytes,
            file_type_tag: record.file_type_tag,
            status: record.processing_status,
            received_at: record.received_at,
            processed_at: record.processed_at,
            rejection_reason,
            source,
            source_subject: record.source_subject,
            reviewer_id: record.reviewer_id,
            review_comment: record.review_comment,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(StatusView),
    NotFound,
}

/// Upload counts per processing status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub rejected: u64,
    pub total: u64,
}

/// Read-only access to upload records by tracker id.
#[derive(Clone)]
pub struct Tracker {
    repo: Arc<dyn Repository>,
}

impl Tracker {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn lookup(&self, tracker_id: &str) -> Result<Lookup, Error> {
        let Some(id) = TrackerId::parse(tracker_id) else {
            return Ok(Lookup::NotFound);
        };
        Ok(match self.repo.find_upload(id.as_str()).await? {
            Some(record) => Lookup::Found(record.into()),
            None => Lookup::NotFound,
        })
    }

    pub async fn stats(&self) -> Result<TrackerStats, Error> {
        let mut stats = TrackerStats::default();
        for (status, count) in self.repo.count_uploads_by_status().await? {
            let count = u64::try_from(count).unwrap_or(0);
            match status {
                ProcessingStatus::Pending => stats.pending = count,
                ProcessingStatus::Processing => stats.processing = count,
                ProcessingStatus::Completed => stats.completed = count,
                ProcessingStatus::Rejected => stats.rejected = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }
}
