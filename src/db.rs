//! SQLite persistence for uploads, policy rules and rate counters.

use crate::error::Error;
use crate::rate_limiter::{CounterStore, RateRecord};
use crate::tracker::ProcessingStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadRecord {
    pub id: i64,
    pub tracker_id: String,
    pub sender_hash: String,
    pub sender_address: String,
    pub original_filename: String,
    pub stored_reference: String,
    pub file_size_bytes: i64,
    pub file_type_tag: String,
    pub source_subject: String,
    pub received_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub reviewer_id: Option<String>,
    pub review_comment: Option<String>,
    pub extra_metadata: serde_json::Value,
}

/// Fields of a record about to be created; it always starts out `pending`.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub tracker_id: String,
    pub sender_hash: String,
    pub sender_address: String,
    pub original_filename: String,
    pub stored_reference: String,
    pub file_size_bytes: i64,
    pub file_type_tag: String,
    pub source_subject: String,
    pub received_at: DateTime<Utc>,
    pub extra_metadata: serde_json::Value,
}

/// A reviewed status change, applied only if the record is still in `from`.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub from: ProcessingStatus,
    pub to: ProcessingStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub reviewer_id: Option<String>,
    pub review_comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRule {
    pub id: i64,
    pub domain: String,
    pub is_allowed: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRule {
    pub id: i64,
    pub name: String,
    pub max_file_size: i64,
    pub max_file_count: i64,
    pub allowed_extensions: Vec<String>,
    pub blocked_extensions: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Editable part of an [`AttachmentRule`], keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttachmentRuleInput {
    pub name: String,
    pub max_file_size: i64,
    pub max_file_count: i64,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub blocked_extensions: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Create/read/update access the pipeline and the admin surface need.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_upload(&self, upload: &NewUpload) -> Result<UploadRecord, Error>;
    async fn find_upload(&self, tracker_id: &str) -> Result<Option<UploadRecord>, Error>;
    /// `None` when the record is missing or no longer in `change.from`.
    async fn change_status(
        &self,
        tracker_id: &str,
        change: &StatusChange,
    ) -> Result<Option<UploadRecord>, Error>;
    async fn count_uploads_by_status(&self) -> Result<Vec<(ProcessingStatus, i64)>, Error>;
    async fn rejected_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadRecord>, Error>;
    async fn delete_upload(&self, id: i64) -> Result<bool, Error>;

    async fn find_domain_rule(&self, domain: &str) -> Result<Option<DomainRule>, Error>;
    async fn list_domain_rules(&self) -> Result<Vec<DomainRule>, Error>;
    /// Inserts the rule or updates the existing one for the same domain.
    async fn upsert_domain_rule(
        &self,
        domain: &str,
        is_allowed: bool,
        description: &str,
    ) -> Result<DomainRule, Error>;
    async fn delete_domain_rule(&self, domain: &str) -> Result<bool, Error>;

    /// First active rule by id.
    async fn active_attachment_rule(&self) -> Result<Option<AttachmentRule>, Error>;
    async fn list_attachment_rules(&self) -> Result<Vec<AttachmentRule>, Error>;
    async fn upsert_attachment_rule(
        &self,
        rule: &AttachmentRuleInput,
    ) -> Result<AttachmentRule, Error>;
    async fn delete_attachment_rule(&self, name: &str) -> Result<bool, Error>;
}

/// SQLite-backed [`Repository`] and [`CounterStore`].
///
/// Writes with `RETURNING` are read with `fetch_all`: SQLite only commits the
/// statement once every returned row has been stepped through.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Opens (creating if needed) the database file and applies migrations.
    pub async fn connect(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const UPLOAD_COLUMNS: &str = "id, tracker_id, sender_hash, sender_address, original_filename, \
     stored_reference, file_size_bytes, file_type_tag, source_subject, received_at, \
     processing_status, processed_at, reviewer_id, review_comment, extra_metadata";

fn decode_error(message: String) -> Error {
    Error::Database(sqlx::Error::Decode(message.into()))
}

fn upload_from_row(row: &SqliteRow) -> Result<UploadRecord, Error> {
    let status: String = row.try_get("processing_status")?;
    let processing_status = ProcessingStatus::parse(&status)
        .ok_or_else(|| decode_error(format!("unknown processing status `{status}`")))?;
    let metadata: String = row.try_get("extra_metadata")?;
    let extra_metadata = serde_json::from_str(&metadata)?;

    Ok(UploadRecord {
        id: row.try_get("id")?,
        tracker_id: row.try_get("tracker_id")?,
        sender_hash: row.try_get("sender_hash")?,
        sender_address: row.try_get("sender_address")?,
        original_filename: row.try_get("original_filename")?,
        stored_reference: row.try_get("stored_reference")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        file_type_tag: row.try_get("file_type_tag")?,
        source_subject: row.try_get("source_subject")?,
        received_at: row.try_get("received_at")?,
        processing_status,
        processed_at: row.try_get("processed_at")?,
        reviewer_id: row.try_get("reviewer_id")?,
        review_comment: row.try_get("review_comment")?,
        extra_metadata,
    })
}

fn domain_rule_from_row(row: &SqliteRow) -> Result<DomainRule, Error> {
    Ok(DomainRule {
        id: row.try_get("id")?,
        domain: row.try_get("domain")?,
        is_allowed: row.try_get("is_allowed")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn attachment_rule_from_row(row: &SqliteRow) -> Result<AttachmentRule, Error> {
    let list = |column: &str| -> Result<Vec<String>, Error> {
        let raw: String = row.try_get(column)?;
        Ok(serde_json::from_str(&raw)?)
    };
    Ok(AttachmentRule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        max_file_size: row.try_get("max_file_size")?,
        max_file_count: row.try_get("max_file_count")?,
        allowed_extensions: list("allowed_extensions")?,
        blocked_extensions: list("blocked_extensions")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rate_record_from_row(row: &SqliteRow) -> Result<RateRecord, Error> {
    let count = |column: &str| -> Result<u32, Error> {
        let value: i64 = row.try_get(column)?;
        Ok(u32::try_from(value).unwrap_or(u32::MAX))
    };
    Ok(RateRecord {
        sender_hash: row.try_get("sender_hash")?,
        hourly_count: count("hourly_count")?,
        daily_count: count("daily_count")?,
        hourly_window_start: row.try_get("hourly_window_start")?,
        daily_window_start: row.try_get("daily_window_start")?,
        blocked_until: row.try_get("blocked_until")?,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn create_upload(&self, upload: &NewUpload) -> Result<UploadRecord, Error> {
        let metadata = serde_json::to_string(&upload.extra_metadata)?;
        let row = sqlx::query(&format!(
            "INSERT INTO upload_records (tracker_id, sender_hash, sender_address, \
             original_filename, stored_reference, file_size_bytes, file_type_tag, \
             source_subject, received_at, processing_status, extra_metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?) RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(&upload.tracker_id)
        .bind(&upload.sender_hash)
        .bind(&upload.sender_address)
        .bind(&upload.original_filename)
        .bind(&upload.stored_reference)
        .bind(upload.file_size_bytes)
        .bind(&upload.file_type_tag)
        .bind(&upload.source_subject)
        .bind(upload.received_at)
        .bind(metadata)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        upload_from_row(&row)
    }

    async fn find_upload(&self, tracker_id: &str) -> Result<Option<UploadRecord>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload_records WHERE tracker_id = ?"
        ))
        .bind(tracker_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(upload_from_row).transpose()
    }

    async fn change_status(
        &self,
        tracker_id: &str,
        change: &StatusChange,
    ) -> Result<Option<UploadRecord>, Error> {
        let rows = sqlx::query(&format!(
            "UPDATE upload_records SET processing_status = ?, processed_at = ?, \
             reviewer_id = COALESCE(?, reviewer_id), review_comment = COALESCE(?, review_comment) \
             WHERE tracker_id = ? AND processing_status = ? RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(change.to.as_str())
        .bind(change.processed_at)
        .bind(&change.reviewer_id)
        .bind(&change.review_comment)
        .bind(tracker_id)
        .bind(change.from.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.first().map(upload_from_row).transpose()
    }

    async fn count_uploads_by_status(&self) -> Result<Vec<(ProcessingStatus, i64)>, Error> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT processing_status, COUNT(*) FROM upload_records GROUP BY processing_status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(status, count)| {
                ProcessingStatus::parse(&status)
                    .map(|status| (status, count))
                    .ok_or_else(|| decode_error(format!("unknown processing status `{status}`")))
            })
            .collect()
    }

    async fn rejected_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadRecord>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload_records \
             WHERE processing_status = 'rejected' AND processed_at IS NOT NULL \
             AND processed_at < ? ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(upload_from_row).collect()
    }

    async fn delete_upload(&self, id: i64) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM upload_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_domain_rule(&self, domain: &str) -> Result<Option<DomainRule>, Error> {
        let row = sqlx::query("SELECT * FROM domain_rules WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(domain_rule_from_row).transpose()
    }

    async fn list_domain_rules(&self) -> Result<Vec<DomainRule>, Error> {
        let rows = sqlx::query("SELECT * FROM domain_rules ORDER BY domain")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(domain_rule_from_row).collect()
    }

    async fn upsert_domain_rule(
        &self,
        domain: &str,
        is_allowed: bool,
        description: &str,
    ) -> Result<DomainRule, Error> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO domain_rules (domain, is_allowed, description, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(domain) DO UPDATE SET is_allowed = excluded.is_allowed, \
             description = excluded.description, updated_at = excluded.updated_at \
             RETURNING *",
        )
        .bind(domain)
        .bind(is_allowed)
        .bind(description)
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        domain_rule_from_row(&row)
    }

    async fn delete_domain_rule(&self, domain: &str) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM domain_rules WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_attachment_rule(&self) -> Result<Option<AttachmentRule>, Error> {
        let row = sqlx::query(
            "SELECT * FROM attachment_rules WHERE is_active = 1 ORDER BY id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(attachment_rule_from_row).transpose()
    }

    async fn list_attachment_rules(&self) -> Result<Vec<AttachmentRule>, Error> {
        let rows = sqlx::query("SELECT * FROM attachment_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attachment_rule_from_row).collect()
    }

    async fn upsert_attachment_rule(
        &self,
        rule: &AttachmentRuleInput,
    ) -> Result<AttachmentRule, Error> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO attachment_rules (name, max_file_size, max_file_count, \
             allowed_extensions, blocked_extensions, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET max_file_size = excluded.max_file_size, \
             max_file_count = excluded.max_file_count, \
             allowed_extensions = excluded.allowed_extensions, \
             blocked_extensions = excluded.blocked_extensions, \
             is_active = excluded.is_active, updated_at = excluded.updated_at \
             RETURNING *",
        )
        .bind(&rule.name)
        .bind(rule.max_file_size)
        .bind(rule.max_file_count)
        .bind(serde_json::to_string(&rule.allowed_extensions)?)
        .bind(serde_json::to_string(&rule.blocked_extensions)?)
        .bind(rule.is_active)
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        attachment_rule_from_row(&row)
    }

    async fn delete_attachment_rule(&self, name: &str) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM attachment_rules WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CounterStore for SqliteRepository {
    async fn load(&self, sender_hash: &str) -> Result<Option<RateRecord>, Error> {
        let row = sqlx::query("SELECT * FROM rate_records WHERE sender_hash = ?")
            .bind(sender_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rate_record_from_row).transpose()
    }

    async fn save(&self, record: &RateRecord) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO rate_records (sender_hash, hourly_count, daily_count, \
             hourly_window_start, daily_window_start, blocked_until) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(sender_hash) DO UPDATE SET hourly_count = excluded.hourly_count, \
             daily_count = excluded.daily_count, \
             hourly_window_start = excluded.hourly_window_start, \
             daily_window_start = excluded.daily_window_start, \
             blocked_until = excluded.blocked_until",
        )
        .bind(&record.sender_hash)
        .bind(i64::from(record.hourly_count))
        .bind(i64::from(record.daily_count))
        .bind(record.hourly_window_start)
        .bind(record.daily_window_start)
        .bind(record.blocked_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM rate_records \
             WHERE daily_window_start IS NULL OR daily_window_start < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Whether the error is a uniqueness violation, e.g. a tracker id collision.
pub fn is_unique_violation(error: &Error) -> bool {
    match error {
        Error::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use testresult::TestResult;

    pub(crate) async fn test_repository()
    -> Result<(tempfile::TempDir, SqliteRepository), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let repo = SqliteRepository::connect(&dir.path().join("intake.db")).await?;
        Ok((dir, repo))
    }

    /// Makes every later upload insert fail, as a full disk would.
    pub(crate) async fn refuse_uploads(repo: &SqliteRepository) -> Result<(), Error> {
        sqlx::query(
            "CREATE TRIGGER refuse_uploads BEFORE INSERT ON upload_records \
             BEGIN SELECT RAISE(ABORT, 'database or disk is full'); END",
        )
        .execute(&repo.pool)
        .await?;
        Ok(())
    }

    pub(crate) fn new_upload(tracker_id: &str, filename: &str) -> NewUpload {
        NewUpload {
            tracker_id: tracker_id.to_string(),
            sender_hash: crate::utils::sender_hash("user@allowed.com"),
            sender_address: "user@allowed.com".to_string(),
            original_filename: filename.to_string(),
            stored_reference: format!("2024/01/01/{filename}"),
            file_size_bytes: 1024,
            file_type_tag: "documentation".to_string(),
            source_subject: "Quarterly report".to_string(),
            received_at: Utc::now(),
            extra_metadata: serde_json::json!({ "source": "email" }),
        }
    }

    #[tokio::test]
    async fn test_create_and_find_upload() -> TestResult {
        let (_dir, repo) = test_repository().await?;
        let created = repo
            .create_upload(&new_upload("EMAIL-11111111-AAAA-0001", "a.pdf"))
            .await?;
        assert_eq!(created.processing_status, ProcessingStatus::Pending);
        assert_eq!(created.processed_at, None);
        assert_eq!(created.extra_metadata["source"], "email");

        let found = repo
            .find_upload("EMAIL-11111111-AAAA-0001")
            .await?
            .ok_or("not found")?;
        assert_eq!(found, created);
        assert!(repo.find_upload("EMAIL-MISSING").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_writes_visible_to_next_read() -> TestResult {
        for round in 0..20 {
            let (_dir, repo) = test_repository().await?;
            let tracker_id = format!("EMAIL-11111111-AAAA-{round:04}");
            repo.create_upload(&new_upload(&tracker_id, "a.pdf")).await?;
            assert!(repo.find_upload(&tracker_id).await?.is_some(), "round {round}");

            repo.change_status(
                &tracker_id,
                &StatusChange {
                    from: ProcessingStatus::Pending,
                    to: ProcessingStatus::Processing,
                    processed_at: None,
                    reviewer_id: None,
                    review_comment: None,
                },
            )
            .await?
            .ok_or("transition refused")?;
            let found = repo.find_upload(&tracker_id).await?.ok_or("not found")?;
            assert_eq!(found.processing_status, ProcessingStatus::Processing);

            repo.upsert_domain_rule("uni.edu", true, "").await?;
            assert!(repo.find_domain_rule("uni.edu").await?.is_some(), "round {round}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_tracker_id_is_unique_violation() -> TestResult {
        let (_dir, repo) = test_repository().await?;
        let upload = new_upload("EMAIL-11111111-AAAA-0001", "a.pdf");
        repo.create_upload(&upload).await?;
        let Err(e) = repo.create_upload(&upload).await else {
            panic!("duplicate tracker id accepted");
        };
        assert!(is_unique_violation(&e));
        Ok(())
    }

    #[tokio::test]
    async fn test_change_status_requires_expected_state() -> TestResult {
        let (_dir, repo) = test_repository().await?;
        repo.create_upload(&new_upload("EMAIL-22222222-BBBB-0002", "b.pdf"))
            .await?;
        let change = StatusChange {
            from: ProcessingStatus::Processing,
            to: ProcessingStatus::Completed,
            processed_at: Some(Utc::now()),
            reviewer_id: Some("rev-1".into()),
            review_comment: None,
        };
        assert!(
            repo.change_status("EMAIL-22222222-BBBB-0002", &change)
                .await?
                .is_none()
        );

        let to_processing = StatusChange {
            from: ProcessingStatus::Pending,
            to: ProcessingStatus::Processing,
            processed_at: None,
            reviewer_id: None,
            review_comment: None,
        };
        repo.change_status("EMAIL-22222222-BBBB-0002", &to_processing)
            .await?
            .ok_or("transition refused")?;
        let done = repo
            .change_status("EMAIL-22222222-BBBB-0002", &change)
            .await?
            .ok_or("transition refused")?;
        assert_eq!(done.processing_status, ProcessingStatus::Completed);
        assert_eq!(done.reviewer_id.as_deref(), Some("rev-1"));
        assert!(done.processed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_before_and_counts() -> TestResult {
        let (_dir, repo) = test_repository().await?;
        repo.create_upload(&new_upload("EMAIL-33333333-CCCC-0003", "c.pdf"))
            .await?;
        repo.create_upload(&new_upload("EMAIL-44444444-DDDD-0004", "d.pdf"))
            .await?;
        let long_ago = Utc::now() - Duration::days(40);
        repo.change_status(
            "EMAIL-33333333-CCCC-0003",
            &StatusChange {
                from: ProcessingStatus::Pending,
                to: ProcessingStatus::Rejected,
                processed_at: Some(long_ago),
                reviewer_id: None,
                review_comment: Some("spam".into()),
            },
        )
        .await?
        .ok_or("transition refused")?;

        let cutoff = Utc::now() - Duration::days(30);
        let old = repo.rejected_before(cutoff).await?;
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].tracker_id, "EMAIL-33333333-CCCC-0003");

        let mut counts = repo.count_uploads_by_status().await?;
        counts.sort_by_key(|(status, _)| status.as_str());
        assert_eq!(
            counts,
            vec![(ProcessingStatus::Pending, 1), (ProcessingStatus::Rejected, 1)]
        );

        assert!(repo.delete_upload(old[0].id).await?);
        assert!(!repo.delete_upload(old[0].id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_domain_rule_upsert_and_delete() -> TestResult {
        let (_dir, repo) = test_repository().await?;
        let rule = repo.upsert_domain_rule("allowed.com", true, "partner").await?;
        assert!(rule.is_allowed);
        let updated = repo.upsert_domain_rule("allowed.com", false, "revoked").await?;
        assert_eq!(updated.id, rule.id);
        assert!(!updated.is_allowed);
        assert_eq!(updated.description, "revoked");
        assert_eq!(repo.list_domain_rules().await?.len(), 1);
        assert!(repo.delete_domain_rule("allowed.com").await?);
        assert!(repo.find_domain_rule("allowed.com").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_first_active_attachment_rule() -> TestResult {
        let (_dir, repo) = test_repository().await?;
        assert!(repo.active_attachment_rule().await?.is_none());
        let input = |name: &str, active: bool| AttachmentRuleInput {
            name: name.to_string(),
            max_file_size: 2048,
            max_file_count: 2,
            allowed_extensions: vec![".pdf".into()],
            blocked_extensions: vec![".exe".into()],
            is_active: active,
        };
        repo.upsert_attachment_rule(&input("inactive", false)).await?;
        repo.upsert_attachment_rule(&input("strict", true)).await?;
        repo.upsert_attachment_rule(&input("later", true)).await?;
        let active = repo.active_attachment_rule().await?.ok_or("no active rule")?;
        assert_eq!(active.name, "strict");
        assert_eq!(active.allowed_extensions, vec![".pdf"]);
        assert_eq!(active.blocked_extensions, vec![".exe"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rate_records_roundtrip_and_purge() -> TestResult {
        let (_dir, repo) = test_repository().await?;
        let now = Utc::now().trunc_subsecs(0);
        let mut record = RateRecord::new("hash-a");
        record.hourly_count = 2;
        record.daily_count = 3;
        record.hourly_window_start = Some(now);
        record.daily_window_start = Some(now - Duration::days(8));
        repo.save(&record).await?;
        assert_eq!(repo.load("hash-a").await?, Some(record));

        let mut fresh = RateRecord::new("hash-b");
        fresh.daily_window_start = Some(now);
        repo.save(&fresh).await?;

        assert_eq!(repo.purge_stale(now - Duration::days(7)).await?, 1);
        assert_eq!(repo.purge_stale(now - Duration::days(7)).await?, 0);
        assert!(repo.load("hash-a").await?.is_none());
        Ok(())
    }
}
