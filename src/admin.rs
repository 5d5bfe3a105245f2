//! Operations behind the admin and status API.
//!
//! The HTTP layer itself lives elsewhere; it calls into [`Admin`].

use crate::db::{AttachmentRule, AttachmentRuleInput, DomainRule, Repository, StatusChange};
use crate::error::Error;
use crate::ingest::{CycleReport, Pipeline, StatsSnapshot};
use crate::notifier::{DispatchSnapshot, NotificationQueue};
use crate::policy::{DomainPolicy, is_valid_domain};
use crate::tracker::{Lookup, ProcessingStatus, StatusView, Tracker, TrackerId, TrackerStats};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One row of a domain rule import.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DomainRuleImport {
    pub domain: String,
    #[serde(default = "default_allowed")]
    pub is_allowed: bool,
    #[serde(default)]
    pub description: String,
}

fn default_allowed() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminStats {
    pub uploads: TrackerStats,
    pub service: StatsSnapshot,
    pub notifications: DispatchSnapshot,
}

pub struct Admin {
    repo: Arc<dyn Repository>,
    tracker: Tracker,
    policy: Arc<DomainPolicy>,
    pipeline: Arc<Pipeline>,
    notifications: NotificationQueue,
}

impl Admin {
    pub fn new(
        repo: Arc<dyn Repository>,
        policy: Arc<DomainPolicy>,
        pipeline: Arc<Pipeline>,
        notifications: NotificationQueue,
    ) -> Self {
        Self {
            tracker: Tracker::new(repo.clone()),
            repo,
            policy,
            pipeline,
            notifications,
        }
    }

    /// Public status query. Reviewer identity is never exposed here.
    pub async fn lookup(&self, tracker_id: &str) -> Result<Lookup, Error> {
        Ok(match self.tracker.lookup(tracker_id).await? {
            Lookup::Found(view) => Lookup::Found(StatusView {
                reviewer_id: None,
                ..view
            }),
            Lookup::NotFound => Lookup::NotFound,
        })
    }

    /// Moves an upload along the status machine and tells the sender once it is final.
    pub async fn advance_status(
        &self,
        tracker_id: &str,
        to: ProcessingStatus,
        reviewer_id: Option<String>,
        comment: Option<String>,
    ) -> Result<StatusView, Error> {
        let id = TrackerId::parse(tracker_id)
            .ok_or_else(|| Error::NotFound(tracker_id.to_string()))?;
        let record = self
            .repo
            .find_upload(id.as_str())
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let from = record.processing_status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let change = StatusChange {
            from,
            to,
            processed_at: to.is_terminal().then(Utc::now),
            reviewer_id,
            review_comment: comment,
        };
        // Someone else moved it since we looked.
        let updated = self
            .repo
            .change_status(id.as_str(), &change)
            .await?
            .ok_or_else(|| Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })?;
        log::info!("Upload {id} moved from {from} to {to}");

        if to.is_terminal() {
            let view = StatusView::from(updated.clone());
            self.notifications.send_status_update(
                &id,
                &updated.sender_address,
                &updated.original_filename,
                to,
                view.rejection_reason,
            );
        }
        Ok(updated.into())
    }

    pub async fn list_domain_rules(&self) -> Result<Vec<DomainRule>, Error> {
        self.repo.list_domain_rules().await
    }

    pub async fn set_domain_rule(
        &self,
        domain: &str,
        is_allowed: bool,
        description: &str,
    ) -> Result<DomainRule, Error> {
        let domain = domain.trim().to_lowercase();
        if !is_valid_domain(&domain) {
            return Err(Error::InvalidInput(format!("`{domain}` is not a domain")));
        }
        let rule = self
            .repo
            .upsert_domain_rule(&domain, is_allowed, description.trim())
            .await?;
        self.policy.invalidate(&domain);
        Ok(rule)
    }

    pub async fn delete_domain_rule(&self, domain: &str) -> Result<bool, Error> {
        let domain = domain.trim().to_lowercase();
        let deleted = self.repo.delete_domain_rule(&domain).await?;
        self.policy.invalidate(&domain);
        Ok(deleted)
    }

    /// Applies every row it can; bad rows are reported, not fatal.
    pub async fn import_domain_rules(&self, rows: &[DomainRuleImport]) -> ImportReport {
        let mut report = ImportReport {
            total: rows.len(),
            ..Default::default()
        };
        for row in rows {
            match self
                .set_domain_rule(&row.domain, row.is_allowed, &row.description)
                .await
            {
                Ok(_) => report.success += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("{}: {e}", row.domain));
                }
            }
        }
        log::info!(
            "Imported domain rules: {} of {} applied",
            report.success,
            report.total
        );
        report
    }

    pub async fn list_attachment_rules(&self) -> Result<Vec<AttachmentRule>, Error> {
        self.repo.list_attachment_rules().await
    }

    pub async fn set_attachment_rule(
        &self,
        rule: &AttachmentRuleInput,
    ) -> Result<AttachmentRule, Error> {
        if rule.name.trim().is_empty() {
            return Err(Error::InvalidInput("rule name is empty".to_string()));
        }
        if rule.max_file_size <= 0 || rule.max_file_count <= 0 {
            return Err(Error::InvalidInput(
                "size and count limits must be positive".to_string(),
            ));
        }
        self.repo.upsert_attachment_rule(rule).await
    }

    pub async fn delete_attachment_rule(&self, name: &str) -> Result<bool, Error> {
        self.repo.delete_attachment_rule(name).await
    }

    /// Runs a poll cycle now, after any cycle already in progress.
    pub async fn trigger_cycle(&self) -> Result<CycleReport, Error> {
        self.pipeline.run_cycle().await
    }

    pub async fn stats(&self) -> Result<AdminStats, Error> {
        Ok(AdminStats {
            uploads: self.tracker.stats().await?,
            service: self.pipeline.stats().snapshot(),
            notifications: self.notifications.stats().snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::db::SqliteRepository;
    use crate::db::tests::{new_upload, test_repository};
    use crate::fetcher::tests::FakeFetcher;
    use crate::notifier::tests::FakeSender;
    use crate::notifier::{self, Dispatcher, NotifierSettings};
    use crate::rate_limiter::RateCounter;
    use rstest::*;
    use testresult::TestResult;

    const ID: &str = "EMAIL-1A2B3C4D-9F0E-4821";

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: Arc<SqliteRepository>,
        policy: Arc<DomainPolicy>,
        sender: Arc<FakeSender>,
        dispatcher: Dispatcher,
        admin: Admin,
    }

    async fn fixture(whitelist: bool) -> Result<Fixture, Box<dyn std::error::Error>> {
        let (dir, repo) = test_repository().await?;
        let repo = Arc::new(repo);
        let mut config = test_config();
        config.upload_dir = dir.path().join("uploads");
        config.whitelist_enabled = whitelist;

        let sender = Arc::new(FakeSender::default());
        let (queue, dispatcher) =
            notifier::channel(16, sender.clone(), NotifierSettings::from_config(&config));
        let policy = Arc::new(DomainPolicy::new(&config, repo.clone()));
        let pipeline = Arc::new(Pipeline::new(
            &config,
            repo.clone(),
            policy.clone(),
            Arc::new(RateCounter::new(repo.clone(), 5, 20)),
            Arc::new(FakeFetcher::default()),
            queue.clone(),
            Arc::default(),
        ));
        let admin = Admin::new(repo.clone(), policy.clone(), pipeline, queue);
        Ok(Fixture {
            _dir: dir,
            repo,
            policy,
            sender,
            dispatcher,
            admin,
        })
    }

    #[tokio::test]
    async fn test_lookup_redacts_reviewer() -> TestResult {
        let f = fixture(false).await?;
        f.repo.create_upload(&new_upload(ID, "report.pdf")).await?;
        f.admin
            .advance_status(ID, ProcessingStatus::Processing, Some("rev-7".into()), None)
            .await?;

        let Lookup::Found(view) = f.admin.lookup(&ID.to_lowercase()).await? else {
            return Err("not found".into());
        };
        assert_eq!(view.status, ProcessingStatus::Processing);
        assert_eq!(view.reviewer_id, None);
        assert_eq!(
            f.repo.find_upload(ID).await?.and_then(|r| r.reviewer_id),
            Some("rev-7".to_string())
        );
        assert_eq!(f.admin.lookup("EMAIL-00000000-0000-0000").await?, Lookup::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_final_status_notifies_sender() -> TestResult {
        let mut f = fixture(false).await?;
        f.repo.create_upload(&new_upload(ID, "report.pdf")).await?;

        let view = f
            .admin
            .advance_status(ID, ProcessingStatus::Rejected, None, Some("blurry scan".into()))
            .await?;
        assert!(view.processed_at.is_some());
        assert_eq!(view.rejection_reason.as_deref(), Some("blurry scan"));

        f.dispatcher.flush().await;
        let sent = f.sender.sent.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(sent.len(), 1);
        let (to, mail) = sent.first().ok_or("nothing sent")?;
        assert_eq!(to, "user@allowed.com");
        assert!(mail.text.contains("blurry scan"));
        Ok(())
    }

    #[rstest]
    #[case(ProcessingStatus::Completed)]
    #[case(ProcessingStatus::Pending)]
    #[tokio::test]
    async fn test_invalid_transition_refused(#[case] to: ProcessingStatus) -> TestResult {
        let f = fixture(false).await?;
        f.repo.create_upload(&new_upload(ID, "report.pdf")).await?;
        let result = f.admin.advance_status(ID, to, None, None).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tracker_is_not_found() -> TestResult {
        let f = fixture(false).await?;
        let result = f
            .admin
            .advance_status(ID, ProcessingStatus::Processing, None, None)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_rule_edit_invalidates_cache() -> TestResult {
        let f = fixture(true).await?;
        assert!(!f.policy.is_domain_allowed("user@partner.org").await?.allowed);

        f.admin.set_domain_rule("Partner.ORG", true, "partner").await?;
        assert!(f.policy.is_domain_allowed("user@partner.org").await?.allowed);

        assert!(f.admin.delete_domain_rule("partner.org").await?);
        assert!(!f.policy.is_domain_allowed("user@partner.org").await?.allowed);
        Ok(())
    }

    #[tokio::test]
    async fn test_import_reports_failures() -> TestResult {
        let f = fixture(true).await?;
        let rows = vec![
            DomainRuleImport {
                domain: "a.com".into(),
                is_allowed: true,
                description: String::new(),
            },
            DomainRuleImport {
                domain: "not a domain".into(),
                is_allowed: true,
                description: String::new(),
            },
            DomainRuleImport {
                domain: "spam.net".into(),
                is_allowed: false,
                description: "spam".into(),
            },
        ];
        let report = f.admin.import_domain_rules(&rows).await;
        assert_eq!(report.total, 3);
        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(f.admin.list_domain_rules().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_attachment_rule_validation() -> TestResult {
        let f = fixture(false).await?;
        let mut input = AttachmentRuleInput {
            name: "docs".into(),
            max_file_size: 0,
            max_file_count: 3,
            allowed_extensions: vec![".pdf".into()],
            blocked_extensions: vec![],
            is_active: true,
        };
        assert!(matches!(
            f.admin.set_attachment_rule(&input).await,
            Err(Error::InvalidInput(_))
        ));
        input.max_file_size = 1024;
        f.admin.set_attachment_rule(&input).await?;
        assert_eq!(f.admin.list_attachment_rules().await?.len(), 1);
        assert!(f.admin.delete_attachment_rule("docs").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_and_trigger() -> TestResult {
        let f = fixture(false).await?;
        f.repo.create_upload(&new_upload(ID, "report.pdf")).await?;
        let report = f.admin.trigger_cycle().await?;
        assert_eq!(report.messages, 0);

        let stats = f.admin.stats().await?;
        assert_eq!(stats.uploads.pending, 1);
        assert_eq!(stats.uploads.total, 1);
        assert!(stats.service.last_check.is_some());
        Ok(())
    }
}
