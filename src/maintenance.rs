//! Periodic cleanup.
//!
//! Every step only removes what has expired, so a pass with nothing to do
//! changes nothing.

use crate::config::Config;
use crate::db::Repository;
use crate::error::Error;
use crate::ingest::Stats;
use crate::policy::DomainPolicy;
use crate::rate_limiter::RateCounter;
use crate::storage::AttachmentStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rate_records: u64,
    pub rejected_uploads: usize,
    pub files_removed: usize,
    pub cache_entries: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Maintenance {
    repo: Arc<dyn Repository>,
    rate: Arc<RateCounter>,
    policy: Arc<DomainPolicy>,
    store: AttachmentStore,
    stats: Arc<Stats>,
    rate_retention: Duration,
    rejected_retention: Duration,
}

impl Maintenance {
    pub fn new(
        config: &Config,
        repo: Arc<dyn Repository>,
        rate: Arc<RateCounter>,
        policy: Arc<DomainPolicy>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            repo,
            rate,
            policy,
            store: AttachmentStore::new(&config.upload_dir),
            stats,
            rate_retention: Duration::days(i64::from(config.rate_record_retention_days)),
            rejected_retention: Duration::days(i64::from(config.rejected_retention_days)),
        }
    }

    pub async fn run(&self) -> Result<MaintenanceReport, Error> {
        self.run_at(Utc::now()).await
    }

    async fn run_at(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, Error> {
        let mut report = MaintenanceReport {
            rate_records: self.rate.purge_stale(now - self.rate_retention).await?,
            ..Default::default()
        };

        for upload in self.repo.rejected_before(now - self.rejected_retention).await? {
            match self.store.delete(&upload.stored_reference).await {
                Ok(true) => report.files_removed += 1,
                Ok(false) => {}
                Err(e) => {
                    // Keep the record so the file is retried next pass.
                    log::warn!(
                        "Cannot remove {} of {}: {e}",
                        upload.stored_reference,
                        upload.tracker_id
                    );
                    continue;
                }
            }
            if self.repo.delete_upload(upload.id).await? {
                report.rejected_uploads += 1;
            }
        }

        report.cache_entries = self.policy.purge_expired();
        self.stats.maintained();

        if report.is_empty() {
            log::debug!("Maintenance: nothing expired");
        } else {
            log::info!(
                "Maintenance: {} rate records, {} rejected uploads, {} files, {} cached domains removed",
                report.rate_records,
                report.rejected_uploads,
                report.files_removed,
                report.cache_entries
            );
        }
        Ok(report)
    }
}
