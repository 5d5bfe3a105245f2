//! Poll cycle: fetch, parse, apply sender policy, store attachments, create records.

use crate::attachment::{AttachmentPolicy, FileInfo, FileTypeTag, Rejection, Validation};
use crate::config::Config;
use crate::db::{NewUpload, Repository, UploadRecord, is_unique_violation};
use crate::error::Error;
use crate::fetcher::{MailFetcher, Mailbox, MessageHandle};
use crate::message::{self, AttachmentCandidate, ParsedMessage};
use crate::notifier::{Notification, NotificationQueue};
use crate::policy::DomainPolicy;
use crate::rate_limiter::{Admission, LimitKind, NoticeThrottle, RateCounter};
use crate::storage::AttachmentStore;
use crate::tracker::TrackerId;
use crate::utils::{mask_address, sender_hash};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Tracker id generation is retried this often on a uniqueness collision.
const TRACKER_ATTEMPTS: u32 = 3;

/// Counters shared between the pipeline, maintenance and the admin surface.
#[derive(Debug, Default)]
pub struct Stats {
    processed_messages: AtomicU64,
    saved_attachments: AtomicU64,
    rejected_attachments: AtomicU64,
    denied_messages: AtomicU64,
    notifications_queued: AtomicU64,
    errors: AtomicU64,
    last_check: Mutex<Option<DateTime<Utc>>>,
    last_maintenance: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed_messages: u64,
    pub saved_attachments: u64,
    pub rejected_attachments: u64,
    pub denied_messages: u64,
    pub notifications_queued: u64,
    pub errors: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_maintenance: Option<DateTime<Utc>>,
}

impl Stats {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        Self::add(&self.errors, 1);
    }

    fn touch(slot: &Mutex<Option<DateTime<Utc>>>) {
        if let Ok(mut slot) = slot.lock() {
            *slot = Some(Utc::now());
        }
    }

    pub fn checked(&self) {
        Self::touch(&self.last_check);
    }

    pub fn maintained(&self) {
        Self::touch(&self.last_maintenance);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |slot: &Mutex<Option<DateTime<Utc>>>| slot.lock().ok().and_then(|t| *t);
        StatsSnapshot {
            processed_messages: self.processed_messages.load(Ordering::Relaxed),
            saved_attachments: self.saved_attachments.load(Ordering::Relaxed),
            rejected_attachments: self.rejected_attachments.load(Ordering::Relaxed),
            denied_messages: self.denied_messages.load(Ordering::Relaxed),
            notifications_queued: self.notifications_queued.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_check: read(&self.last_check),
            last_maintenance: read(&self.last_maintenance),
        }
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub messages: usize,
    pub uploads: usize,
    pub rejected_attachments: usize,
    pub denied: usize,
    pub errors: usize,
}

/// How a single message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Skipped,
    Denied,
    Processed { saved: usize, rejected: usize },
    /// Handled up to a storage failure.
    Aborted { saved: usize, rejected: usize },
}

/// Drives messages from the mailbox through policy, validation and storage.
pub struct Pipeline {
    repo: Arc<dyn Repository>,
    fetcher: Arc<dyn MailFetcher>,
    policy: Arc<DomainPolicy>,
    rate: Arc<RateCounter>,
    store: AttachmentStore,
    notifications: NotificationQueue,
    throttle: NoticeThrottle,
    stats: Arc<Stats>,
    default_attachment_policy: AttachmentPolicy,
    config: Config,
    cycle_timeout: Duration,
    // Held for the whole cycle, so cycles never overlap.
    connection: tokio::sync::Mutex<Option<Box<dyn Mailbox>>>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        repo: Arc<dyn Repository>,
        policy: Arc<DomainPolicy>,
        rate: Arc<RateCounter>,
        fetcher: Arc<dyn MailFetcher>,
        notifications: NotificationQueue,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            repo,
            fetcher,
            policy,
            rate,
            store: AttachmentStore::new(&config.upload_dir),
            notifications,
            throttle: NoticeThrottle::new(),
            stats,
            default_attachment_policy: AttachmentPolicy::from_config(config),
            config: config.clone(),
            cycle_timeout: config.cycle_timeout(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Runs one poll cycle.
    ///
    /// Connecting, listing and reading are bounded by the cycle timeout. A message
    /// that has been read is handled to the end and only then marked read, so a
    /// cycle that runs out of time stops between messages and leaves the rest
    /// unread. Waits for a cycle that is already running. On failure or timeout
    /// the connection is dropped and rebuilt next time.
    pub async fn run_cycle(&self) -> Result<CycleReport, Error> {
        let mut connection = self.connection.lock().await;
        self.stats.checked();
        let deadline = Instant::now() + self.cycle_timeout;

        let error = match self.cycle(&mut connection, deadline).await {
            Ok(report) => {
                if report.messages > 0 {
                    log::info!(
                        "Poll cycle: {} messages, {} uploads, {} attachments rejected, {} denied, {} errors",
                        report.messages,
                        report.uploads,
                        report.rejected_attachments,
                        report.denied,
                        report.errors
                    );
                } else {
                    log::debug!("Poll cycle: no new messages");
                }
                return Ok(report);
            }
            Err(e) => e,
        };

        log::error!("Poll cycle failed: {error}");
        self.stats.record_error();
        // The session may be mid-command; a fresh one is built next cycle.
        *connection = None;
        Err(error)
    }

    /// Disconnects the cached mailbox connection, if any.
    pub async fn shutdown(&self) {
        if let Some(mailbox) = self.connection.lock().await.take() {
            mailbox.disconnect().await;
        }
    }

    fn timed_out(&self) -> Error {
        Error::Timeout(self.cycle_timeout.as_secs())
    }

    async fn within<T>(
        &self,
        deadline: Instant,
        work: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::time::timeout_at(deadline, work)
            .await
            .unwrap_or_else(|_| Err(self.timed_out()))
    }

    async fn cycle(
        &self,
        slot: &mut Option<Box<dyn Mailbox>>,
        deadline: Instant,
    ) -> Result<CycleReport, Error> {
        let mailbox = self.within(deadline, self.ensure_connected(slot)).await?;
        let handles = self.within(deadline, mailbox.list_unread()).await?;

        let mut report = CycleReport::default();
        for (done, &handle) in handles.iter().enumerate() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Poll cycle out of time, leaving {} messages for the next one",
                    handles.len() - done
                );
                return Err(self.timed_out());
            }
            report.messages += 1;

            let raw = match self.within(deadline, mailbox.read(handle)).await {
                Ok(raw) => raw,
                Err(e @ Error::Timeout(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Cannot read message {handle}, leaving it unread: {e}");
                    self.stats.record_error();
                    report.errors += 1;
                    continue;
                }
            };

            match self.handle_message(handle, &raw).await {
                Outcome::Skipped => {}
                Outcome::Denied => report.denied += 1,
                Outcome::Processed { saved, rejected } => {
                    report.uploads += saved;
                    report.rejected_attachments += rejected;
                }
                Outcome::Aborted { saved, rejected } => {
                    report.uploads += saved;
                    report.rejected_attachments += rejected;
                    report.errors += 1;
                }
            }

            if !self.config.mark_as_read {
                continue;
            }
            match tokio::time::timeout(self.cycle_timeout, mailbox.mark_processed(handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("Cannot mark message {handle} read, it will be handled again: {e}");
                    self.stats.record_error();
                    report.errors += 1;
                }
                Err(_) => return Err(self.timed_out()),
            }
        }
        Ok(report)
    }

    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<Box<dyn Mailbox>>,
    ) -> Result<&'a mut Box<dyn Mailbox>, Error> {
        let probe = match slot.as_mut() {
            Some(mailbox) => Some(mailbox.probe().await),
            None => None,
        };
        if let Some(Err(e)) = probe {
            log::warn!("Mailbox connection lost, reconnecting: {e}");
            *slot = None;
        }
        if slot.is_none() {
            *slot = Some(self.fetcher.connect().await?);
        }
        slot.as_mut()
            .ok_or_else(|| Error::Connectivity("no mailbox connection".to_string()))
    }

    /// Settles the fate of one message. Nothing in here is cut short by the cycle timeout.
    async fn handle_message(&self, handle: MessageHandle, raw: &[u8]) -> Outcome {
        Stats::add(&self.stats.processed_messages, 1);

        let parsed = match message::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Skipping malformed message {handle}: {e}");
                return Outcome::Skipped;
            }
        };
        let Some(sender) = parsed.sender.clone() else {
            log::debug!("Skipping message {handle} without a usable sender");
            return Outcome::Skipped;
        };
        if self.config.is_system_sender(&sender) {
            log::debug!("Skipping system message from {}", mask_address(&sender));
            return Outcome::Skipped;
        }

        self.ingest(&sender, parsed).await
    }

    async fn ingest(&self, sender: &str, parsed: ParsedMessage) -> Outcome {
        let masked = mask_address(sender);

        let verdict = match self.policy.is_domain_allowed(sender).await {
            Ok(verdict) => verdict,
            Err(e) => {
                log::error!("Domain check for {masked} failed, dropping message: {e}");
                self.stats.record_error();
                return Outcome::Aborted {
                    saved: 0,
                    rejected: 0,
                };
            }
        };
        if !verdict.allowed {
            log::warn!("Message from {masked} denied: {}", verdict.reason);
            Stats::add(&self.stats.denied_messages, 1);
            if let Some((_, domain)) = sender.rsplit_once('@') {
                self.notify_throttled(
                    sender,
                    "domain_blocked",
                    Notification::DomainBlocked {
                        recipient: sender.to_string(),
                        domain: domain.to_string(),
                        reason: verdict.reason.to_string(),
                    },
                );
            }
            return Outcome::Denied;
        }

        if parsed.attachments.is_empty() {
            log::info!("Message from {masked} has no attachments");
            return Outcome::Processed {
                saved: 0,
                rejected: 0,
            };
        }

        let hash = sender_hash(sender);
        if let Admission::Denied {
            reason,
            hourly,
            daily,
            resets_at,
        } = self.rate.check_and_reserve(sender, &hash).await
        {
            log::warn!("Message from {masked} denied: {}", reason.as_str());
            Stats::add(&self.stats.denied_messages, 1);
            let (count, limit) = match reason {
                LimitKind::Hourly => (hourly, self.rate.hourly_limit()),
                LimitKind::Daily => (daily, self.rate.daily_limit()),
            };
            self.notify_throttled(
                sender,
                reason.as_str(),
                Notification::RateLimited {
                    recipient: sender.to_string(),
                    kind: reason,
                    count,
                    limit,
                    resets_at,
                },
            );
            return Outcome::Denied;
        }

        let policy = self.attachment_policy().await;
        let mut saved = 0;
        let mut rejected = 0;
        for (index, candidate) in parsed.attachments.iter().enumerate() {
            let validation = if index >= policy.max_file_count {
                Validation::Invalid(Rejection::TooMany(policy.max_file_count))
            } else {
                policy.validate(&candidate.filename, &candidate.data)
            };
            let info = match validation {
                Validation::Valid(info) => info,
                Validation::Invalid(rejection) => {
                    log::warn!(
                        "Attachment {:?} from {masked} rejected: {rejection}",
                        candidate.filename
                    );
                    rejected += 1;
                    Stats::add(&self.stats.rejected_attachments, 1);
                    self.notify_throttled(
                        sender,
                        "file_rejected",
                        Notification::FileRejected {
                            recipient: sender.to_string(),
                            filename: candidate.filename.clone(),
                            reason: rejection.to_string(),
                            subject: parsed.subject.clone(),
                        },
                    );
                    continue;
                }
            };

            match self.save(sender, &hash, &parsed, candidate, &info).await {
                Ok((tracker_id, record)) => {
                    saved += 1;
                    Stats::add(&self.stats.saved_attachments, 1);
                    log::info!(
                        "Saved {:?} from {masked} as {tracker_id} ({} bytes)",
                        record.original_filename,
                        record.file_size_bytes
                    );
                    let queued = self.notifications.send_confirmation(
                        &tracker_id,
                        sender,
                        &record.original_filename,
                        info.size as u64,
                        record.received_at,
                    );
                    if queued {
                        Stats::add(&self.stats.notifications_queued, 1);
                    }
                }
                Err(e) => {
                    log::error!(
                        "Failed to save attachment from {masked}, abandoning the rest of the message: {e}"
                    );
                    self.stats.record_error();
                    return Outcome::Aborted { saved, rejected };
                }
            }
        }
        Outcome::Processed { saved, rejected }
    }

    /// First active attachment rule, or the configured defaults.
    async fn attachment_policy(&self) -> AttachmentPolicy {
        match self.repo.active_attachment_rule().await {
            Ok(Some(rule)) => AttachmentPolicy::from_rule(&rule),
            Ok(None) => self.default_attachment_policy.clone(),
            Err(e) => {
                log::warn!("Cannot load attachment rule, using defaults: {e}");
                self.default_attachment_policy.clone()
            }
        }
    }

    async fn save(
        &self,
        sender: &str,
        hash: &str,
        parsed: &ParsedMessage,
        candidate: &AttachmentCandidate,
        info: &FileInfo,
    ) -> Result<(TrackerId, UploadRecord), Error> {
        let reference = self.store.store(&candidate.data, hash, info).await?;

        let upload = NewUpload {
            tracker_id: String::new(),
            sender_hash: hash.to_string(),
            sender_address: sender.to_string(),
            original_filename: candidate.filename.clone(),
            stored_reference: reference.clone(),
            file_size_bytes: i64::try_from(info.size).unwrap_or(i64::MAX),
            file_type_tag: FileTypeTag::from_filename(&candidate.filename)
                .as_str()
                .to_string(),
            source_subject: parsed.subject.clone(),
            received_at: Utc::now(),
            extra_metadata: serde_json::json!({
                "source": "email",
                "sender": mask_address(sender),
                "subject": parsed.subject,
                "message_id": parsed.message_id,
                "original_filename": candidate.filename,
                "stored_filename": reference,
                "content_hash": info.hash,
                "mime_type": info.mime_type,
            }),
        };

        match self.create_record(upload).await {
            Ok(created) => Ok(created),
            Err(e) => {
                if let Err(cleanup) = self.store.delete(&reference).await {
                    log::warn!("Cannot remove orphaned file {reference}: {cleanup}");
                }
                Err(e)
            }
        }
    }

    async fn create_record(&self, mut upload: NewUpload) -> Result<(TrackerId, UploadRecord), Error> {
        let mut attempt = 1;
        loop {
            let tracker_id = TrackerId::generate(&self.config.tracker_prefix);
            upload.tracker_id = tracker_id.to_string();
            match self.repo.create_upload(&upload).await {
                Ok(record) => return Ok((tracker_id, record)),
                Err(e) if is_unique_violation(&e) && attempt < TRACKER_ATTEMPTS => {
                    log::warn!("Tracker id {tracker_id} already taken, generating another");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn notify_throttled(&self, sender: &str, kind: &'static str, notification: Notification) {
        if !self.throttle.allow(sender, kind) {
            log::debug!("Not repeating {kind} notice to {}", mask_address(sender));
            return;
        }
        if self.notifications.enqueue(notification) {
            Stats::add(&self.stats.notifications_queued, 1);
        }
    }
}
