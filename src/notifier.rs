//! Notifications to senders.
//!
//! The pipeline never talks SMTP itself. It pushes [`Notification`]s into a
//! bounded [`NotificationQueue`]; a [`Dispatcher`] task drains the queue in
//! batches and submits each batch over a single outbound session.

use crate::config::Config;
use crate::error::Error;
use crate::rate_limiter::LimitKind;
use crate::templates::{
    DOMAIN_BLOCKED, FILE_REJECTED, RATE_LIMIT, RenderedMail, TRACKER_CONFIRMATION, Template,
    UPLOAD_FAILED, UPLOAD_SUCCESS, Vars,
};
use crate::tracker::{ProcessingStatus, TrackerId};
use crate::utils::{human_size, mask_address};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const QUEUE_CAPACITY: usize = 256;
const MAX_BATCH: usize = 50;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Opens outbound sessions.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn open(&self) -> Result<Box<dyn OutboundSession>, Error>;
}

/// One open connection to the relay.
#[async_trait]
pub trait OutboundSession: Send {
    async fn send(&mut self, to: &str, mail: &RenderedMail) -> Result<(), Error>;
    async fn close(self: Box<Self>);
}

/// A mail the pipeline wants delivered to a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Confirmation {
        recipient: String,
        tracker_id: TrackerId,
        filename: String,
        size: u64,
        received_at: DateTime<Utc>,
    },
    StatusUpdate {
        recipient: String,
        tracker_id: TrackerId,
        filename: String,
        status: ProcessingStatus,
        error: Option<String>,
    },
    RateLimited {
        recipient: String,
        kind: LimitKind,
        count: u32,
        limit: u32,
        resets_at: DateTime<Utc>,
    },
    DomainBlocked {
        recipient: String,
        domain: String,
        reason: String,
    },
    FileRejected {
        recipient: String,
        filename: String,
        reason: String,
        subject: String,
    },
}

/// Values shared by every template.
#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub frontend_url: String,
    pub support_email: String,
    pub system_name: String,
    pub max_file_size: u64,
    pub max_file_count: usize,
    pub allowed_types: String,
}

impl NotifierSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frontend_url: config.frontend_url.trim_end_matches('/').to_string(),
            support_email: if config.support_email.is_empty() {
                config.smtp_from().to_string()
            } else {
                config.support_email.clone()
            },
            system_name: config.system_name.clone(),
            max_file_size: config.max_attachment_size as u64,
            max_file_count: config.max_attachment_count,
            allowed_types: config.allowed_extensions.join(", "),
        }
    }

    fn query_url(&self, tracker_id: &TrackerId) -> String {
        format!("{}/tracker/{tracker_id}", self.frontend_url)
    }
}

impl Notification {
    pub fn recipient(&self) -> &str {
        match self {
            Self::Confirmation { recipient, .. }
            | Self::StatusUpdate { recipient, .. }
            | Self::RateLimited { recipient, .. }
            | Self::DomainBlocked { recipient, .. }
            | Self::FileRejected { recipient, .. } => recipient,
        }
    }

    fn template(&self) -> Template {
        match self {
            Self::Confirmation { .. } => TRACKER_CONFIRMATION,
            Self::StatusUpdate {
                status: ProcessingStatus::Completed,
                ..
            } => UPLOAD_SUCCESS,
            Self::StatusUpdate { .. } => UPLOAD_FAILED,
            Self::RateLimited { .. } => RATE_LIMIT,
            Self::DomainBlocked { .. } => DOMAIN_BLOCKED,
            Self::FileRejected { .. } => FILE_REJECTED,
        }
    }

    pub fn render(&self, settings: &NotifierSettings) -> Result<RenderedMail, Error> {
        self.render_at(settings, Utc::now())
    }

    fn render_at(
        &self,
        settings: &NotifierSettings,
        now: DateTime<Utc>,
    ) -> Result<RenderedMail, Error> {
        let now = now.format(TIME_FORMAT).to_string();
        let vars = Vars::new().set("system_name", settings.system_name.as_str());
        let vars = match self {
            Self::Confirmation {
                recipient,
                tracker_id,
                filename,
                size,
                received_at,
            } => vars
                .set("tracker_id", tracker_id.as_str())
                .set("filename", filename.as_str())
                .set("file_size", human_size(*size))
                .set("recipient_email", recipient.as_str())
                .set("upload_time", received_at.format(TIME_FORMAT).to_string())
                .set("query_url", settings.query_url(tracker_id))
                .set("support_email", settings.support_email.as_str()),
            Self::StatusUpdate {
                recipient,
                tracker_id,
                filename,
                status,
                error,
            } => vars
                .set("tracker_id", tracker_id.as_str())
                .set("filename", filename.as_str())
                .set("status", status.label())
                .set("recipient_email", recipient.as_str())
                .set("update_time", now)
                .set("query_url", settings.query_url(tracker_id))
                .set("support_email", settings.support_email.as_str())
                .set("error_message", error.as_deref().unwrap_or("Not specified")),
            Self::RateLimited {
                kind,
                count,
                limit,
                resets_at,
                ..
            } => vars
                .set(
                    "limit_type",
                    match kind {
                        LimitKind::Hourly => "hourly",
                        LimitKind::Daily => "daily",
                    },
                )
                .set("current_count", count.to_string())
                .set("limit_count", limit.to_string())
                .set("reset_time", resets_at.format(TIME_FORMAT).to_string())
                .set("web_upload_url", settings.frontend_url.as_str())
                .set("send_time", now),
            Self::DomainBlocked { domain, reason, .. } => vars
                .set("domain", domain.as_str())
                .set("reason", reason.as_str())
                .set("contact_email", settings.support_email.as_str())
                .set("send_time", now),
            Self::FileRejected {
                filename,
                reason,
                subject,
                ..
            } => vars
                .set("filename", filename.as_str())
                .set("reason", reason.as_str())
                .set("source_subject", subject.as_str())
                .set("max_file_size", human_size(settings.max_file_size))
                .set("max_file_count", settings.max_file_count.to_string())
                .set("allowed_types", settings.allowed_types.as_str())
                .set("web_upload_url", settings.frontend_url.as_str())
                .set("send_time", now),
        };
        self.template().render(&vars)
    }
}

/// Delivery counters of the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub queued: AtomicU64,
    pub dropped: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub queued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the notification queue.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: Option<mpsc::Sender<Notification>>,
    stats: Arc<DispatchStats>,
}

impl NotificationQueue {
    /// A queue that discards everything, for `auto_reply_enabled = false`.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            stats: Arc::default(),
        }
    }

    /// Queues a notification without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, notification: Notification) -> bool {
        let Some(tx) = &self.tx else {
            log::debug!("Auto replies disabled, not notifying");
            return false;
        };
        match tx.try_send(notification) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(n)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Notification queue full, dropping mail to {}",
                    mask_address(n.recipient())
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Notification dispatcher stopped, dropping mail to {}",
                    mask_address(n.recipient())
                );
                false
            }
        }
    }

    pub fn send_confirmation(
        &self,
        tracker_id: &TrackerId,
        recipient: &str,
        filename: &str,
        size: u64,
        received_at: DateTime<Utc>,
    ) -> bool {
        self.enqueue(Notification::Confirmation {
            recipient: recipient.to_string(),
            tracker_id: tracker_id.clone(),
            filename: filename.to_string(),
            size,
            received_at,
        })
    }

    pub fn send_status_update(
        &self,
        tracker_id: &TrackerId,
        recipient: &str,
        filename: &str,
        status: ProcessingStatus,
        error: Option<String>,
    ) -> bool {
        self.enqueue(Notification::StatusUpdate {
            recipient: recipient.to_string(),
            tracker_id: tracker_id.clone(),
            filename: filename.to_string(),
            status,
            error,
        })
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Consumer side of the notification queue.
pub struct Dispatcher {
    rx: mpsc::Receiver<Notification>,
    sender: Arc<dyn MailSender>,
    settings: NotifierSettings,
    stats: Arc<DispatchStats>,
}

/// Creates a connected queue and dispatcher.
pub fn channel(
    capacity: usize,
    sender: Arc<dyn MailSender>,
    settings: NotifierSettings,
) -> (NotificationQueue, Dispatcher) {
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(DispatchStats::default());
    (
        NotificationQueue {
            tx: Some(tx),
            stats: stats.clone(),
        },
        Dispatcher {
            rx,
            sender,
            settings,
            stats,
        },
    )
}

impl Dispatcher {
    /// Sends batches until cancelled or every queue handle is gone, then
    /// delivers whatever is still queued.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };
            let mut batch = vec![first];
            self.fill_batch(&mut batch);
            self.send_batch(batch).await;
        }
        let report = self.flush().await;
        if report.sent + report.failed > 0 {
            log::info!(
                "Flushed notification queue: {} sent, {} failed",
                report.sent,
                report.failed
            );
        }
    }

    /// Sends everything queued right now.
    pub async fn flush(&mut self) -> BatchReport {
        let mut total = BatchReport::default();
        loop {
            let mut batch = Vec::new();
            self.fill_batch(&mut batch);
            if batch.is_empty() {
                return total;
            }
            let report = self.send_batch(batch).await;
            total.sent += report.sent;
            total.failed += report.failed;
        }
    }

    fn fill_batch(&mut self, batch: &mut Vec<Notification>) {
        while batch.len() < MAX_BATCH {
            match self.rx.try_recv() {
                Ok(notification) => batch.push(notification),
                Err(_) => break,
            }
        }
    }

    async fn send_batch(&self, batch: Vec<Notification>) -> BatchReport {
        let mut report = BatchReport::default();

        let mut rendered = Vec::with_capacity(batch.len());
        for notification in batch {
            match notification.render(&self.settings) {
                Ok(mail) => rendered.push((notification, mail)),
                Err(e) => {
                    log::warn!(
                        "Not notifying {}: {e}",
                        mask_address(notification.recipient())
                    );
                    report.failed += 1;
                }
            }
        }

        if !rendered.is_empty() {
            match self.sender.open().await {
                Ok(mut session) => {
                    for (notification, mail) in &rendered {
                        let recipient = notification.recipient();
                        match session.send(recipient, mail).await {
                            Ok(()) => {
                                log::debug!("Notified {}", mask_address(recipient));
                                report.sent += 1;
                            }
                            Err(e) => {
                                log::warn!("Failed to notify {}: {e}", mask_address(recipient));
                                report.failed += 1;
                            }
                        }
                    }
                    session.close().await;
                }
                Err(e) => {
                    log::error!(
                        "Cannot open outbound session, {} notifications lost: {e}",
                        rendered.len()
                    );
                    report.failed += rendered.len();
                }
            }
        }

        self.stats
            .sent
            .fetch_add(report.sent as u64, Ordering::Relaxed);
        self.stats
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use chrono::TimeZone;
    use rstest::*;
    use std::sync::Mutex;
    use testresult::TestResult;

    /// Records every mail instead of sending it.
    #[derive(Default)]
    pub(crate) struct FakeSender {
        pub sent: Arc<Mutex<Vec<(String, RenderedMail)>>>,
        pub sessions: AtomicU64,
        pub closed: Arc<AtomicU64>,
        pub fail_open: bool,
        pub fail_to: Option<String>,
    }

    struct FakeSession {
        sent: Arc<Mutex<Vec<(String, RenderedMail)>>>,
        closed: Arc<AtomicU64>,
        fail_to: Option<String>,
    }

    #[async_trait]
    impl MailSender for FakeSender {
        async fn open(&self) -> Result<Box<dyn OutboundSession>, Error> {
            if self.fail_open {
                return Err(Error::Notification("relay down".to_string()));
            }
            self.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                sent: self.sent.clone(),
                closed: self.closed.clone(),
                fail_to: self.fail_to.clone(),
            }))
        }
    }

    #[async_trait]
    impl OutboundSession for FakeSession {
        async fn send(&mut self, to: &str, mail: &RenderedMail) -> Result<(), Error> {
            if self.fail_to.as_deref() == Some(to) {
                return Err(Error::Notification("550 mailbox unavailable".to_string()));
            }
            self.sent
                .lock()
                .map_err(|_| Error::Notification("poisoned".to_string()))?
                .push((to.to_string(), mail.clone()));
            Ok(())
        }

        async fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings() -> NotifierSettings {
        NotifierSettings::from_config(&test_config())
    }

    fn tracker_id() -> TrackerId {
        TrackerId::parse("EMAIL-1A2B3C4D-9F0E-4821").expect("valid tracker id")
    }

    fn confirmation(recipient: &str) -> Notification {
        Notification::Confirmation {
            recipient: recipient.to_string(),
            tracker_id: tracker_id(),
            filename: "report.pdf".to_string(),
            size: 1024,
            received_at: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
        }
    }

    #[test]
    fn test_confirmation_render() -> TestResult {
        let mail = confirmation("user@test.com").render(&settings())?;
        assert_eq!(mail.subject, "File received - Tracker ID: EMAIL-1A2B3C4D-9F0E-4821");
        assert!(mail.text.contains("1.0 KB"));
        assert!(mail.text.contains("2024-03-09 14:05:07 UTC"));
        assert!(
            mail.text
                .contains("http://localhost:8000/tracker/EMAIL-1A2B3C4D-9F0E-4821")
        );
        Ok(())
    }

    #[rstest]
    #[case(ProcessingStatus::Completed, "upload_success")]
    #[case(ProcessingStatus::Rejected, "upload_failed")]
    fn test_status_update_template(
        #[case] status: ProcessingStatus,
        #[case] template: &str,
    ) -> TestResult {
        let notification = Notification::StatusUpdate {
            recipient: "user@test.com".to_string(),
            tracker_id: tracker_id(),
            filename: "report.pdf".to_string(),
            status,
            error: Some("unreadable scan".to_string()),
        };
        assert_eq!(notification.template().name, template);
        let mail = notification.render(&settings())?;
        assert!(mail.text.contains(status.label()));
        Ok(())
    }

    #[test]
    fn test_rate_limit_render() -> TestResult {
        let notification = Notification::RateLimited {
            recipient: "user@test.com".to_string(),
            kind: LimitKind::Hourly,
            count: 5,
            limit: 5,
            resets_at: Utc.with_ymd_and_hms(2024, 3, 9, 15, 0, 0).unwrap(),
        };
        let mail = notification.render(&settings())?;
        assert!(mail.text.contains("hourly"));
        assert!(mail.text.contains("2024-03-09 15:00:00 UTC"));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_uses_one_session() -> TestResult {
        let sender = Arc::new(FakeSender::default());
        let (queue, mut dispatcher) = channel(8, sender.clone(), settings());
        assert!(queue.enqueue(confirmation("a@test.com")));
        assert!(queue.enqueue(confirmation("b@test.com")));
        assert!(queue.enqueue(confirmation("c@test.com")));

        let report = dispatcher.flush().await;
        assert_eq!(report, BatchReport { sent: 3, failed: 0 });
        assert_eq!(sender.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(sender.closed.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().sent.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_batch() -> TestResult {
        let sender = Arc::new(FakeSender {
            fail_to: Some("b@test.com".to_string()),
            ..Default::default()
        });
        let (queue, mut dispatcher) = channel(8, sender.clone(), settings());
        queue.enqueue(confirmation("a@test.com"));
        queue.enqueue(confirmation("b@test.com"));
        queue.enqueue(confirmation("c@test.com"));

        let report = dispatcher.flush().await;
        assert_eq!(report, BatchReport { sent: 2, failed: 1 });
        // Session is released even though a send failed.
        assert_eq!(sender.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_relay_counts_failures() -> TestResult {
        let sender = Arc::new(FakeSender {
            fail_open: true,
            ..Default::default()
        });
        let (queue, mut dispatcher) = channel(8, sender, settings());
        queue.enqueue(confirmation("a@test.com"));
        let report = dispatcher.flush().await;
        assert_eq!(report, BatchReport { sent: 0, failed: 1 });
        assert_eq!(queue.stats().failed.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_full_queue_drops() -> TestResult {
        let (queue, _dispatcher) = channel(1, Arc::new(FakeSender::default()), settings());
        assert!(queue.enqueue(confirmation("a@test.com")));
        assert!(!queue.enqueue(confirmation("b@test.com")));
        assert_eq!(queue.stats().dropped.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn test_disabled_queue_discards() {
        let queue = NotificationQueue::disabled();
        assert!(!queue.enqueue(confirmation("a@test.com")));
        assert_eq!(queue.stats().queued.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_cancel() -> TestResult {
        let sender = Arc::new(FakeSender::default());
        let (queue, dispatcher) = channel(8, sender.clone(), settings());
        queue.enqueue(confirmation("a@test.com"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher.run(cancel).await;
        assert_eq!(sender.sent.lock().map(|s| s.len()).unwrap_or(0), 1);
        Ok(())
    }
}
