//! Wiring of the pipeline, maintenance and notification dispatch into one service.

use crate::admin::Admin;
use crate::config::Config;
use crate::db::SqliteRepository;
use crate::error::Error;
use crate::fetcher::{ImapFetcher, MailFetcher};
use crate::ingest::{CycleReport, Pipeline, Stats};
use crate::maintenance::{Maintenance, MaintenanceReport};
use crate::notifier::{self, Dispatcher, MailSender, NotificationQueue, NotifierSettings};
use crate::policy::DomainPolicy;
use crate::rate_limiter::RateCounter;
use crate::smtp_client::SmtpSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct Service {
    repo: Arc<SqliteRepository>,
    pipeline: Arc<Pipeline>,
    maintenance: Arc<Maintenance>,
    admin: Arc<Admin>,
    dispatcher: Option<Dispatcher>,
    poll_interval: Duration,
    maintenance_interval: Duration,
}

impl Service {
    /// Opens the database and sets up IMAP and SMTP from the configuration.
    pub async fn build(config: &Config) -> Result<Self, Error> {
        let repo = Arc::new(SqliteRepository::connect(&config.database_path).await?);
        let sender: Option<Arc<dyn MailSender>> = config
            .auto_reply_enabled
            .then(|| Arc::new(SmtpSender::new(config)) as Arc<dyn MailSender>);
        Ok(Self::with_components(
            config,
            repo,
            Arc::new(ImapFetcher::new(config)),
            sender,
        ))
    }

    /// Assembles the service; without a sender no notifications are queued.
    pub fn with_components(
        config: &Config,
        repo: Arc<SqliteRepository>,
        fetcher: Arc<dyn MailFetcher>,
        sender: Option<Arc<dyn MailSender>>,
    ) -> Self {
        let (queue, dispatcher) = match sender {
            Some(sender) => {
                let (queue, dispatcher) = notifier::channel(
                    notifier::QUEUE_CAPACITY,
                    sender,
                    NotifierSettings::from_config(config),
                );
                (queue, Some(dispatcher))
            }
            None => (NotificationQueue::disabled(), None),
        };

        let stats = Arc::new(Stats::default());
        let policy = Arc::new(DomainPolicy::new(config, repo.clone()));
        let rate = Arc::new(RateCounter::new(
            repo.clone(),
            config.hourly_limit,
            config.daily_limit,
        ));
        let pipeline = Arc::new(Pipeline::new(
            config,
            repo.clone(),
            policy.clone(),
            rate.clone(),
            fetcher,
            queue.clone(),
            stats.clone(),
        ));
        let maintenance = Arc::new(Maintenance::new(
            config,
            repo.clone(),
            rate,
            policy.clone(),
            stats,
        ));
        let admin = Arc::new(Admin::new(repo.clone(), policy, pipeline.clone(), queue));

        Self {
            repo,
            pipeline,
            maintenance,
            admin,
            dispatcher,
            poll_interval: config.poll_interval(),
            maintenance_interval: config.maintenance_interval(),
        }
    }

    pub fn admin(&self) -> Arc<Admin> {
        self.admin.clone()
    }

    /// Polls, maintains and notifies until `cancel` fires.
    ///
    /// The dispatcher outlives the loops so notifications from a cycle still
    /// running at shutdown are delivered.
    pub async fn serve(self, cancel: CancellationToken) {
        let stop_dispatch = CancellationToken::new();
        let dispatch = self
            .dispatcher
            .map(|dispatcher| tokio::spawn(dispatcher.run(stop_dispatch.clone())));
        let tasks: [JoinHandle<()>; 2] = [
            tokio::spawn(poll_loop(
                self.pipeline.clone(),
                self.poll_interval,
                cancel.clone(),
            )),
            tokio::spawn(maintenance_loop(
                self.maintenance.clone(),
                self.maintenance_interval,
                cancel.clone(),
            )),
        ];
        log::info!(
            "Polling every {}s, maintenance every {}s",
            self.poll_interval.as_secs(),
            self.maintenance_interval.as_secs()
        );

        cancel.cancelled().await;
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Background task failed: {e}");
            }
        }
        stop_dispatch.cancel();
        if let Some(dispatch) = dispatch {
            if let Err(e) = dispatch.await {
                log::error!("Notification dispatcher failed: {e}");
            }
        }
        self.repo.close().await;
        log::info!("Stopped");
    }

    /// One poll cycle, then delivers the notifications it produced.
    pub async fn run_once(mut self) -> Result<CycleReport, Error> {
        let result = self.admin.trigger_cycle().await;
        self.pipeline.shutdown().await;
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.flush().await;
        }
        self.repo.close().await;
        result
    }

    pub async fn run_maintenance(self) -> Result<MaintenanceReport, Error> {
        let result = self.maintenance.run().await;
        self.repo.close().await;
        result
    }

    /// Delivers anything an admin command queued, then closes the database.
    pub async fn close(mut self) {
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.flush().await;
        }
        self.repo.close().await;
    }
}

async fn poll_loop(pipeline: Arc<Pipeline>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        // Failures are logged and counted by the pipeline; the next tick retries.
        let _ = pipeline.run_cycle().await;
    }
    pipeline.shutdown().await;
    log::debug!("Poll loop stopped");
}

async fn maintenance_loop(
    maintenance: Arc<Maintenance>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = maintenance.run().await {
            log::error!("Maintenance failed: {e}");
        }
    }
    log::debug!("Maintenance loop stopped");
}
