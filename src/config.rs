//! Configuration file handling for mailintake.

use crate::error::Error;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for the intake pipeline, read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub imap_host: String,
    #[serde(default = "Config::default_imap_port")]
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_password: String,
    #[serde(default = "Config::default_imap_mailbox")]
    pub imap_mailbox: String,
    #[serde(default = "Config::default_true", deserialize_with = "deserialize_flag")]
    pub imap_use_tls: bool,

    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "Config::default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default = "Config::default_true", deserialize_with = "deserialize_flag")]
    pub smtp_use_tls: bool,
    #[serde(default)]
    smtp_from: Option<String>,

    #[serde(default = "Config::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "Config::default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    #[serde(default = "Config::default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "Config::default_true", deserialize_with = "deserialize_flag")]
    pub mark_as_read: bool,

    #[serde(default = "Config::default_max_attachment_size")]
    pub max_attachment_size: usize,
    #[serde(default = "Config::default_max_attachment_count")]
    pub max_attachment_count: usize,
    #[serde(
        default = "Config::default_allowed_extensions",
        deserialize_with = "deserialize_sequence"
    )]
    pub allowed_extensions: Vec<String>,

    #[serde(default = "Config::default_hourly_limit")]
    pub hourly_limit: u32,
    #[serde(default = "Config::default_daily_limit")]
    pub daily_limit: u32,

    #[serde(default, deserialize_with = "deserialize_flag")]
    pub whitelist_enabled: bool,
    #[serde(default, deserialize_with = "deserialize_sequence")]
    pub allowed_domains: Vec<String>,
    #[serde(
        default = "Config::default_system_senders",
        deserialize_with = "deserialize_sequence"
    )]
    pub system_senders: Vec<String>,
    #[serde(default = "Config::default_domain_cache_ttl_secs")]
    pub domain_cache_ttl_secs: u64,

    #[serde(default = "Config::default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "Config::default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "Config::default_tracker_prefix")]
    pub tracker_prefix: String,

    #[serde(default = "Config::default_true", deserialize_with = "deserialize_flag")]
    pub auto_reply_enabled: bool,
    #[serde(default = "Config::default_frontend_url")]
    pub frontend_url: String,
    #[serde(default)]
    pub support_email: String,
    #[serde(default = "Config::default_system_name")]
    pub system_name: String,

    #[serde(default = "Config::default_rate_record_retention_days")]
    pub rate_record_retention_days: u32,
    #[serde(default = "Config::default_rejected_retention_days")]
    pub rejected_retention_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigWrapper {
    // The whole actual config is under `params` section.
    pub params: Config,
}

/// Custom deserializer to parse space-separated strings into [`Vec<String>`].
fn deserialize_sequence<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(match s {
        Some(v) => v
            .split(' ')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        None => Vec::new(),
    })
}

/// Custom deserializer accepting the usual spellings of an on/off switch.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected a boolean, got `{other}`"
        ))),
    }
}

impl Config {
    /// Load configuration from a file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ini(&content)
    }

    /// Parse configuration from INI text and validate it.
    pub fn from_ini(content: &str) -> Result<Self, Error> {
        let wrapped_config: ConfigWrapper = serini::from_str(content)?;
        let mut config = wrapped_config.params;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .collect();
        self.allowed_domains = self
            .allowed_domains
            .iter()
            .map(|domain| domain.trim().to_lowercase())
            .collect();
        self.system_senders = self
            .system_senders
            .iter()
            .map(|prefix| prefix.to_lowercase())
            .collect();
        self.tracker_prefix = self.tracker_prefix.to_ascii_uppercase();
    }

    /// Fails fast on settings that would otherwise only break a poll cycle later.
    pub fn validate(&self) -> Result<(), Error> {
        fn required(key: &'static str, value: &str) -> Result<(), Error> {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    key,
                    reason: "must be set".to_string(),
                });
            }
            Ok(())
        }
        fn positive(key: &'static str, value: u64) -> Result<(), Error> {
            if value == 0 {
                return Err(Error::InvalidConfig {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        required("imap_host", &self.imap_host)?;
        required("imap_user", &self.imap_user)?;
        required("imap_password", &self.imap_password)?;
        if self.auto_reply_enabled {
            required("smtp_host", &self.smtp_host)?;
            required("smtp_user", &self.smtp_user)?;
            required("smtp_password", &self.smtp_password)?;
        }

        positive("poll_interval_secs", self.poll_interval_secs)?;
        positive("cycle_timeout_secs", self.cycle_timeout_secs)?;
        positive("maintenance_interval_secs", self.maintenance_interval_secs)?;
        positive("max_attachment_size", self.max_attachment_size as u64)?;
        positive("max_attachment_count", self.max_attachment_count as u64)?;
        positive("hourly_limit", u64::from(self.hourly_limit))?;
        positive("daily_limit", u64::from(self.daily_limit))?;

        if self.tracker_prefix.is_empty()
            || self.tracker_prefix.len() > 8
            || !self
                .tracker_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::InvalidConfig {
                key: "tracker_prefix",
                reason: "must be 1-8 ASCII letters or digits".to_string(),
            });
        }
        Ok(())
    }

    /// Address notifications are sent from.
    pub fn smtp_from(&self) -> &str {
        match &self.smtp_from {
            Some(from) if !from.trim().is_empty() => from,
            _ => &self.smtp_user,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn domain_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.domain_cache_ttl_secs)
    }

    /// Check if the address belongs to an automated sender that must never be ingested.
    pub fn is_system_sender(&self, addr: &str) -> bool {
        let addr = addr.to_lowercase();
        self.system_senders
            .iter()
            .any(|prefix| addr.starts_with(prefix.as_str()))
    }

    // Following are needed since serde does not support default literals.

    const fn default_true() -> bool {
        true
    }
    const fn default_imap_port() -> u16 {
        993
    }
    fn default_imap_mailbox() -> String {
        "INBOX".to_string()
    }
    const fn default_smtp_port() -> u16 {
        587
    }
    const fn default_poll_interval_secs() -> u64 {
        15
    }
    const fn default_cycle_timeout_secs() -> u64 {
        30
    }
    const fn default_maintenance_interval_secs() -> u64 {
        3600
    }
    const fn default_max_attachment_size() -> usize {
        10 * 1024 * 1024
    }
    const fn default_max_attachment_count() -> usize {
        5
    }
    fn default_allowed_extensions() -> Vec<String> {
        [
            ".pdf", ".doc", ".docx", ".txt", ".md", ".ipynb", ".py", ".ts", ".java", ".cpp",
            ".c", ".zip",
        ]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
    }
    const fn default_hourly_limit() -> u32 {
        5
    }
    const fn default_daily_limit() -> u32 {
        20
    }
    fn default_system_senders() -> Vec<String> {
        ["mailer-daemon@", "noreply@", "no-reply@", "postmaster@"]
            .iter()
            .map(|prefix| prefix.to_string())
            .collect()
    }
    const fn default_domain_cache_ttl_secs() -> u64 {
        3600
    }
    fn default_database_path() -> PathBuf {
        PathBuf::from("/var/lib/mailintake/intake.db")
    }
    fn default_upload_dir() -> PathBuf {
        PathBuf::from("/var/lib/mailintake/uploads")
    }
    fn default_tracker_prefix() -> String {
        "EMAIL".to_string()
    }
    fn default_frontend_url() -> String {
        "http://localhost:8000".to_string()
    }
    fn default_system_name() -> String {
        "Knowledge Base Uploads".to_string()
    }
    const fn default_rate_record_retention_days() -> u32 {
        7
    }
    const fn default_rejected_retention_days() -> u32 {
        30
    }
}

/// Lowercase an extension and make sure it carries its leading dot.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}
