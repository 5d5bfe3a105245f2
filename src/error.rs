//! Error types.

/// Error type for mailintake.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Config file is invalid: {0}")]
    Config(#[from] serini::Error),
    #[error("Config value `{key}` is invalid: {reason}")]
    InvalidConfig { key: &'static str, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("IMAP error: {0}")]
    Imap(#[from] imap::Error),
    #[error("Mailbox unreachable: {0}")]
    Connectivity(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] mailparse::MailParseError),
    #[error("Failed to store attachment: {0}")]
    Store(String),
    #[error("Template `{template}` failed to render: {reason}")]
    Template {
        template: &'static str,
        reason: String,
    },
    #[error("Failed to send notification: {0}")]
    Notification(String),
    #[error("Cannot move upload from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("No record for {0}")]
    NotFound(String),
    #[error("Poll cycle timed out after {0} seconds")]
    Timeout(u64),
}
