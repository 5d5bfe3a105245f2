//! Outbound SMTP for notifications.

use crate::config::Config;
use crate::error::Error;
use crate::notifier::{MailSender, OutboundSession};
use crate::templates::RenderedMail;
use crate::utils::{format_smtp_error, mask_address};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::PoolConfig;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Submits notifications to the configured relay.
#[derive(Debug, Clone)]
pub struct SmtpSender {
    host: String,
    port: u16,
    use_tls: bool,
    user: String,
    password: String,
    from: String,
}

impl SmtpSender {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            use_tls: config.smtp_use_tls,
            user: config.smtp_user.clone(),
            password: config.smtp_password.clone(),
            from: config.smtp_from().to_string(),
        }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, Error> {
        let tls = if self.use_tls {
            let parameters = TlsParameters::new(self.host.clone())
                .map_err(|e| Error::Notification(format_smtp_error(e)))?;
            // Port 465 speaks TLS from the first byte, everything else upgrades.
            if self.port == 465 {
                Tls::Wrapper(parameters)
            } else {
                Tls::Required(parameters)
            }
        } else {
            Tls::None
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host)
            .port(self.port)
            .tls(tls)
            .timeout(Some(SMTP_TIMEOUT))
            .pool_config(PoolConfig::new().max_size(1));
        if !self.user.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.user.clone(),
                self.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn open(&self) -> Result<Box<dyn OutboundSession>, Error> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| Error::Notification(format!("invalid sender address: {e}")))?;
        let transport = self.transport()?;

        match transport.test_connection().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::Notification(format!(
                    "{}:{} refused the connection",
                    self.host, self.port
                )));
            }
            Err(e) => return Err(Error::Notification(format_smtp_error(e))),
        }
        log::debug!("SMTP session to {}:{} opened", self.host, self.port);

        Ok(Box::new(SmtpSession { transport, from }))
    }
}

/// One pooled connection, reused for every mail of a batch.
struct SmtpSession {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

#[async_trait]
impl OutboundSession for SmtpSession {
    async fn send(&mut self, to: &str, mail: &RenderedMail) -> Result<(), Error> {
        let recipient: Mailbox = to
            .parse()
            .map_err(|e| Error::Notification(format!("invalid recipient {}: {e}", mask_address(to))))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(mail.subject.as_str())
            .multipart(MultiPart::alternative_plain_html(
                mail.text.clone(),
                mail.html.clone(),
            ))
            .map_err(|e| Error::Notification(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| Error::Notification(format_smtp_error(e)))?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        // Dropping the transport quits its pooled connection.
        drop(self.transport);
        log::debug!("SMTP session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use testresult::TestResult;

    #[tokio::test]
    async fn test_open_fails_on_bad_sender_address() {
        let mut config = test_config();
        config.smtp_user = "not an address".to_string();
        let sender = SmtpSender::new(&config);
        assert!(matches!(sender.open().await, Err(Error::Notification(_))));
    }

    #[tokio::test]
    async fn test_open_fails_when_relay_unreachable() -> TestResult {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let mut config = test_config();
        config.smtp_host = "127.0.0.1".to_string();
        config.smtp_port = port;
        config.smtp_use_tls = false;
        let sender = SmtpSender::new(&config);
        assert!(matches!(sender.open().await, Err(Error::Notification(_))));
        Ok(())
    }
}
