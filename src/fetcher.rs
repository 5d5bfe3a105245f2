//! Mailbox access over IMAP.
//!
//! The `imap` crate is blocking, so every call runs on the blocking pool and the
//! session is moved in and out of it.

use crate::config::Config;
use crate::error::Error;
use async_trait::async_trait;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// UID of a message in the selected folder.
pub type MessageHandle = u32;

type ImapSession = imap::Session<imap::Connection>;

/// Opens mailbox connections.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, Error>;
}

/// A logged in connection with the inbox folder selected.
#[async_trait]
pub trait Mailbox: Send {
    /// Liveness check run before reusing the connection.
    async fn probe(&mut self) -> Result<(), Error>;
    async fn list_unread(&mut self) -> Result<Vec<MessageHandle>, Error>;
    async fn read(&mut self, handle: MessageHandle) -> Result<Vec<u8>, Error>;
    async fn mark_processed(&mut self, handle: MessageHandle) -> Result<(), Error>;
    async fn disconnect(self: Box<Self>);
}

#[derive(Debug, Clone)]
pub struct ImapFetcher {
    host: String,
    port: u16,
    user: String,
    password: String,
    folder: String,
    use_tls: bool,
    /// Read and write timeout of the socket, so a silent server cannot hold a blocking thread.
    io_timeout: Duration,
}

impl ImapFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.imap_host.clone(),
            port: config.imap_port,
            user: config.imap_user.clone(),
            password: config.imap_password.clone(),
            folder: config.imap_mailbox.clone(),
            use_tls: config.imap_use_tls,
            io_timeout: config.cycle_timeout(),
        }
    }

    fn unreachable(&self, reason: impl std::fmt::Display) -> Error {
        Error::Connectivity(format!("{}:{}: {reason}", self.host, self.port))
    }

    fn connect_tcp(&self) -> Result<TcpStream, Error> {
        let addresses = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.unreachable(e))?;
        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect_timeout(&address, self.io_timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => self.unreachable(e),
            None => self.unreachable("no address"),
        })
    }

    /// Opens the socket with timeouts set, wrapped in implicit TLS when enabled.
    fn open_stream(&self) -> Result<imap::Connection, Error> {
        let tcp = self.connect_tcp()?;
        tcp.set_read_timeout(Some(self.io_timeout))?;
        tcp.set_write_timeout(Some(self.io_timeout))?;
        if !self.use_tls {
            return Ok(Box::new(tcp));
        }
        let connector = native_tls::TlsConnector::new().map_err(|e| self.unreachable(e))?;
        let tls = connector
            .connect(&self.host, tcp)
            .map_err(|e| self.unreachable(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(tls))
    }

    fn connect_blocking(self) -> Result<ImapSession, Error> {
        let mut client = imap::Client::new(self.open_stream()?);
        client
            .read_greeting()
            .map_err(|e| self.unreachable(format!("no greeting: {e}")))?;
        let mut session = client
            .login(&self.user, &self.password)
            .map_err(|(e, _)| Error::Connectivity(format!("login failed: {e}")))?;
        session.select(&self.folder)?;
        Ok(session)
    }
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, Error> {
        let fetcher = self.clone();
        let session = tokio::task::spawn_blocking(move || fetcher.connect_blocking())
            .await
            .map_err(|e| Error::Connectivity(e.to_string()))??;
        log::info!("Connected to IMAP {}:{}, folder {}", self.host, self.port, self.folder);
        Ok(Box::new(ImapMailbox {
            session: Some(session),
        }))
    }
}

struct ImapMailbox {
    // Empty while a call is running on the blocking pool, or after that call was abandoned.
    session: Option<ImapSession>,
}

impl ImapMailbox {
    async fn with_session<T, F>(&mut self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> imap::error::Result<T> + Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::Connectivity("IMAP session is gone".to_string()))?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| Error::Connectivity(e.to_string()))?;
        self.session = Some(session);
        Ok(result?)
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn probe(&mut self) -> Result<(), Error> {
        self.with_session(|session| session.noop()).await
    }

    async fn list_unread(&mut self) -> Result<Vec<MessageHandle>, Error> {
        let uids = self
            .with_session(|session| session.uid_search("UNSEEN"))
            .await?;
        let mut uids: Vec<MessageHandle> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn read(&mut self, handle: MessageHandle) -> Result<Vec<u8>, Error> {
        let body = self
            .with_session(move |session| {
                let fetches = session.uid_fetch(handle.to_string(), "BODY.PEEK[]")?;
                Ok(fetches.iter().find_map(|f| f.body().map(|b| b.to_vec())))
            })
            .await?;
        body.ok_or_else(|| Error::NotFound(format!("message UID {handle}")))
    }

    async fn mark_processed(&mut self, handle: MessageHandle) -> Result<(), Error> {
        self.with_session(move |session| {
            session.uid_store(handle.to_string(), "+FLAGS (\\Seen)")?;
            Ok(())
        })
        .await
    }

    async fn disconnect(mut self: Box<Self>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let logout = tokio::task::spawn_blocking(move || session.logout()).await;
        match logout {
            Ok(Ok(())) => log::debug!("IMAP logout"),
            Ok(Err(e)) => log::debug!("IMAP logout failed: {e}"),
            Err(e) => log::debug!("IMAP logout task failed: {e}"),
        }
    }
}
