use async_trait::async_trait;
use base64::prelude::*;
use miette::{Diagnostic, SourceSpan};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

mod connection;
mod parser;
pub use connection::{Connection, DataOutcome};
pub use parser::*;

/// Longest command line accepted, CRLF included.
const MAX_COMMAND_LINE: usize = 1000;

#[derive(Debug, Error, Diagnostic)]
pub enum SmtpError {
    #[error("IO error")]
    #[diagnostic(code(smtp::io_error))]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {message}")]
    #[diagnostic(code(smtp::parse_error))]
    ParseError {
        message: String,
        #[label("This bit here")]
        span: SourceSpan,
    },

    #[error("Connection timed out")]
    #[diagnostic(code(smtp::timeout))]
    Timeout,

    #[error("Line too long")]
    #[diagnostic(code(smtp::line_too_long))]
    LineTooLong,

    #[error("Authentication required")]
    #[diagnostic(code(smtp::auth_required))]
    AuthRequired,

    #[error("Authentication failed")]
    #[diagnostic(code(smtp::auth_error))]
    AuthFailed,

    #[error("Sender rejected: {message}")]
    #[diagnostic(code(smtp::mail_from_denied))]
    MailFromDenied { message: String },

    #[error("Recipient rejected: {message}")]
    #[diagnostic(code(smtp::rcpt_to_denied))]
    RcptToDenied { message: String },

    #[error("Bad sequence of commands")]
    #[diagnostic(code(smtp::bad_sequence))]
    BadSequence,

    #[error("Internal error: {message}")]
    #[diagnostic(code(smtp::internal))]
    Internal { message: String },
}

impl SmtpError {
    /// Renders the full reply line, enhanced status code included.
    pub fn reply(&self) -> String {
        match self {
            SmtpError::AuthRequired => "530 5.7.0 Authentication required".to_string(),
            SmtpError::AuthFailed => "535 5.7.8 Authentication credentials invalid".to_string(),
            SmtpError::MailFromDenied { message } | SmtpError::RcptToDenied { message } => {
                format!("550 5.7.1 {message}")
            }
            SmtpError::BadSequence => "503 5.5.1 Bad sequence of commands".to_string(),
            SmtpError::ParseError { .. } | SmtpError::LineTooLong => {
                "500 5.5.2 Syntax error, command unrecognized".to_string()
            }
            SmtpError::IoError(_) | SmtpError::Timeout | SmtpError::Internal { .. } => {
                "451 4.3.0 Local error in processing".to_string()
            }
        }
    }
}

/// Protocol progression of one connection, as tracked by the transport.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SessionState {
    Connected,
    Greeted,
    AuthenticatingPlain,
    ReceivingMailFrom,
    ReceivingRcptTo,
    ReceivingData,
}

/// Transport-level limits and identity.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub auth_enabled: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hostname: "localhost".to_string(),
            auth_enabled: false,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
            max_recipients: 50,
        }
    }
}

/// Per-connection hooks. Every returned error is reported to the client with
/// [`SmtpError::reply`]; the connection stays open.
#[async_trait]
pub trait SmtpSession: Send {
    async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), SmtpError>;
    async fn mail_from(&mut self, from: &str) -> Result<(), SmtpError>;
    async fn rcpt_to(&mut self, to: &str) -> Result<(), SmtpError>;
    async fn data(&mut self, raw: &[u8]) -> Result<(), SmtpError>;
    /// Discards the open transaction.
    fn reset(&mut self);
    async fn logout(&mut self);
}

/// Creates one [`SmtpSession`] for every accepted connection.
pub trait SmtpBackend: Send + Sync + 'static {
    type Session: SmtpSession;

    fn new_session(&self, remote_addr: SocketAddr) -> Self::Session;
}

pub struct SmtpServer<B: SmtpBackend> {
    backend: Arc<B>,
    config: Arc<ServerConfig>,
}

impl<B: SmtpBackend> Clone for SmtpServer<B> {
    fn clone(&self) -> Self {
        SmtpServer {
            backend: self.backend.clone(),
            config: self.config.clone(),
        }
    }
}

/// Transport bookkeeping that lives alongside the backend session.
struct Protocol {
    state: SessionState,
    authenticated: bool,
    recipients: usize,
}

impl Protocol {
    fn in_transaction(&self) -> bool {
        matches!(
            self.state,
            SessionState::ReceivingMailFrom | SessionState::ReceivingRcptTo
        )
    }

    fn end_transaction(&mut self) {
        self.state = SessionState::Greeted;
        self.recipients = 0;
    }
}

impl<B: SmtpBackend> SmtpServer<B> {
    pub fn new(backend: B, config: ServerConfig) -> Self {
        SmtpServer {
            backend: Arc::new(backend),
            config: Arc::new(config),
        }
    }

    /// Runs one SMTP conversation to completion. Returns when the client quits or
    /// hangs up; transport faults and timeouts are returned as errors and discard
    /// any open transaction.
    pub async fn handle_client<S>(
        &self,
        socket: S,
        remote_addr: SocketAddr,
    ) -> Result<(), SmtpError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut conn = Connection::new(socket, self.config.read_timeout, self.config.write_timeout);
        let mut session = self.backend.new_session(remote_addr);
        let mut protocol = Protocol {
            state: SessionState::Connected,
            authenticated: false,
            recipients: 0,
        };

        conn.write_reply(&format!("220 {} ESMTP Service Ready", self.config.hostname))
            .await?;

        loop {
            let line = match conn.read_line(MAX_COMMAND_LINE).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("client closed the connection");
                    return Ok(());
                }
                Err(SmtpError::LineTooLong) => {
                    conn.write_reply("500 5.5.2 Line too long").await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let command = String::from_utf8_lossy(&line);
            match parse_command(&command, &protocol.state) {
                Ok(cmd) => {
                    if self
                        .handle_command(&mut conn, &mut session, &mut protocol, cmd)
                        .await?
                    {
                        return Ok(());
                    }
                }
                Err(e) => {
                    debug!(error = %e, "unrecognized command");
                    conn.write_reply(&e.reply()).await?;
                }
            }
        }
    }

    /// Handles a single command. Returns `true` once the conversation is over.
    async fn handle_command<S>(
        &self,
        conn: &mut Connection<S>,
        session: &mut B::Session,
        protocol: &mut Protocol,
        command: SmtpCommand,
    ) -> Result<bool, SmtpError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        match (protocol.state, command) {
            (_, SmtpCommand::Ehlo(domain)) => {
                debug!(%domain, "EHLO");
                if protocol.in_transaction() {
                    session.reset();
                }
                protocol.end_transaction();
                conn.write_reply(&self.ehlo_reply()).await?;
            }
            (_, SmtpCommand::Helo(domain)) => {
                debug!(%domain, "HELO");
                if protocol.in_transaction() {
                    session.reset();
                }
                protocol.end_transaction();
                conn.write_reply(&format!("250 {}", self.config.hostname))
                    .await?;
            }
            (_, SmtpCommand::Quit) => {
                session.logout().await;
                conn.write_reply("221 2.0.0 Bye").await?;
                return Ok(true);
            }
            (_, SmtpCommand::Noop) => {
                conn.write_reply("250 2.0.0 OK").await?;
            }
            (state, SmtpCommand::Rset) => {
                session.reset();
                if state != SessionState::Connected {
                    protocol.end_transaction();
                }
                conn.write_reply("250 2.0.0 OK").await?;
            }
            (SessionState::Connected, _) => {
                conn.write_reply("503 5.5.1 Send EHLO or HELO first").await?;
            }
            (_, SmtpCommand::Auth { .. }) if !self.config.auth_enabled => {
                conn.write_reply("502 5.5.1 AUTH not supported").await?;
            }
            (SessionState::Greeted, SmtpCommand::Auth { .. }) if protocol.authenticated => {
                conn.write_reply("503 5.5.1 Already authenticated").await?;
            }
            (
                SessionState::Greeted,
                SmtpCommand::Auth {
                    mechanism,
                    initial_response,
                },
            ) => {
                if mechanism != "PLAIN" {
                    conn.write_reply("504 5.5.4 Unrecognized authentication type")
                        .await?;
                } else if let Some(response) = initial_response {
                    self.complete_auth_plain(conn, session, protocol, &response)
                        .await?;
                } else {
                    protocol.state = SessionState::AuthenticatingPlain;
                    conn.write_reply("334 ").await?;
                }
            }
            (SessionState::AuthenticatingPlain, SmtpCommand::AuthResponse(response)) => {
                protocol.state = SessionState::Greeted;
                if response == "*" {
                    conn.write_reply("501 5.7.0 Authentication cancelled").await?;
                } else {
                    self.complete_auth_plain(conn, session, protocol, &response)
                        .await?;
                }
            }
            (SessionState::Greeted, SmtpCommand::MailFrom(from)) => {
                match session.mail_from(&from).await {
                    Ok(()) => {
                        protocol.state = SessionState::ReceivingMailFrom;
                        conn.write_reply("250 2.1.0 OK").await?;
                    }
                    Err(e) => conn.write_reply(&e.reply()).await?,
                }
            }
            (
                SessionState::ReceivingMailFrom | SessionState::ReceivingRcptTo,
                SmtpCommand::RcptTo(to),
            ) => {
                if protocol.recipients >= self.config.max_recipients {
                    conn.write_reply("452 4.5.3 Too many recipients").await?;
                    return Ok(false);
                }
                match session.rcpt_to(&to).await {
                    Ok(()) => {
                        protocol.recipients += 1;
                        protocol.state = SessionState::ReceivingRcptTo;
                        conn.write_reply("250 2.1.5 OK").await?;
                    }
                    // A rejected recipient leaves the transaction open for the others.
                    Err(e) => conn.write_reply(&e.reply()).await?,
                }
            }
            (SessionState::ReceivingMailFrom, SmtpCommand::Data) => {
                conn.write_reply("554 5.5.1 No valid recipients").await?;
            }
            (SessionState::ReceivingRcptTo, SmtpCommand::Data) => {
                protocol.state = SessionState::ReceivingData;
                conn.write_reply("354 Start mail input; end with <CRLF>.<CRLF>")
                    .await?;
                let outcome = conn.read_data(self.config.max_message_bytes).await?;
                protocol.end_transaction();

                let reply = match outcome {
                    DataOutcome::TooLarge => {
                        warn!(
                            max_bytes = self.config.max_message_bytes,
                            "message exceeds size limit"
                        );
                        "552 5.3.4 Message too big".to_string()
                    }
                    DataOutcome::Complete(raw) => match session.data(&raw).await {
                        Ok(()) => "250 2.0.0 OK: queued".to_string(),
                        Err(e) => e.reply(),
                    },
                };
                session.reset();
                conn.write_reply(&reply).await?;
            }
            (state, cmd) => {
                debug!(?state, ?cmd, "command out of sequence");
                conn.write_reply(&SmtpError::BadSequence.reply()).await?;
            }
        }
        Ok(false)
    }

    async fn complete_auth_plain<S>(
        &self,
        conn: &mut Connection<S>,
        session: &mut B::Session,
        protocol: &mut Protocol,
        encoded: &str,
    ) -> Result<(), SmtpError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let Some((username, password)) = decode_plain(encoded) else {
            return conn.write_reply("501 5.5.2 Invalid AUTH PLAIN data").await;
        };

        match session.auth_plain(&username, &password).await {
            Ok(()) => {
                info!(%username, "client authenticated");
                protocol.authenticated = true;
                conn.write_reply("235 2.7.0 Authentication successful").await
            }
            Err(e) => conn.write_reply(&e.reply()).await,
        }
    }

    fn ehlo_reply(&self) -> String {
        let mut lines = vec![
            self.config.hostname.clone(),
            format!("SIZE {}", self.config.max_message_bytes),
            "8BITMIME".to_string(),
        ];
        if self.config.auth_enabled {
            lines.push("AUTH PLAIN".to_string());
        }

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i == last { ' ' } else { '-' };
                format!("250{sep}{line}")
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

/// Splits a base64 SASL PLAIN payload (`authzid\0authcid\0passwd`) into
/// username and password.
pub fn decode_plain(encoded: &str) -> Option<(String, String)> {
    let decoded = decode_base64(encoded).ok()?;
    let mut parts = decoded.split('\0');
    let (_authzid, username, password) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}

pub fn decode_base64(input: &str) -> Result<String, SmtpError> {
    String::from_utf8(
        BASE64_STANDARD
            .decode(input)
            .map_err(|_| SmtpError::AuthFailed)?,
    )
    .map_err(|_| SmtpError::AuthFailed)
}
