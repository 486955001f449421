//! The per-connection mail session: authentication gate, sender and
//! recipient policies, and the hand-off of parsed messages to the dispatcher.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use smtp::{SmtpBackend, SmtpError, SmtpSession};
use tracing::{debug, error, info, trace, warn};

use crate::{
    credentials::CredentialStore,
    dispatcher::Dispatcher,
    filters::Policies,
    message::{self, MessageError},
};

/// Shared state every new session is bound to.
pub struct Backend {
    require_auth: bool,
    credentials: Arc<CredentialStore>,
    policies: Arc<Policies>,
    dispatcher: Dispatcher,
}

impl Backend {
    pub fn new(
        require_auth: bool,
        credentials: Arc<CredentialStore>,
        policies: Arc<Policies>,
        dispatcher: Dispatcher,
    ) -> Self {
        Backend {
            require_auth,
            credentials,
            policies,
            dispatcher,
        }
    }
}

impl SmtpBackend for Backend {
    type Session = MailSession;

    fn new_session(&self, remote_addr: SocketAddr) -> MailSession {
        debug!(remote = %remote_addr, "new session");
        MailSession {
            authenticated: false,
            remote_addr,
            require_auth: self.require_auth,
            credentials: self.credentials.clone(),
            policies: self.policies.clone(),
            dispatcher: self.dispatcher.clone(),
            sender: None,
            recipients: Vec::new(),
        }
    }
}

pub struct MailSession {
    authenticated: bool,
    remote_addr: SocketAddr,
    require_auth: bool,
    credentials: Arc<CredentialStore>,
    policies: Arc<Policies>,
    dispatcher: Dispatcher,
    sender: Option<String>,
    /// Envelope recipients accepted so far, in order.
    recipients: Vec<String>,
}

impl MailSession {
    fn check_auth(&self) -> Result<(), SmtpError> {
        if self.require_auth && !self.authenticated {
            warn!(
                remote = %self.remote_addr,
                "attempt to send mail without authentication, rejecting"
            );
            return Err(SmtpError::AuthRequired);
        }
        Ok(())
    }
}

#[async_trait]
impl SmtpSession for MailSession {
    async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), SmtpError> {
        debug!(%username, remote = %self.remote_addr, "authenticating user");
        if !self.require_auth {
            return Err(SmtpError::AuthFailed);
        }

        if !self.credentials.verify(username, password).await {
            warn!(%username, remote = %self.remote_addr, "authentication failed");
            return Err(SmtpError::AuthFailed);
        }

        debug!(%username, remote = %self.remote_addr, "user authenticated");
        self.authenticated = true;
        Ok(())
    }

    async fn mail_from(&mut self, from: &str) -> Result<(), SmtpError> {
        self.check_auth()?;

        debug!(%from, "checking sender against policy");
        if !self.policies.from.is_allowed(from) {
            warn!(%from, remote = %self.remote_addr, "sender rejected by policy");
            return Err(SmtpError::MailFromDenied {
                message: "Sender not allowed".to_string(),
            });
        }

        self.sender = Some(from.to_string());
        self.recipients.clear();
        Ok(())
    }

    async fn rcpt_to(&mut self, to: &str) -> Result<(), SmtpError> {
        self.check_auth()?;

        debug!(%to, "checking recipient against policy");
        if !self.policies.to.is_allowed(to) {
            warn!(%to, remote = %self.remote_addr, "recipient rejected by policy");
            return Err(SmtpError::RcptToDenied {
                message: "Recipient not allowed".to_string(),
            });
        }

        self.recipients.push(to.to_string());
        Ok(())
    }

    async fn data(&mut self, raw: &[u8]) -> Result<(), SmtpError> {
        self.check_auth()?;
        trace!(raw = %String::from_utf8_lossy(raw), "raw message");

        // Messages that cannot be forwarded are accepted and dropped.
        let parsed = match message::parse(raw) {
            Ok(parsed) => parsed,
            Err(MessageError::Unparseable) => {
                error!(remote = %self.remote_addr, "error parsing message, dropping");
                return Ok(());
            }
            Err(MessageError::MissingSender) => {
                debug!(remote = %self.remote_addr, "message has no From address, dropping");
                return Ok(());
            }
            Err(MessageError::MissingRecipients { from }) => {
                warn!(%from, "message has no recipients, dropping");
                return Ok(());
            }
        };

        info!(
            envelope_from = ?self.sender,
            envelope_to = ?self.recipients,
            from = %parsed.from,
            to = ?parsed.to,
            subject = %parsed.subject,
            "queueing message"
        );
        self.dispatcher.enqueue(parsed).await
    }

    fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    async fn logout(&mut self) {
        debug!(remote = %self.remote_addr, "session closed");
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::{self, Worker},
        filters::{DefaultAction, PolicyRuleSet},
        message::ParsedMessage,
    };
    use pwhash::bcrypt::{self, BcryptSetup, BcryptVariant};
    use std::time::Duration;

    const ADDR: &str = "192.0.2.10:50123";

    fn policies() -> Policies {
        Policies {
            from: PolicyRuleSet {
                allow: vec![],
                deny: vec!["spammer@*".to_string()],
                default_action: DefaultAction::Allow,
            },
            to: PolicyRuleSet {
                allow: vec!["*@example.com".to_string()],
                deny: vec!["bad@example.com".to_string()],
                default_action: DefaultAction::Deny,
            },
        }
    }

    fn credentials() -> CredentialStore {
        let hash = bcrypt::hash_with(
            BcryptSetup {
                salt: None,
                cost: Some(4),
                variant: Some(BcryptVariant::V2b),
            },
            "hunter2",
        )
        .unwrap();
        CredentialStore::parse(&format!("alice:{hash}\n"))
    }

    fn session(require_auth: bool) -> (MailSession, Worker) {
        let (dispatcher, worker) = dispatcher::channel(8);
        let backend = Backend::new(
            require_auth,
            Arc::new(credentials()),
            Arc::new(policies()),
            dispatcher,
        );
        (backend.new_session(ADDR.parse().unwrap()), worker)
    }

    /// Drops the session so the queue closes, then collects what was enqueued.
    async fn queued(session: MailSession, worker: Worker) -> Vec<ParsedMessage> {
        drop(session);
        let mut messages = Vec::new();
        let queue = worker.into_receiver();
        while let Ok(message) = queue.recv().await {
            messages.push(message);
        }
        messages
    }

    const MESSAGE: &[u8] = b"From: Monitor <monitor@example.com>\r\n\
To: a@x.com, b@y.com\r\n\
Subject: Backup finished\r\n\
\r\n\
All good.\r\n";

    #[tokio::test]
    async fn test_auth_required_gates_every_command() {
        let (mut session, _worker) = session(true);

        for _ in 0..2 {
            assert!(matches!(
                session.mail_from("monitor@example.com").await,
                Err(SmtpError::AuthRequired)
            ));
            assert!(matches!(
                session.rcpt_to("a@example.com").await,
                Err(SmtpError::AuthRequired)
            ));
            assert!(matches!(session.data(MESSAGE).await, Err(SmtpError::AuthRequired)));
            session.reset();
        }
    }

    #[tokio::test]
    async fn test_failed_auth_can_be_retried() {
        let (mut session, _worker) = session(true);

        assert!(matches!(
            session.auth_plain("alice", "wrong").await,
            Err(SmtpError::AuthFailed)
        ));
        assert!(matches!(
            session.auth_plain("mallory", "hunter2").await,
            Err(SmtpError::AuthFailed)
        ));
        assert!(matches!(
            session.mail_from("monitor@example.com").await,
            Err(SmtpError::AuthRequired)
        ));

        session.auth_plain("alice", "hunter2").await.unwrap();
        session.mail_from("monitor@example.com").await.unwrap();

        // Reset clears the transaction but keeps the authentication.
        session.reset();
        session.mail_from("monitor@example.com").await.unwrap();
        session.rcpt_to("a@example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_not_offered_when_disabled() {
        let (mut session, _worker) = session(false);
        assert!(matches!(
            session.auth_plain("alice", "hunter2").await,
            Err(SmtpError::AuthFailed)
        ));
        session.mail_from("monitor@example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_policy_rejections() {
        let (mut session, _worker) = session(false);

        match session.mail_from("spammer@evil.com").await {
            Err(SmtpError::MailFromDenied { message }) => assert_eq!(message, "Sender not allowed"),
            other => panic!("unexpected result: {other:?}"),
        }
        session.mail_from("monitor@example.com").await.unwrap();

        match session.rcpt_to("bad@example.com").await {
            Err(SmtpError::RcptToDenied { message }) => {
                assert_eq!(message, "Recipient not allowed")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            session.rcpt_to("someone@other.com").await,
            Err(SmtpError::RcptToDenied { .. })
        ));
        session.rcpt_to("good@example.com").await.unwrap();
        session.rcpt_to("good@example.com").await.unwrap();
        assert_eq!(
            session.recipients,
            vec!["good@example.com", "good@example.com"]
        );
    }

    #[tokio::test]
    async fn test_data_enqueues_parsed_message() {
        let (mut session, worker) = session(false);
        session.mail_from("monitor@example.com").await.unwrap();
        session.rcpt_to("ops@example.com").await.unwrap();
        session.data(MESSAGE).await.unwrap();

        let messages = queued(session, worker).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from, "monitor@example.com");
        assert_eq!(messages[0].to, vec!["a@x.com", "b@y.com"]);
        assert_eq!(messages[0].subject, "Backup finished");
    }

    #[tokio::test]
    async fn test_data_without_from_is_dropped_silently() {
        let (mut session, worker) = session(false);
        session
            .data(b"To: a@x.com\r\nSubject: anonymous\r\n\r\nbody\r\n")
            .await
            .unwrap();
        assert!(queued(session, worker).await.is_empty());
    }

    #[tokio::test]
    async fn test_data_without_to_is_dropped_silently() {
        let (mut session, worker) = session(false);
        session
            .data(b"From: s@example.com\r\nSubject: nobody\r\n\r\nbody\r\n")
            .await
            .unwrap();
        assert!(queued(session, worker).await.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_data_is_dropped_silently() {
        let (mut session, worker) = session(false);
        session.data(b"").await.unwrap();
        session.data(b"\x00\x01\x02 not mail at all").await.unwrap();
        assert!(queued(session, worker).await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_is_internal_error() {
        let (mut session, worker) = session(false);
        drop(worker);
        let result = tokio::time::timeout(Duration::from_secs(1), session.data(MESSAGE)).await;
        assert!(matches!(result, Ok(Err(SmtpError::Internal { .. }))));
    }
}
