use std::fmt;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::message::MessageBody;

mod mrkdwn;
mod slack;

pub use slack::SlackNotifier;

/// One delivery attempt for one recipient.
#[derive(Debug, Clone, Copy)]
pub struct Notification<'a> {
    pub recipient: &'a str,
    pub sender: &'a str,
    pub recipients: &'a [String],
    pub subject: &'a str,
    pub body: &'a MessageBody,
    /// Render the HTML body instead of the plain-text one.
    pub use_rich_format: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyErrorKind {
    RecipientNotFound,
    ChannelOpenFailed,
    SendFailed,
}

impl fmt::Display for NotifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            NotifyErrorKind::RecipientNotFound => "recipient not found",
            NotifyErrorKind::ChannelOpenFailed => "could not open channel",
            NotifyErrorKind::SendFailed => "send failed",
        };
        f.write_str(kind)
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("{kind} for '{recipient}': {message}")]
#[diagnostic(code(notify::error))]
pub struct NotifyError {
    pub kind: NotifyErrorKind,
    pub recipient: String,
    pub message: String,
}

impl NotifyError {
    pub fn new(kind: NotifyErrorKind, recipient: &str, message: impl Into<String>) -> Self {
        NotifyError {
            kind,
            recipient: recipient.to_string(),
            message: message.into(),
        }
    }
}

/// Outbound delivery of a single message to a single recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification<'_>) -> Result<(), NotifyError>;
}
