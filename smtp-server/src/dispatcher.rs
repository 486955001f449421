use async_channel::{Receiver, Sender};
use smtp::SmtpError;
use tracing::{debug, error, info, warn};

use crate::{
    message::ParsedMessage,
    notifier::{Notification, Notifier, NotifyErrorKind},
};

/// Producer side of the dispatch queue, shared by every session.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Sender<ParsedMessage>,
}

/// Consumer side of the dispatch queue.
pub struct Worker {
    queue: Receiver<ParsedMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Delivered after the rich-format attempt failed.
    DeliveredPlain,
    Failed,
}

/// Creates a bounded queue holding at most `capacity` messages.
pub fn channel(capacity: usize) -> (Dispatcher, Worker) {
    let (tx, rx) = async_channel::bounded(capacity);
    (Dispatcher { queue: tx }, Worker { queue: rx })
}

impl Dispatcher {
    /// Hands a message to the worker, waiting while the queue is full.
    pub async fn enqueue(&self, message: ParsedMessage) -> Result<(), SmtpError> {
        self.queue
            .send(message)
            .await
            .map_err(|_| SmtpError::Internal {
                message: "dispatch queue is closed".to_string(),
            })
    }
}

impl Worker {
    /// Delivers queued messages in order until every [`Dispatcher`] has been
    /// dropped and the queue is empty.
    pub async fn run<N: Notifier + ?Sized>(self, notifier: &N, prefer_rich_format: bool) {
        info!("dispatch worker started");
        while let Ok(message) = self.queue.recv().await {
            debug!(
                from = %message.from,
                to = ?message.to,
                subject = %message.subject,
                "received message"
            );
            let outcomes = deliver(notifier, &message, prefer_rich_format).await;
            let count = |kind: DeliveryOutcome| outcomes.iter().filter(|o| **o == kind).count();
            info!(
                from = %message.from,
                delivered = count(DeliveryOutcome::Delivered),
                delivered_plain = count(DeliveryOutcome::DeliveredPlain),
                failed = count(DeliveryOutcome::Failed),
                "message processed"
            );
        }
        info!("dispatch queue drained, worker stopped");
    }

    #[cfg(test)]
    pub fn into_receiver(self) -> Receiver<ParsedMessage> {
        self.queue
    }
}

/// Sends `message` to each of its recipients in order. A failure for one
/// recipient does not affect the others.
pub async fn deliver<N: Notifier + ?Sized>(
    notifier: &N,
    message: &ParsedMessage,
    prefer_rich_format: bool,
) -> Vec<DeliveryOutcome> {
    if message.to.is_empty() {
        info!(from = %message.from, "message has no recipients, skipping");
        return Vec::new();
    }

    let mut outcomes = Vec::with_capacity(message.to.len());
    for recipient in &message.to {
        outcomes.push(deliver_to(notifier, message, recipient, prefer_rich_format).await);
    }
    outcomes
}

async fn deliver_to<N: Notifier + ?Sized>(
    notifier: &N,
    message: &ParsedMessage,
    recipient: &str,
    prefer_rich_format: bool,
) -> DeliveryOutcome {
    let mut notification = Notification {
        recipient,
        sender: &message.from,
        recipients: &message.to,
        subject: &message.subject,
        body: &message.body,
        use_rich_format: prefer_rich_format,
    };

    let err = match notifier.notify(&notification).await {
        Ok(()) => return DeliveryOutcome::Delivered,
        Err(err) => err,
    };
    warn!(recipient, error = %err, "failed to deliver message");

    if !(notification.use_rich_format && err.kind == NotifyErrorKind::SendFailed) {
        return DeliveryOutcome::Failed;
    }

    warn!(recipient, "retrying with plain text");
    notification.use_rich_format = false;
    match notifier.notify(&notification).await {
        Ok(()) => DeliveryOutcome::DeliveredPlain,
        Err(err) => {
            error!(recipient, error = %err, "failed to deliver message as plain text");
            DeliveryOutcome::Failed
        }
    }
}
