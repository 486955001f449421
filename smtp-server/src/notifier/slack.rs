use std::time::Duration;

use async_trait::async_trait;
use miette::{bail, miette, IntoDiagnostic, Result};
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    mrkdwn::{escape, html_to_mrkdwn},
    Notification, Notifier, NotifyError, NotifyErrorKind,
};
use crate::config::Secret;

const SLACK_API_URL: &str = "https://slack.com/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Slack rejects section blocks whose text exceeds 3000 characters.
const SECTION_TEXT_LIMIT: usize = 3000;

#[derive(Debug, Error)]
enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("slack api error: {0}")]
    Api(String),
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct AuthTest {
    user: String,
    #[serde(default)]
    team: String,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LookupByEmail {
    user: SlackUser,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConversationOpen {
    channel: Channel,
}

/// Delivers notifications as direct messages through the Slack Web API.
pub struct SlackNotifier {
    client: Client,
    token: Secret,
    api_url: String,
}

impl SlackNotifier {
    /// Builds the client and checks the token with `auth.test`.
    pub async fn connect(token: Secret) -> Result<Self> {
        Self::connect_to(SLACK_API_URL, token).await
    }

    async fn connect_to(api_url: &str, token: Secret) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .into_diagnostic()?;
        let notifier = SlackNotifier {
            client,
            token,
            api_url: api_url.trim_end_matches('/').to_string(),
        };

        let auth: AuthTest = notifier
            .call(notifier.client.post(notifier.url("auth.test")))
            .await
            .map_err(|e| miette!("slack authentication failed: {e}"))?;
        if auth.user.is_empty() {
            bail!("slack authentication failed: user is empty");
        }

        info!(user = %auth.user, team = %auth.team, "slack token verified");
        Ok(notifier)
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_url, method)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let value: Value = request
            .bearer_auth(self.token.expose())
            .send()
            .await?
            .json()
            .await?;

        if value["ok"].as_bool() != Some(true) {
            let error = value["error"].as_str().unwrap_or("unknown_error");
            return Err(ApiError::Api(error.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, n: &Notification<'_>) -> Result<(), NotifyError> {
        let lookup: LookupByEmail = self
            .call(
                self.client
                    .get(self.url("users.lookupByEmail"))
                    .query(&[("email", n.recipient)]),
            )
            .await
            .map_err(|e| {
                warn!(recipient = n.recipient, error = %e, "slack user lookup failed");
                NotifyError::new(
                    NotifyErrorKind::RecipientNotFound,
                    n.recipient,
                    e.to_string(),
                )
            })?;
        let user = lookup.user;
        debug!(recipient = n.recipient, user = %user.name, "found slack user");

        let blocks = build_blocks(n)
            .map_err(|e| NotifyError::new(NotifyErrorKind::SendFailed, n.recipient, e))?;

        let conversation: ConversationOpen = self
            .call(
                self.client
                    .post(self.url("conversations.open"))
                    .json(&json!({ "users": user.id })),
            )
            .await
            .map_err(|e| {
                NotifyError::new(
                    NotifyErrorKind::ChannelOpenFailed,
                    n.recipient,
                    e.to_string(),
                )
            })?;
        debug!(channel = %conversation.channel.id, user = %user.id, "opened direct message");

        let _: Value = self
            .call(self.client.post(self.url("chat.postMessage")).json(&json!({
                "channel": conversation.channel.id,
                "text": format!("New notification from {}: {}", n.sender, n.subject),
                "blocks": blocks,
            })))
            .await
            .map_err(|e| {
                NotifyError::new(NotifyErrorKind::SendFailed, n.recipient, e.to_string())
            })?;

        info!(
            from = n.sender,
            recipient = n.recipient,
            user = %user.name,
            rich = n.use_rich_format,
            "forwarded message to slack"
        );
        Ok(())
    }
}

/// Lays out the message as divider, header, body sections, divider.
/// Fails when the body in the requested format is empty.
fn build_blocks(n: &Notification<'_>) -> Result<Vec<Value>, &'static str> {
    let body = if n.use_rich_format {
        let rendered = html_to_mrkdwn(&n.body.html);
        if rendered.is_empty() {
            return Err("empty HTML body");
        }
        rendered
    } else {
        if n.body.text.trim().is_empty() {
            return Err("empty plain text body");
        }
        escape(&n.body.text)
    };

    let header = format!(
        "*New notification from:* {}\n*To:* {}\n*Subject:* {}",
        escape(n.sender),
        escape(&n.recipients.join(", ")),
        escape(n.subject)
    );

    let mut blocks = vec![json!({ "type": "divider" }), section(&header)];
    blocks.extend(chunks(&body).iter().map(|text| section(text)));
    blocks.push(json!({ "type": "divider" }));
    Ok(blocks)
}

fn section(text: &str) -> Value {
    json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": text },
    })
}

/// Splits escaped mrkdwn into pieces that each fit one section block,
/// never inside an entity or a `<...>` link.
fn chunks(mrkdwn: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut rest = mrkdwn;

    while let Some(c) = rest.chars().next() {
        let len = match c {
            '&' => rest.find(';').map_or(1, |end| end + 1),
            '<' => rest.find('>').map_or(1, |end| end + 1),
            _ => c.len_utf8(),
        };
        let (piece, tail) = rest.split_at(len);
        if !current.is_empty() && current.len() + piece.len() > SECTION_TEXT_LIMIT {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(piece);
        rest = tail;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
