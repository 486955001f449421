use mail_parser::{Address, MessageParser, PartType};
use miette::Diagnostic;
use thiserror::Error;

/// The two renderings a message may carry. Either may be empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBody {
    pub html: String,
    pub text: String,
}

/// A received message reduced to what gets forwarded.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub from: String,
    /// `To` header addresses in header order, duplicates kept.
    pub to: Vec<String>,
    pub subject: String,
    pub body: MessageBody,
}

#[derive(Debug, Error, Diagnostic)]
pub enum MessageError {
    #[error("message could not be parsed")]
    #[diagnostic(code(message::unparseable))]
    Unparseable,

    #[error("message has no From address")]
    #[diagnostic(code(message::missing_sender))]
    MissingSender,

    #[error("message from {from} has no To address")]
    #[diagnostic(code(message::missing_recipients))]
    MissingRecipients { from: String },
}

pub fn parse(raw: &[u8]) -> Result<ParsedMessage, MessageError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(MessageError::Unparseable)?;

    let from = message
        .from()
        .map(addresses)
        .and_then(|senders| senders.into_iter().next())
        .ok_or(MessageError::MissingSender)?;

    let to = message.to().map(addresses).unwrap_or_default();
    if to.is_empty() {
        return Err(MessageError::MissingRecipients { from });
    }

    // Only parts that really are HTML or plain text. The parser would otherwise
    // offer the text part as HTML and vice versa.
    let html = message
        .html_part(0)
        .and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        })
        .unwrap_or_default();
    let text = message
        .text_part(0)
        .and_then(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        })
        .unwrap_or_default();

    Ok(ParsedMessage {
        from,
        to,
        subject: message.subject().unwrap_or_default().to_string(),
        body: MessageBody { html, text },
    })
}

/// Flattens address lists and groups, skipping entries without an address.
fn addresses(address: &Address) -> Vec<String> {
    let addrs: Vec<_> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };

    addrs
        .into_iter()
        .filter_map(|addr| addr.address())
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_message() {
        let raw = b"From: Alice <alice@example.com>\r\n\
To: a@x.com, \"Bob\" <b@y.com>\r\n\
Subject: Disk almost full\r\n\
\r\n\
/var is at 95%\r\n";

        let msg = parse(raw).unwrap();
        assert_eq!(msg.from, "alice@example.com");
        assert_eq!(msg.to, vec!["a@x.com", "b@y.com"]);
        assert_eq!(msg.subject, "Disk almost full");
        assert_eq!(msg.body.text.trim_end(), "/var is at 95%");
        assert_eq!(msg.body.html, "");
    }

    #[test]
    fn test_parse_multipart_alternative() {
        let raw = b"From: alerts@example.com\r\n\
To: ops@example.com\r\n\
Subject: Report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
\r\n\
--sep\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain version\r\n\
--sep\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html version</p>\r\n\
--sep--\r\n";

        let msg = parse(raw).unwrap();
        assert_eq!(msg.body.text.trim_end(), "plain version");
        assert_eq!(msg.body.html.trim_end(), "<p>html version</p>");
    }

    #[test]
    fn test_html_only_message_has_no_text() {
        let raw = b"From: alerts@example.com\r\n\
To: ops@example.com\r\n\
Content-Type: text/html\r\n\
\r\n\
<b>hi</b>\r\n";

        let msg = parse(raw).unwrap();
        assert_eq!(msg.body.html.trim_end(), "<b>hi</b>");
        assert_eq!(msg.body.text, "");
        assert_eq!(msg.subject, "");
    }

    #[test]
    fn test_recipients_keep_order_and_duplicates() {
        let raw = b"From: s@example.com\r\n\
To: b@y.com, a@x.com, b@y.com\r\n\
\r\n\
body\r\n";
        assert_eq!(
            parse(raw).unwrap().to,
            vec!["b@y.com", "a@x.com", "b@y.com"]
        );
    }

    #[test]
    fn test_group_recipients_are_flattened() {
        let raw = b"From: s@example.com\r\n\
To: Team: a@x.com, b@x.com;, c@y.com\r\n\
\r\n\
body\r\n";
        let to = parse(raw).unwrap().to;
        assert_eq!(to, vec!["a@x.com", "b@x.com", "c@y.com"]);
    }

    #[test]
    fn test_missing_sender() {
        let raw = b"To: a@x.com\r\nSubject: no sender\r\n\r\nbody\r\n";
        assert!(matches!(parse(raw), Err(MessageError::MissingSender)));
    }

    #[test]
    fn test_missing_recipients() {
        let raw = b"From: s@example.com\r\nCc: a@x.com\r\n\r\nbody\r\n";
        match parse(raw) {
            Err(MessageError::MissingRecipients { from }) => assert_eq!(from, "s@example.com"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
