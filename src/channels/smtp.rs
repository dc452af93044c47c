//! SMTP message sink: composes the forwarded message with lettre and sends
//! it over an authenticated relay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use regex::Regex;
use secrecy::ExposeSecret;

use crate::config::SmtpConfig;
use crate::error::{ConfigError, SinkError};
use crate::pipeline::{Message, MessageSink};

const NO_CONTENT: &str = "[No text content available]";

pub struct SmtpSink {
    from: Mailbox,
    transport: SmtpTransport,
    html: HtmlToText,
}

impl SmtpSink {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let from = config
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "RELAY_SMTP_FROM".into(),
                message: e.to_string(),
            })?;

        let mut builder = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| ConfigError::InvalidValue {
                key: "RELAY_SMTP_HOST".into(),
                message: format!("SMTP relay error: {e}"),
            })?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ));
        }

        let html = HtmlToText::new().map_err(|e| ConfigError::InvalidValue {
            key: "html_to_text".into(),
            message: e.to_string(),
        })?;

        Ok(Self {
            from,
            transport: builder.build(),
            html,
        })
    }
}

#[async_trait]
impl MessageSink for SmtpSink {
    async fn send(&self, message: &Message, target: &str) -> Result<(), SinkError> {
        let email = compose_forward(message, &self.from, target, Utc::now(), &self.html)?;

        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| SinkError::Rejected(format!("SMTP send task panicked: {e}")))?
            .map(|_| ())
            .map_err(|e| classify(&e))
    }
}

/// Transient (4xx) replies and anything mentioning rate or quota are worth
/// retrying; everything else is permanent.
fn classify(err: &lettre::transport::smtp::Error) -> SinkError {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if err.is_transient() || lowered.contains("rate") || lowered.contains("quota") {
        SinkError::RateLimited(text)
    } else {
        SinkError::Rejected(text)
    }
}

fn raw_header(name: &'static str, value: String) -> HeaderValue {
    HeaderValue::new(HeaderName::new_from_ascii_str(name), value)
}

/// Build the forwarded message for `target`.
pub fn compose_forward(
    original: &Message,
    from: &Mailbox,
    target: &str,
    now: DateTime<Utc>,
    html: &HtmlToText,
) -> Result<lettre::Message, SinkError> {
    let to = target
        .parse::<Mailbox>()
        .map_err(|e| SinkError::Rejected(format!("invalid target address '{target}': {e}")))?;

    let mut builder = lettre::Message::builder()
        .from(from.clone())
        .to(to)
        .subject(format!("Fwd: {}", original.subject))
        .date(now.into());

    if !original.from.is_empty() {
        builder = builder.raw_header(raw_header("X-Original-From", original.from.clone()));
    }
    if !original.to.is_empty() {
        builder = builder.raw_header(raw_header("X-Original-To", original.to.join(", ")));
    }
    if !original.cc.is_empty() {
        builder = builder.raw_header(raw_header("X-Original-Cc", original.cc.join(", ")));
    }
    builder = builder
        .raw_header(raw_header("X-Original-Message-ID", original.id.clone()))
        .raw_header(raw_header("X-Forwarded-At", now.to_rfc3339()));

    let body = forward_body(original, now, html);

    let result = if original.attachments.is_empty() {
        builder.header(ContentType::TEXT_PLAIN).body(body)
    } else {
        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(body));
        for attachment in &original.attachments {
            let content_type = ContentType::parse(&attachment.mime_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| SinkError::Rejected(format!("attachment content type: {e}")))?;
            parts = parts.singlepart(
                MimeAttachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(parts)
    };

    result.map_err(|e| SinkError::Rejected(format!("failed to build forward: {e}")))
}

/// Plain-text body: a "Forwarded message" preamble followed by the
/// original text (or HTML rendered as text).
pub fn forward_body(original: &Message, now: DateTime<Utc>, html: &HtmlToText) -> String {
    let mut body = String::from("---------- Forwarded message ----------\n");
    body.push_str(&format!("From: {}\n", original.from));
    if !original.to.is_empty() {
        body.push_str(&format!("To: {}\n", original.to.join(", ")));
    }
    if !original.cc.is_empty() {
        body.push_str(&format!("Cc: {}\n", original.cc.join(", ")));
    }
    let date = original.received_at.unwrap_or(now);
    body.push_str(&format!("Date: {}\n", date.to_rfc2822()));
    body.push_str(&format!("Subject: {}\n", original.subject));
    body.push_str(&format!("Message-ID: {}\n\n", original.id));

    let text = original
        .text_body
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .or_else(|| {
            original
                .html_body
                .as_deref()
                .map(|h| html.convert(h))
                .filter(|t| !t.is_empty())
        })
        .unwrap_or_else(|| NO_CONTENT.to_string());
    body.push_str(&text);
    body
}

/// Simple HTML → text rendering for bodies with no plain-text part.
pub struct HtmlToText {
    breaks: Regex,
    tags: Regex,
    blank_runs: Regex,
}

impl HtmlToText {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            breaks: Regex::new(r"(?i)<br\s*/?>|</?p\s*>|</?div\s*>")?,
            tags: Regex::new(r"<[^>]*>")?,
            blank_runs: Regex::new(r"\n{3,}")?,
        })
    }

    pub fn convert(&self, html: &str) -> String {
        let text = self.breaks.replace_all(html, "\n");
        let text = self.tags.replace_all(&text, "");
        let text = text
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&amp;", "&")
            .replace("\r\n", "\n")
            .replace('\r', "\n");
        self.blank_runs
            .replace_all(text.trim(), "\n\n")
            .into_owned()
    }
}
