//! Raw RFC 5322 → `Message` conversion shared by the sources.

use chrono::{DateTime, Utc};
use mail_parser::{Address, MessageParser, MimeHeaders};

use crate::pipeline::{Attachment, Message};

/// Parse a raw message. `fallback_id` is used when there is no
/// `Message-ID` header. Returns `None` when the bytes are not a message.
pub fn parse_raw(raw: &[u8], fallback_id: &str) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let id = parsed
        .message_id()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());

    let attachments = parsed
        .attachments()
        .map(|part| {
            let mime_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into());
            Attachment {
                filename: MimeHeaders::attachment_name(part)
                    .unwrap_or("attachment")
                    .to_string(),
                mime_type,
                data: part.contents().to_vec(),
            }
        })
        .collect();

    Some(Message {
        id,
        subject: parsed.subject().unwrap_or_default().to_string(),
        from: parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_default(),
        to: addresses(parsed.to()),
        cc: addresses(parsed.cc()),
        text_body: parsed.body_text(0).map(|t| t.to_string()),
        html_body: parsed.body_html(0).map(|h| h.to_string()),
        attachments,
        received_at: parsed
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
    })
}

fn addresses(addr: Option<&Address<'_>>) -> Vec<String> {
    addr.map(|a| {
        a.iter()
            .filter_map(|a| a.address())
            .map(|s| s.to_string())
            .collect()
    })
    .unwrap_or_default()
}
