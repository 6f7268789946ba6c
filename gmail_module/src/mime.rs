//! Reply MIME assembly and inbound message parsing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::provider::OutgoingReply;
use crate::types::{GmailMessage, InboundEmail, MessagePart};

/// Prefix a subject with "Re:" without stacking prefixes on replies to
/// replies.
pub fn reply_subject(original: &str) -> String {
    let trimmed = original.trim();
    // get() rather than slicing: the first three bytes of a multibyte
    // subject need not fall on a char boundary.
    if trimmed
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"))
    {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

/// Extract the bare address from a `Display Name <addr>` header value and
/// lowercase it.
pub fn extract_address(value: &str) -> String {
    let trimmed = value.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed,
    };
    inner.trim().to_ascii_lowercase()
}

/// Build the base64url-encoded RFC 822 payload for a reply. The threading
/// headers reference the original Message-ID so mail clients collapse the
/// reply into the existing conversation.
pub fn build_raw_reply(reply: &OutgoingReply) -> String {
    let mut lines = Vec::new();
    lines.push(format!("To: {}", reply.to));
    lines.push(format!("Subject: {}", reply.subject));
    if let Some(message_id) = reply.in_reply_to.as_deref() {
        lines.push(format!("In-Reply-To: {}", message_id));
        lines.push(format!("References: {}", message_id));
    }
    lines.push("MIME-Version: 1.0".to_string());
    lines.push("Content-Type: text/plain; charset=\"UTF-8\"".to_string());
    lines.push(String::new());
    lines.push(reply.body.clone());

    let rfc822 = lines.join("\r\n");
    URL_SAFE_NO_PAD.encode(rfc822.as_bytes())
}

pub(crate) fn parse_inbound(message: GmailMessage) -> InboundEmail {
    let (sender, subject, rfc822_message_id, body) = match message.payload {
        Some(ref payload) => {
            let sender = header_value(payload, "From")
                .map(|value| extract_address(&value))
                .unwrap_or_default();
            let subject = header_value(payload, "Subject").unwrap_or_default();
            let message_id = header_value(payload, "Message-ID");
            let body = extract_text_body(payload).unwrap_or_default();
            (sender, subject, message_id, body)
        }
        None => (String::new(), String::new(), None, String::new()),
    };

    InboundEmail {
        id: message.id,
        thread_id: message.thread_id,
        sender,
        subject,
        body,
        rfc822_message_id,
    }
}

fn header_value(part: &MessagePart, name: &str) -> Option<String> {
    part.headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.clone())
}

/// Walk the part tree preferring `text/plain`. Gmail base64url-encodes part
/// bodies.
fn extract_text_body(part: &MessagePart) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case("text/plain") {
        if let Some(data) = part.body.as_ref().and_then(|body| body.data.as_deref()) {
            if let Some(decoded) = decode_body(data) {
                return Some(decoded);
            }
        }
    }
    for child in &part.parts {
        if let Some(text) = extract_text_body(child) {
            return Some(text);
        }
    }
    // Fall back to whatever body the top-level part carries.
    part.body
        .as_ref()
        .and_then(|body| body.data.as_deref())
        .and_then(decode_body)
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()?;
    String::from_utf8(bytes).ok()
}
