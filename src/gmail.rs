//! Gmail REST wire types and conversions between them and the domain model.

use crate::models::{Label, MessageEnvelope};
use base64::Engine as _;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};

pub mod api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: Option<String>,
        pub snippet: Option<String>,
        pub internal_date: Option<String>,
        pub payload: Option<MessagePart>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub mime_type: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<PartBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct PartBody {
        pub size: Option<u32>,
        pub data: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LabelColor {
        pub background_color: Option<String>,
        pub text_color: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LabelResource {
        pub id: String,
        pub name: String,
        pub color: Option<LabelColor>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct ListLabelsResponse {
        pub labels: Option<Vec<LabelResource>>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct Draft {
        pub id: String,
        pub message: Option<MessageRef>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListDraftsResponse {
        pub drafts: Option<Vec<Draft>>,
        pub next_page_token: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct Thread {
        pub id: String,
        pub messages: Option<Vec<GmailMessage>>,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Profile {
        pub email_address: String,
    }
}

impl From<api::LabelResource> for Label {
    fn from(l: api::LabelResource) -> Self {
        Label {
            id: l.id,
            name: l.name,
            color_foreground: l.color.as_ref().and_then(|c| c.text_color.clone()),
            color_background: l.color.as_ref().and_then(|c| c.background_color.clone()),
        }
    }
}

fn header<'a>(headers: &'a [api::Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Flattens a provider message into the envelope the pipeline works with.
pub fn normalize_message(msg: api::GmailMessage) -> MessageEnvelope {
    let empty = Vec::new();
    let headers = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .unwrap_or(&empty);

    let body = msg
        .payload
        .as_ref()
        .and_then(|p| extract_text_body(p, "text/plain"));

    MessageEnvelope {
        thread_id: msg.thread_id.clone().unwrap_or_else(|| msg.id.clone()),
        subject: header(headers, "Subject").unwrap_or_default().to_string(),
        sender: header(headers, "From").unwrap_or_default().to_string(),
        reply_to: header(headers, "Reply-To").map(str::to_string),
        snippet: msg.snippet.clone().unwrap_or_default(),
        internal_date: msg
            .internal_date
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0),
        body,
        rfc_message_id: header(headers, "Message-ID").map(str::to_string),
        references: header(headers, "References").map(str::to_string),
        id: msg.id,
    }
}

fn decode_body_data(data: &str) -> Option<String> {
    let trimmed = data.trim();
    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed.trim_end_matches('='))
        .or_else(|_| general_purpose::STANDARD.decode(trimmed))
        .ok()?;
    String::from_utf8(decoded).ok()
}

fn extract_text_body(part: &api::MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime_type) {
        if let Some(text) = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_body_data)
        {
            return Some(text);
        }
    }

    let full_body: String = part
        .parts
        .iter()
        .flatten()
        .filter_map(|p| extract_text_body(p, mime_type))
        .collect();
    if full_body.is_empty() {
        None
    } else {
        Some(full_body)
    }
}

/// `In-Reply-To` / `References` values for a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeaders {
    pub in_reply_to: String,
    pub references: String,
}

/// Threading headers for replying to `envelope`.
///
/// Prefers the thread's copy of the message (or its last message carrying a
/// `Message-ID`), then the envelope's own headers, then a synthesized id.
pub fn reply_headers(thread: Option<&api::Thread>, envelope: &MessageEnvelope) -> ReplyHeaders {
    let from_thread = thread.and_then(|t| {
        let messages = t.messages.as_deref().unwrap_or_default();
        let with_id = |m: &&api::GmailMessage| {
            m.payload
                .as_ref()
                .and_then(|p| p.headers.as_deref())
                .and_then(|h| header(h, "Message-ID"))
                .is_some()
        };
        let chosen = messages
            .iter()
            .filter(with_id)
            .find(|m| m.id == envelope.id)
            .or_else(|| messages.iter().filter(with_id).last())?;
        let headers = chosen.payload.as_ref()?.headers.as_deref()?;
        Some((
            header(headers, "Message-ID")?.to_string(),
            header(headers, "References").map(str::to_string),
        ))
    });

    let (message_id, references) = match from_thread {
        Some(found) => found,
        None => match &envelope.rfc_message_id {
            Some(id) => (id.clone(), envelope.references.clone()),
            None => (format!("<{}@mail.gmail.com>", envelope.id), None),
        },
    };

    let references = match references.filter(|r| !r.trim().is_empty()) {
        Some(prior) if prior.contains(&message_id) => prior,
        Some(prior) => format!("{} {}", prior.trim(), message_id),
        None => message_id.clone(),
    };

    ReplyHeaders {
        in_reply_to: message_id,
        references,
    }
}

fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", general_purpose::STANDARD.encode(value))
    }
}

/// Builds the RFC 5322 reply and returns it base64url-encoded for the `raw` field.
pub fn compose_reply(to: &str, subject: &str, body: &str, headers: &ReplyHeaders) -> String {
    let message = format!(
        "To: {}\r\nSubject: {}\r\nIn-Reply-To: {}\r\nReferences: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\nContent-Transfer-Encoding: 8bit\r\n\r\n{}",
        to,
        encode_header_value(&reply_subject(subject)),
        headers.in_reply_to,
        headers.references,
        body
    );
    general_purpose::URL_SAFE_NO_PAD.encode(message.as_bytes())
}

/// User-facing link to a draft, addressed by its UI message id.
pub fn draft_link(ui_id: &str) -> String {
    format!("https://mail.google.com/mail/u/0/#drafts?compose={}", ui_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DraftRefKind {
    /// API-level draft id (`r-…`), accepted by `drafts/send` directly.
    DraftId,
    /// UI-addressable message id, usually lifted out of a draft link.
    MessageId,
}

/// A draft reference in whatever form it was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRef {
    pub kind: DraftRefKind,
    pub id: String,
}

impl DraftRef {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(pos) = raw.find("compose=") {
            let id: String = raw[pos + "compose=".len()..]
                .chars()
                .take_while(|c| !matches!(c, '&' | '#' | '/' | '?'))
                .collect();
            return (!id.is_empty()).then_some(DraftRef {
                kind: DraftRefKind::MessageId,
                id,
            });
        }

        if raw.starts_with("http") || raw.contains('#') {
            let id = raw
                .rsplit(['/', '#'])
                .find(|segment| !segment.is_empty())?
                .to_string();
            return Some(DraftRef {
                kind: DraftRefKind::MessageId,
                id,
            });
        }

        Some(DraftRef {
            kind: DraftRefKind::DraftId,
            id: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_json() -> api::GmailMessage {
        serde_json::from_value(json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Hi, where is my order",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "Subject", "value": "Where is my order?"},
                    {"name": "From", "value": "Alice <alice@customer.test>"},
                    {"name": "Message-Id", "value": "<abc@customer.test>"}
                ],
                "parts": [
                    {"mimeType": "text/plain", "body": {"size": 11, "data": "SGVsbG8gd29ybGQ"}},
                    {"mimeType": "text/html", "body": {"size": 18, "data": "PGI-SGVsbG88L2I-"}}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn normalizes_headers_and_plain_body() {
        let envelope = normalize_message(message_json());
        assert_eq!(envelope.id, "m1");
        assert_eq!(envelope.thread_id, "t1");
        assert_eq!(envelope.subject, "Where is my order?");
        assert_eq!(envelope.sender, "Alice <alice@customer.test>");
        assert_eq!(envelope.internal_date, 1_700_000_000_000);
        assert_eq!(envelope.body.as_deref(), Some("Hello world"));
        assert_eq!(envelope.rfc_message_id.as_deref(), Some("<abc@customer.test>"));
    }

    #[test]
    fn reply_headers_fall_back_to_synthesized_reference() {
        let envelope = MessageEnvelope {
            id: "m9".into(),
            ..Default::default()
        };
        let headers = reply_headers(None, &envelope);
        assert_eq!(headers.in_reply_to, "<m9@mail.gmail.com>");
        assert_eq!(headers.references, "<m9@mail.gmail.com>");
    }

    #[test]
    fn reply_headers_extend_thread_references() {
        let thread: api::Thread = serde_json::from_value(json!({
            "id": "t1",
            "messages": [{
                "id": "m1",
                "payload": {"headers": [
                    {"name": "Message-ID", "value": "<second@x>"},
                    {"name": "References", "value": "<first@x>"}
                ]}
            }]
        }))
        .unwrap();
        let envelope = MessageEnvelope {
            id: "m1".into(),
            ..Default::default()
        };
        let headers = reply_headers(Some(&thread), &envelope);
        assert_eq!(headers.in_reply_to, "<second@x>");
        assert_eq!(headers.references, "<first@x> <second@x>");
    }

    #[test]
    fn composed_reply_decodes_to_threaded_message() {
        let headers = ReplyHeaders {
            in_reply_to: "<a@x>".into(),
            references: "<a@x>".into(),
        };
        let raw = compose_reply("alice@customer.test", "Commande reçue", "Bonjour", &headers);
        let decoded =
            String::from_utf8(general_purpose::URL_SAFE_NO_PAD.decode(raw).unwrap()).unwrap();
        assert!(decoded.contains("To: alice@customer.test\r\n"));
        assert!(decoded.contains("Subject: =?UTF-8?B?"));
        assert!(decoded.contains("In-Reply-To: <a@x>\r\n"));
        assert!(decoded.ends_with("\r\n\r\nBonjour"));
        assert_eq!(reply_subject("RE: hello"), "RE: hello");
    }

    #[test]
    fn draft_refs_parse_from_ids_and_links() {
        assert_eq!(
            DraftRef::parse("r-5123"),
            Some(DraftRef { kind: DraftRefKind::DraftId, id: "r-5123".into() })
        );
        assert_eq!(
            DraftRef::parse(&draft_link("18c0ffee")),
            Some(DraftRef { kind: DraftRefKind::MessageId, id: "18c0ffee".into() })
        );
        assert_eq!(
            DraftRef::parse("https://mail.google.com/mail/u/0/#drafts/18c0ffee"),
            Some(DraftRef { kind: DraftRefKind::MessageId, id: "18c0ffee".into() })
        );
        assert_eq!(DraftRef::parse("  "), None);
    }
}
