//! Target filtering and content classification.
//!
//! A raw payload is inspected exactly once here. Everything downstream works on
//! [`MessageContent`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transport::{MediaKind, RawMessage};

/// Closed set of content variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        caption: Option<String>,
        mime_type: Option<String>,
    },
    /// A selection made on an interactive message.
    StructuredReply {
        kind: ReplyKind,
        selected_id: String,
        text: Option<String>,
    },
    Unsupported {
        kind: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Button,
    List,
    Template,
}

impl MessageContent {
    pub fn variant(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Media { .. } => "media",
            MessageContent::StructuredReply { .. } => "structured_reply",
            MessageContent::Unsupported { .. } => "unsupported",
        }
    }

    /// Human-readable body, if the variant has one.
    pub fn body(&self) -> Option<&str> {
        match self {
            MessageContent::Text { body } => Some(body),
            MessageContent::Media { caption, .. } => caption.as_deref(),
            MessageContent::StructuredReply {
                text, selected_id, ..
            } => Some(text.as_deref().unwrap_or(selected_id)),
            MessageContent::Unsupported { .. } => None,
        }
    }

    /// Text the fallback dedup key is computed over.
    pub fn dedup_text(&self) -> String {
        match self {
            MessageContent::Text { body } => body.clone(),
            MessageContent::Media { kind, caption, .. } => {
                format!("[{}]{}", kind.as_str(), caption.as_deref().unwrap_or(""))
            }
            MessageContent::StructuredReply { selected_id, .. } => {
                format!("[reply]{}", selected_id)
            }
            MessageContent::Unsupported { kind } => format!("[{}]", kind),
        }
    }

    pub fn is_forward_eligible(&self) -> bool {
        !matches!(self, MessageContent::Unsupported { .. })
    }
}

/// Why a raw event produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Broadcast, group, status or system channel.
    NonAddressable,
    /// Protocol bookkeeping with no user content.
    ProtocolOnly,
}

/// Payload keys that carry no user content.
const PROTOCOL_KEYS: &[&str] = &[
    "protocolMessage",
    "senderKeyDistributionMessage",
    "messageContextInfo",
    "keepInChatMessage",
    "pollUpdateMessage",
];

/// Wrappers whose inner `message` holds the real payload.
const WRAPPER_KEYS: &[&str] = &[
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "documentWithCaptionMessage",
    "editedMessage",
];

/// Whether a chat address can carry one-to-one user messages.
pub fn is_addressable(remote: &str) -> bool {
    let remote = remote.trim();
    !(remote.is_empty()
        || remote.ends_with("@broadcast")
        || remote.ends_with("@g.us")
        || remote.ends_with("@newsletter")
        || remote.ends_with("@call"))
}

/// Filter and classify a raw message.
pub fn classify(raw: &RawMessage) -> Result<MessageContent, SkipReason> {
    if !is_addressable(&raw.remote) {
        return Err(SkipReason::NonAddressable);
    }
    let payload = raw.payload.as_object().ok_or(SkipReason::ProtocolOnly)?;
    classify_payload(payload, 0)
}

fn classify_payload(payload: &Map<String, Value>, depth: u8) -> Result<MessageContent, SkipReason> {
    for key in WRAPPER_KEYS {
        if let Some(inner) = payload.get(*key).and_then(|w| w.get("message")).and_then(Value::as_object) {
            if depth < 4 {
                return classify_payload(inner, depth + 1);
            }
        }
    }

    let mut keys = payload
        .iter()
        .filter(|(k, v)| !PROTOCOL_KEYS.contains(&k.as_str()) && !v.is_null());

    let Some((key, value)) = keys.next() else {
        return Err(SkipReason::ProtocolOnly);
    };

    let content = match key.as_str() {
        "conversation" => MessageContent::Text {
            body: value.as_str().unwrap_or_default().to_string(),
        },
        "extendedTextMessage" => MessageContent::Text {
            body: str_field(value, "text").unwrap_or_default(),
        },
        "imageMessage" => media(MediaKind::Image, value),
        "videoMessage" => media(MediaKind::Video, value),
        "audioMessage" => media(MediaKind::Audio, value),
        "documentMessage" => media(MediaKind::Document, value),
        "stickerMessage" => media(MediaKind::Sticker, value),
        "buttonsResponseMessage" => MessageContent::StructuredReply {
            kind: ReplyKind::Button,
            selected_id: str_field(value, "selectedButtonId").unwrap_or_default(),
            text: str_field(value, "selectedDisplayText"),
        },
        "listResponseMessage" => MessageContent::StructuredReply {
            kind: ReplyKind::List,
            selected_id: value
                .get("singleSelectReply")
                .and_then(|r| str_field(r, "selectedRowId"))
                .unwrap_or_default(),
            text: str_field(value, "title"),
        },
        "templateButtonReplyMessage" => MessageContent::StructuredReply {
            kind: ReplyKind::Template,
            selected_id: str_field(value, "selectedId").unwrap_or_default(),
            text: str_field(value, "selectedDisplayText"),
        },
        other => MessageContent::Unsupported {
            kind: other.trim_end_matches("Message").to_string(),
        },
    };

    if let MessageContent::Text { body } = &content {
        if body.trim().is_empty() {
            return Err(SkipReason::ProtocolOnly);
        }
    }
    Ok(content)
}

fn media(kind: MediaKind, value: &Value) -> MessageContent {
    MessageContent::Media {
        kind,
        caption: str_field(value, "caption").filter(|c| !c.is_empty()),
        mime_type: str_field(value, "mimetype"),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn raw(remote: &str, payload: Value) -> RawMessage {
        RawMessage {
            id: Some("M-1".to_string()),
            remote: remote.to_string(),
            participant: None,
            from_me: false,
            timestamp: Utc::now(),
            push_name: None,
            attributes: HashMap::new(),
            payload,
        }
    }

    const PEER: &str = "15550001111@s.whatsapp.net";

    #[test]
    fn test_non_addressable_targets_are_filtered() {
        for remote in [
            "status@broadcast",
            "1234@broadcast",
            "120363@g.us",
            "99@newsletter",
            "",
        ] {
            assert_eq!(
                classify(&raw(remote, json!({"conversation": "hi"}))),
                Err(SkipReason::NonAddressable),
                "{}",
                remote
            );
        }
    }

    #[test]
    fn test_protocol_only_payloads_are_filtered() {
        let cases = [
            json!({"protocolMessage": {"type": 0}}),
            json!({"senderKeyDistributionMessage": {}, "messageContextInfo": {}}),
            json!({}),
            json!({"conversation": "   "}),
            json!(null),
        ];
        for payload in cases {
            assert_eq!(classify(&raw(PEER, payload)), Err(SkipReason::ProtocolOnly));
        }
    }

    #[test]
    fn test_text_variants() {
        assert_eq!(
            classify(&raw(PEER, json!({"conversation": "hello"}))),
            Ok(MessageContent::Text {
                body: "hello".to_string()
            })
        );
        assert_eq!(
            classify(&raw(
                PEER,
                json!({"extendedTextMessage": {"text": "link https://x.y"}, "messageContextInfo": {}})
            )),
            Ok(MessageContent::Text {
                body: "link https://x.y".to_string()
            })
        );
    }

    #[test]
    fn test_media_and_wrappers() {
        let payload = json!({
            "ephemeralMessage": {"message": {
                "imageMessage": {"caption": "look", "mimetype": "image/jpeg"}
            }}
        });
        assert_eq!(
            classify(&raw(PEER, payload)),
            Ok(MessageContent::Media {
                kind: MediaKind::Image,
                caption: Some("look".to_string()),
                mime_type: Some("image/jpeg".to_string()),
            })
        );
    }

    #[test]
    fn test_structured_replies() {
        let content = classify(&raw(
            PEER,
            json!({"buttonsResponseMessage": {"selectedButtonId": "yes", "selectedDisplayText": "Yes"}}),
        ))
        .unwrap();
        assert_eq!(content.body(), Some("Yes"));
        assert_eq!(content.dedup_text(), "[reply]yes");

        let content = classify(&raw(
            PEER,
            json!({"listResponseMessage": {"title": "Plan B", "singleSelectReply": {"selectedRowId": "row-2"}}}),
        ))
        .unwrap();
        assert!(matches!(
            content,
            MessageContent::StructuredReply { kind: ReplyKind::List, ref selected_id, .. } if selected_id == "row-2"
        ));
    }

    #[test]
    fn test_unknown_shape_is_unsupported_and_not_forwarded() {
        let content = classify(&raw(PEER, json!({"reactionMessage": {"text": "+1"}}))).unwrap();
        assert_eq!(
            content,
            MessageContent::Unsupported {
                kind: "reaction".to_string()
            }
        );
        assert!(!content.is_forward_eligible());
    }
}
