//! Message model and the line-oriented client wire format.
//!
//! Every client frame is a single LF-terminated line of the form
//! `FORMAT:<fmt>|<payload>` where `<fmt>` is one of `JSON`, `XML` or
//! `RAW`. The broker decodes only enough of the payload to extract the
//! routing topic; the payload itself is carried through to subscribers
//! byte-for-byte.

use serde::Deserialize;
use serde::Serialize;

use crate::error::ProtocolError;
use crate::MessageSummary;

/// The role tag sent as the first seven bytes of a client connection.
pub const ROLE_TAG_LEN: usize = 7;
/// Role tag for publisher connections.
pub const ROLE_PUBLISHER: &[u8; ROLE_TAG_LEN] = b"PUBLISH";
/// Role tag for subscriber connections.
pub const ROLE_SUBSCRIBER: &[u8; ROLE_TAG_LEN] = b"SUBSCRI";

/// The payload encoding declared by a publisher frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadFormat {
    Json,
    Xml,
    Raw,
}

impl PayloadFormat {
    /// The wire token used in the `FORMAT:` prefix.
    pub fn wire_name(&self) -> &'static str {
        match self {
            PayloadFormat::Json => "JSON",
            PayloadFormat::Xml => "XML",
            PayloadFormat::Raw => "RAW",
        }
    }

    /// Parse a wire token.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "JSON" => Some(PayloadFormat::Json),
            "XML" => Some(PayloadFormat::Xml),
            "RAW" => Some(PayloadFormat::Raw),
            _ => None,
        }
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A topic-tagged message as accepted from a publisher.
///
/// `id`, `event_name` and `value` are decoded from the payload when the
/// format allows it and are informational; the broker routes purely on
/// `topic` and assigns its own sequence number on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Publisher-assigned ID, opaque to the broker.
    pub id: u64,
    pub event_name: String,
    pub value: String,
    /// The routing topic extracted from the payload.
    pub topic: String,
    pub format: PayloadFormat,
    /// The raw payload exactly as received, without the `FORMAT:` prefix.
    pub body: String,
}

impl Message {
    /// Re-encode this message as an outbound subscriber frame, without
    /// the trailing newline.
    pub fn to_frame(&self) -> String {
        format!("FORMAT:{}|{}", self.format, self.body)
    }

    /// Parse a publisher line (no trailing newline) into a message.
    pub fn parse_frame(line: &str) -> Result<Message, ProtocolError> {
        let rest = line
            .strip_prefix("FORMAT:")
            .ok_or_else(|| ProtocolError::MalformedFrame(truncated(line)))?;
        let sep = rest
            .find('|')
            .ok_or_else(|| ProtocolError::MalformedFrame(truncated(line)))?;
        let format = PayloadFormat::from_wire_name(&rest[..sep])
            .ok_or_else(|| ProtocolError::MalformedFrame(truncated(line)))?;
        let body = &rest[sep + 1..];

        let (topic, id, event_name, value) = match format {
            PayloadFormat::Json => decode_json(body)?,
            PayloadFormat::Xml => decode_xml(body)?,
            PayloadFormat::Raw => decode_raw(body)?,
        };

        Ok(Message {
            id,
            event_name,
            value,
            topic,
            format,
            body: body.to_string(),
        })
    }

    /// Build a message from a normalized admin publish request, where the
    /// body may be either the bare payload or a full `FORMAT:…|…` frame.
    pub fn from_parts(topic: &str, format: PayloadFormat, body: &str) -> Result<Message, ProtocolError> {
        let framed = if body.starts_with("FORMAT:") {
            body.to_string()
        } else {
            format!("FORMAT:{}|{}", format, body)
        };
        let mut msg = Message::parse_frame(&framed).or_else(|err| {
            // A body without an embedded topic is still publishable when
            // the request names the topic explicitly.
            if err == ProtocolError::MissingTopic && !topic.is_empty() {
                Ok(Message {
                    id: 0,
                    event_name: String::new(),
                    value: String::new(),
                    topic: topic.to_string(),
                    format,
                    body: body.to_string(),
                })
            } else {
                Err(err)
            }
        })?;
        if msg.topic.is_empty() {
            msg.topic = topic.to_string();
        }
        if msg.topic.is_empty() {
            return Err(ProtocolError::MissingTopic);
        }
        Ok(msg)
    }
}

impl MessageSummary for Message {
    fn summary(&self) -> String {
        format!("topic={}, format={}, len={}", self.topic, self.format, self.body.len())
    }
}

fn truncated(line: &str) -> String {
    const MAX: usize = 64;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let mut end = MAX;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &line[..end])
    }
}

fn decode_json(body: &str) -> Result<(String, u64, String, String), ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|err| ProtocolError::MalformedFrame(err.to_string()))?;
    let topic = value
        .get("Topic")
        .and_then(|v| v.as_str())
        .ok_or(ProtocolError::MissingTopic)?
        .to_string();
    let id = value.get("Id").and_then(|v| v.as_u64()).unwrap_or(0);
    let event_name = value
        .get("EventName")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let val = value.get("Value").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    Ok((topic, id, event_name, val))
}

fn decode_xml(body: &str) -> Result<(String, u64, String, String), ProtocolError> {
    let topic = xml_element(body, "Topic").ok_or(ProtocolError::MissingTopic)?;
    let id = xml_element(body, "Id").and_then(|v| v.parse().ok()).unwrap_or(0);
    let event_name = xml_element(body, "EventName").unwrap_or_default();
    let value = xml_element(body, "Value").unwrap_or_default();
    Ok((topic, id, event_name, value))
}

fn decode_raw(body: &str) -> Result<(String, u64, String, String), ProtocolError> {
    // RAW payloads route on a leading `[topic] ` tag.
    let rest = body.strip_prefix('[').ok_or(ProtocolError::MissingTopic)?;
    let end = rest.find(']').ok_or(ProtocolError::MissingTopic)?;
    let topic = rest[..end].to_string();
    if topic.is_empty() {
        return Err(ProtocolError::MissingTopic);
    }
    let value = rest[end + 1..].trim_start().to_string();
    Ok((topic, 0, String::new(), value))
}

/// Extract the text of the first `<name>…</name>` element, non-nested.
fn xml_element(body: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}
