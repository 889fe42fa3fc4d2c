//! Envelope decoder — turns raw uplink frames into typed text messages.
//!
//! The mesh gateway republishes packets as JSON envelopes. Only
//! text-application packets addressed through a known gateway survive
//! decoding; everything else (telemetry, positions, foreign encodings)
//! is a [`DecodeError`] the caller drops after a debug log.

use serde::Deserialize;

use crate::error::DecodeError;

/// Reserved destination meaning "everyone on the channel".
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// A decoded inbound text message. Immutable; one per uplink frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Numeric node id of the sender.
    pub sender: u32,
    /// Numeric destination node id; [`BROADCAST_ADDR`] means public.
    pub dest: u32,
    /// Mesh channel index the packet arrived on.
    pub channel: u32,
    /// Gateway node id (`!hex` form) recovered from the topic tail.
    /// Downlinks to this sender are addressed through it.
    pub gateway: String,
    /// UTF-8 message text.
    pub text: String,
}

impl DecodedMessage {
    /// A message is private when it is addressed to a specific node.
    pub fn is_private(&self) -> bool {
        self.dest != BROADCAST_ADDR
    }
}

// ── Raw envelope shape ──────────────────────────────────────────────

/// Destination field as published by gateways: numeric on recent
/// firmware, `"ffffffff"`-style hex strings on older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeRef {
    Num(u64),
    Hex(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPayload {
    Text(String),
    Object(RawPayloadObject),
}

#[derive(Debug, Deserialize)]
struct RawPayloadObject {
    text: Option<String>,
    decoded: Option<RawDecoded>,
}

#[derive(Debug, Deserialize)]
struct RawDecoded {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    from: Option<u64>,
    to: Option<NodeRef>,
    channel: Option<u32>,
    #[serde(rename = "type")]
    port: Option<String>,
    payload: Option<RawPayload>,
    text: Option<String>,
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode one uplink frame into a [`DecodedMessage`].
///
/// `topic` is the MQTT topic the frame arrived on; its tail segment names
/// the gateway node. `payload` is the raw frame body.
pub fn decode(topic: &str, payload: &[u8]) -> Result<DecodedMessage, DecodeError> {
    let gateway =
        topic_gateway(topic).ok_or_else(|| DecodeError::NoGateway(topic.to_string()))?;

    let raw: RawEnvelope = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::NotJson(e.to_string()))?;

    match raw.port.as_deref() {
        Some("text") => {}
        Some(other) => {
            return Err(DecodeError::NotText {
                port: other.to_string(),
            });
        }
        None => return Err(DecodeError::MissingField("type")),
    }

    let sender = raw.from.ok_or(DecodeError::MissingField("from"))? as u32;
    let dest = match &raw.to {
        None => BROADCAST_ADDR,
        Some(NodeRef::Num(n)) => *n as u32,
        Some(NodeRef::Hex(s)) => parse_node_ref(s).ok_or(DecodeError::MalformedField {
            field: "to",
            value: s.clone(),
        })?,
    };

    let text = extract_text(&raw).ok_or(DecodeError::MissingField("payload"))?;
    if text.trim().is_empty() {
        return Err(DecodeError::EmptyText);
    }

    Ok(DecodedMessage {
        sender,
        dest,
        channel: raw.channel.unwrap_or(0),
        gateway,
        text,
    })
}

/// Pull the text out of the envelope. Gateways differ: some publish
/// `payload` as a bare string, some nest it under `payload.text` or
/// `payload.decoded.text`, a few put `text` at the top level.
fn extract_text(raw: &RawEnvelope) -> Option<String> {
    match &raw.payload {
        Some(RawPayload::Text(s)) => return Some(s.clone()),
        Some(RawPayload::Object(obj)) => {
            if let Some(t) = &obj.text {
                return Some(t.clone());
            }
            if let Some(t) = obj.decoded.as_ref().and_then(|d| d.text.as_ref()) {
                return Some(t.clone());
            }
        }
        None => {}
    }
    raw.text.clone()
}

/// Find the gateway node id (`!hex`) in the topic tail.
pub fn topic_gateway(topic: &str) -> Option<String> {
    topic
        .rsplit('/')
        .find(|seg| seg.starts_with('!') && seg.len() > 1)
        .map(str::to_string)
}

/// Parse a `!hex` or `0xhex` or bare-hex node reference to its decimal id.
pub fn parse_node_ref(s: &str) -> Option<u32> {
    let stripped = s
        .strip_prefix('!')
        .or_else(|| s.strip_prefix("0x"))
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(stripped, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "msh/EU/2/json/LongFast/!a1b2c3d4";

    #[test]
    fn decodes_private_text_message() {
        let payload = br#"{"from":305419896,"to":2271560481,"channel":3,"type":"text","payload":{"text":"hello"}}"#;
        let msg = decode(TOPIC, payload).unwrap();
        assert_eq!(msg.sender, 0x12345678);
        assert_eq!(msg.dest, 0x87654321);
        assert_eq!(msg.channel, 3);
        assert_eq!(msg.gateway, "!a1b2c3d4");
        assert_eq!(msg.text, "hello");
        assert!(msg.is_private());
    }

    #[test]
    fn broadcast_by_numeric_destination() {
        let payload = br#"{"from":1,"to":4294967295,"type":"text","payload":{"text":"/bot"}}"#;
        let msg = decode(TOPIC, payload).unwrap();
        assert_eq!(msg.dest, BROADCAST_ADDR);
        assert!(!msg.is_private());
    }

    #[test]
    fn broadcast_by_hex_string_destination() {
        let payload = br#"{"from":1,"to":"ffffffff","type":"text","payload":"/bot"}"#;
        let msg = decode(TOPIC, payload).unwrap();
        assert!(!msg.is_private());
    }

    #[test]
    fn missing_destination_means_broadcast() {
        let payload = br#"{"from":1,"type":"text","payload":{"text":"hi"}}"#;
        let msg = decode(TOPIC, payload).unwrap();
        assert_eq!(msg.dest, BROADCAST_ADDR);
    }

    #[test]
    fn bare_string_payload_accepted() {
        let payload = br#"{"from":1,"to":2,"type":"text","payload":"just text"}"#;
        let msg = decode(TOPIC, payload).unwrap();
        assert_eq!(msg.text, "just text");
    }

    #[test]
    fn nested_decoded_text_accepted() {
        let payload =
            br#"{"from":1,"to":2,"type":"text","payload":{"decoded":{"text":"deep"}}}"#;
        let msg = decode(TOPIC, payload).unwrap();
        assert_eq!(msg.text, "deep");
    }

    #[test]
    fn non_text_port_is_rejected() {
        let payload = br#"{"from":1,"to":2,"type":"position","payload":{"latitude_i":1}}"#;
        let err = decode(TOPIC, payload).unwrap_err();
        assert!(matches!(err, DecodeError::NotText { .. }));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = decode(TOPIC, b"\x94\x01\x02 not json").unwrap_err();
        assert!(matches!(err, DecodeError::NotJson(_)));
    }

    #[test]
    fn empty_text_is_rejected() {
        let payload = br#"{"from":1,"to":2,"type":"text","payload":{"text":"   "}}"#;
        let err = decode(TOPIC, payload).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyText));
    }

    #[test]
    fn topic_without_gateway_is_rejected() {
        let payload = br#"{"from":1,"to":2,"type":"text","payload":{"text":"hi"}}"#;
        let err = decode("msh/EU/2/json/LongFast", payload).unwrap_err();
        assert!(matches!(err, DecodeError::NoGateway(_)));
    }

    #[test]
    fn topic_gateway_takes_tail_segment() {
        assert_eq!(
            topic_gateway("msh/EU/2/json/LongFast/!cafe1234"),
            Some("!cafe1234".to_string())
        );
        assert_eq!(topic_gateway("msh/EU/2/json/LongFast"), None);
    }

    #[test]
    fn node_ref_parsing() {
        assert_eq!(parse_node_ref("!a1b2c3d4"), Some(0xa1b2_c3d4));
        assert_eq!(parse_node_ref("0xffffffff"), Some(BROADCAST_ADDR));
        assert_eq!(parse_node_ref("ffffffff"), Some(BROADCAST_ADDR));
        assert_eq!(parse_node_ref("!nothex"), None);
    }
}
