//! Engine.IO v4 / Socket.IO v5 text packet codec
//!
//! Every WebSocket text frame carries one Engine.IO packet. Message packets
//! (`4`) wrap a Socket.IO packet, so an event on the default namespace looks
//! like `42["chat_chunk",{...}]`.

use crate::error::{ProtocolError, Result};
use serde::Deserialize;
use serde_json::Value;

/// Engine.IO pong frame, sent in reply to a server ping
pub const PONG: &str = "3";

/// Parameters from the Engine.IO open packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

/// Engine.IO transport-level packet
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Upgrade,
    Noop,
}

/// Socket.IO packet carried in an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Namespace connected (server) or connect request (client)
    Connect { namespace: String, payload: Option<Value> },
    Disconnect { namespace: String },
    Event { namespace: String, name: String, data: Value },
    Ack { namespace: String },
    /// Namespace connection refused, typically by auth middleware
    ConnectError { namespace: String, message: String },
    /// Binary attachments are not used by the chat backend
    Binary { namespace: String },
}

/// Decode a text frame into an Engine.IO packet
pub fn decode(frame: &str) -> Result<EnginePacket> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ProtocolError::MalformedPacket("empty frame".to_string()))?;
    let rest = chars.as_str();

    let packet = match kind {
        '0' => {
            let info: OpenInfo = serde_json::from_str(rest).map_err(|e| {
                ProtocolError::MalformedPacket(format!("bad open payload: {}", e))
            })?;
            EnginePacket::Open(info)
        }
        '1' => EnginePacket::Close,
        '2' => EnginePacket::Ping,
        '3' => EnginePacket::Pong,
        '4' => EnginePacket::Message(decode_socket_packet(rest)?),
        '5' => EnginePacket::Upgrade,
        '6' => EnginePacket::Noop,
        other => {
            return Err(ProtocolError::MalformedPacket(format!(
                "unknown engine packet type '{}'",
                other
            ))
            .into())
        }
    };

    Ok(packet)
}

fn decode_socket_packet(body: &str) -> Result<SocketPacket> {
    let mut chars = body.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ProtocolError::MalformedPacket("empty socket packet".to_string()))?;
    let rest = chars.as_str();

    // Binary packets carry an attachment count before the namespace.
    let rest = match kind {
        '5' | '6' => rest.split_once('-').map(|(_, r)| r).unwrap_or(rest),
        _ => rest,
    };

    let (namespace, rest) = split_namespace(rest);
    // Skip the optional ack id.
    let payload = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    let packet = match kind {
        '0' => SocketPacket::Connect {
            namespace,
            payload: parse_optional_json(payload)?,
        },
        '1' => SocketPacket::Disconnect { namespace },
        '2' => {
            let (name, data) = parse_event_payload(payload)?;
            SocketPacket::Event {
                namespace,
                name,
                data,
            }
        }
        '3' => SocketPacket::Ack { namespace },
        '4' => {
            let message = match parse_optional_json(payload)? {
                Some(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused")
                    .to_string(),
                Some(Value::String(s)) => s,
                _ => "connection refused".to_string(),
            };
            SocketPacket::ConnectError { namespace, message }
        }
        '5' | '6' => SocketPacket::Binary { namespace },
        other => {
            return Err(ProtocolError::MalformedPacket(format!(
                "unknown socket packet type '{}'",
                other
            ))
            .into())
        }
    };

    Ok(packet)
}

fn split_namespace(rest: &str) -> (String, &str) {
    if rest.starts_with('/') {
        match rest.split_once(',') {
            Some((nsp, tail)) => (nsp.to_string(), tail),
            None => (rest.to_string(), ""),
        }
    } else {
        ("/".to_string(), rest)
    }
}

fn parse_optional_json(payload: &str) -> Result<Option<Value>> {
    if payload.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(payload)
        .map(Some)
        .map_err(|e| ProtocolError::MalformedPacket(format!("bad JSON payload: {}", e)).into())
}

fn parse_event_payload(payload: &str) -> Result<(String, Value)> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ProtocolError::MalformedPacket(format!("bad event payload: {}", e)))?;

    let Value::Array(mut items) = value else {
        return Err(ProtocolError::MalformedPacket("event payload is not an array".into()).into());
    };
    if items.is_empty() {
        return Err(ProtocolError::MalformedPacket("event payload is empty".into()).into());
    }

    let name = match items.remove(0) {
        Value::String(name) => name,
        other => {
            return Err(ProtocolError::MalformedPacket(format!(
                "event name is not a string: {}",
                other
            ))
            .into())
        }
    };

    // Only the first argument is meaningful for the chat events.
    let data = if items.is_empty() {
        Value::Null
    } else {
        items.swap_remove(0)
    };

    Ok((name, data))
}

/// Encode a Socket.IO connect request for the default namespace
pub fn encode_connect(auth: &Value) -> String {
    format!("40{}", auth)
}

/// Encode a Socket.IO event for the default namespace
pub fn encode_event(name: &str, data: &Value) -> String {
    let payload = Value::Array(vec![Value::String(name.to_string()), data.clone()]);
    format!("42{}", payload)
}

/// Encode a Socket.IO disconnect for the default namespace
pub fn encode_disconnect() -> String {
    "41".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let packet = decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#)
            .unwrap();

        match packet {
            EnginePacket::Open(info) => {
                assert_eq!(info.sid, "abc");
                assert_eq!(info.ping_interval, 25_000);
                assert_eq!(info.max_payload, Some(1_000_000));
            }
            other => panic!("Expected open packet, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_heartbeat_packets() {
        assert_eq!(decode("2").unwrap(), EnginePacket::Ping);
        assert_eq!(decode("3").unwrap(), EnginePacket::Pong);
        assert_eq!(decode("1").unwrap(), EnginePacket::Close);
        assert_eq!(decode("6").unwrap(), EnginePacket::Noop);
    }

    #[test]
    fn test_decode_connect_ack() {
        let packet = decode(r#"40{"sid":"socket-1"}"#).unwrap();
        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::Connect {
                namespace: "/".into(),
                payload: Some(json!({"sid": "socket-1"})),
            })
        );
    }

    #[test]
    fn test_decode_connect_error() {
        let packet = decode(r#"44{"message":"Authentication error"}"#).unwrap();
        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::ConnectError {
                namespace: "/".into(),
                message: "Authentication error".into(),
            })
        );
    }

    #[test]
    fn test_decode_event() {
        let packet =
            decode(r#"42["chat_chunk",{"content":"Recursion ","fullContent":"Recursion "}]"#)
                .unwrap();

        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::Event {
                namespace: "/".into(),
                name: "chat_chunk".into(),
                data: json!({"content": "Recursion ", "fullContent": "Recursion "}),
            })
        );
    }

    #[test]
    fn test_decode_event_without_data_and_with_namespace() {
        let packet = decode(r#"42/chat,["chat_started"]"#).unwrap();
        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::Event {
                namespace: "/chat".into(),
                name: "chat_started".into(),
                data: Value::Null,
            })
        );
    }

    #[test]
    fn test_decode_event_with_ack_id() {
        let packet = decode(r#"4212["chat_info",{"chatId":"c1"}]"#).unwrap();
        match packet {
            EnginePacket::Message(SocketPacket::Event { name, data, .. }) => {
                assert_eq!(name, "chat_info");
                assert_eq!(data["chatId"], "c1");
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(""),
            Err(Error::Protocol(ProtocolError::MalformedPacket(_)))
        ));
        assert!(decode("9").is_err());
        assert!(decode("42{\"not\":\"array\"}").is_err());
        assert!(decode("42[1,2]").is_err());
    }

    #[test]
    fn test_encode_frames() {
        assert_eq!(encode_connect(&json!({"token": "abc"})), r#"40{"token":"abc"}"#);
        assert_eq!(
            encode_event("chat_message", &json!({"content": "hi"})),
            r#"42["chat_message",{"content":"hi"}]"#
        );
        assert_eq!(encode_disconnect(), "41");
    }
}
