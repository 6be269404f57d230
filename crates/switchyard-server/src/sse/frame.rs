//! Server-sent event framing.

use bytes::Bytes;
use switchyard_rpc::Envelope;

/// One unit written to a client's event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A serialized JSON-RPC message: `data: <json>\n\n`.
    Message(String),
    /// The handshake naming the submission address: `event: endpoint\ndata: <url>\n\n`.
    Endpoint(String),
    /// Keep-alive comment: `:heartbeat\n\n`.
    Heartbeat,
}

impl Frame {
    /// Serialize an envelope into a message frame.
    pub fn message(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        envelope.to_json().map(Self::Message)
    }

    /// Wire bytes for this frame.
    ///
    /// Compact JSON never contains a raw newline, so a message always fits a
    /// single `data:` line.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Message(json) => Bytes::from(format!("data: {json}\n\n")),
            Self::Endpoint(url) => Bytes::from(format!("event: endpoint\ndata: {url}\n\n")),
            Self::Heartbeat => Bytes::from_static(b":heartbeat\n\n"),
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Endpoint(_) => "endpoint",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_rpc::RequestId;

    #[test]
    fn message_frame() {
        let env = Envelope::parse(r#"{"id":42,"result":{"ok":true}}"#).unwrap();
        let frame = Frame::message(&env).unwrap();
        assert_eq!(frame.encode(), Bytes::from("data: {\"id\":42,\"result\":{\"ok\":true}}\n\n"));
    }

    #[test]
    fn endpoint_frame() {
        let frame = Frame::Endpoint("/messages?sessionId=abc".into());
        assert_eq!(
            frame.encode(),
            Bytes::from("event: endpoint\ndata: /messages?sessionId=abc\n\n")
        );
    }

    #[test]
    fn heartbeat_frame() {
        assert_eq!(Frame::Heartbeat.encode(), Bytes::from(":heartbeat\n\n"));
        assert_eq!(Frame::Heartbeat.kind(), "heartbeat");
    }

    #[test]
    fn embedded_newlines_are_escaped() {
        let env = Envelope::success(RequestId::from(1), json!({"text": "a\nb"}));
        let encoded = Frame::message(&env).unwrap().encode();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert_eq!(text.matches('\n').count(), 2);
        assert!(text.ends_with("\n\n"));
    }
}
