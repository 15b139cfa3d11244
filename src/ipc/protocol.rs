//! Event socket protocol
//!
//! Newline-delimited JSON exchanged with the gateway bridge that forwards
//! chat events to the daemon. Every request line gets one response line.

use serde::{Deserialize, Serialize};

use crate::chat::MessageEvent;
use crate::pipeline::StatsSnapshot;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Requests sent by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// A chat message was created
    MessageCreate(MessageEvent),
    /// Report store and pipeline state
    GetStatus,
}

/// Responses sent back to the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// The message carries a link; a preview is being prepared
    #[serde(rename_all = "camelCase")]
    Accepted {
        /// Link that will be previewed
        link: String,
    },
    /// Nothing to do for this message
    Ignored,
    /// Daemon state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Number of stored clips
        artifacts: usize,
        /// Aggregate size of stored clips
        total_bytes: u64,
        /// Size budget
        max_bytes: u64,
        /// Fetches currently running
        in_flight: usize,
        /// Request counters
        stats: StatsSnapshot,
    },
    /// Request could not be handled
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
}

/// Parse a JSON request from bytes
pub fn parse_request(data: &[u8]) -> Result<Request, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_create() {
        let json = r#"{"type":"messageCreate","id":"m1","channelId":"c1","authorId":"u1","content":"https://x.com/a/status/1"}"#;
        match parse_request(json.as_bytes()).unwrap() {
            Request::MessageCreate(event) => {
                assert_eq!(event.id, "m1");
                assert_eq!(event.channel_id, "c1");
                assert_eq!(event.author_id, "u1");
                assert_eq!(event.content, "https://x.com/a/status/1");
            }
            other => panic!("Expected MessageCreate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_get_status() {
        let request = parse_request(br#"{"type":"getStatus"}"#).unwrap();
        assert!(matches!(request, Request::GetStatus));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(parse_request(br#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_serialize_responses() {
        let json = serialize_response(&Response::Accepted {
            link: "https://x.com/a/status/1".to_string(),
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(json).unwrap(),
            "{\"type\":\"accepted\",\"link\":\"https://x.com/a/status/1\"}\n"
        );

        let json = serialize_response(&Response::Status {
            version: PROTOCOL_VERSION,
            artifacts: 2,
            total_bytes: 2048,
            max_bytes: 4096,
            in_flight: 1,
            stats: StatsSnapshot::default(),
        })
        .unwrap();
        let text = String::from_utf8(json).unwrap();
        assert!(text.contains("\"totalBytes\":2048"));
        assert!(text.contains("\"inFlight\":1"));
        assert!(text.ends_with('\n'));
    }
}
