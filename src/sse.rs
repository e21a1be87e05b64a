//! SSE wire-format helpers.
//!
//! Kept free of any batching/session logic so it can be unit-tested as pure
//! string/byte formatting.

use serde::Serialize;

/// Body of one SSE data frame: `{"data": <string>, "_rttMeasure"?: <number>}`.
#[derive(Debug, Serialize)]
pub struct OutputFrame {
    /// The server is byte-transparent; non-UTF-8 sequences are lossily
    /// rendered here, since a chunk boundary can split a multi-byte UTF-8
    /// sequence and clients need to tolerate that.
    pub data: String,
    #[serde(rename = "_rttMeasure", skip_serializing_if = "Option::is_none")]
    pub rtt_measure: Option<u64>,
}

/// Render one `data: <json>\n\n` SSE frame.
pub fn encode_frame(frame: &OutputFrame) -> String {
    format!("data: {}\n\n", serde_json::to_string(frame).expect("frame always serializes"))
}

/// Render the `:keepalive\n\n` SSE comment line.
pub fn keepalive_line() -> &'static str {
    ":keepalive\n\n"
}

/// Keep-alive interval for HTTP/1.1 connections.
pub const KEEPALIVE_HTTP1: std::time::Duration = std::time::Duration::from_secs(10);
/// Keep-alive interval for HTTP/2 connections.
pub const KEEPALIVE_HTTP2: std::time::Duration = std::time::Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_data_frame_without_rtt() {
        let frame = OutputFrame {
            data: "hi\n".to_string(),
            rtt_measure: None,
        };
        assert_eq!(encode_frame(&frame), "data: {\"data\":\"hi\\n\"}\n\n");
    }

    #[test]
    fn encodes_data_frame_with_rtt() {
        let frame = OutputFrame {
            data: "x".to_string(),
            rtt_measure: Some(42),
        };
        let encoded = encode_frame(&frame);
        assert!(encoded.starts_with("data: "));
        assert!(encoded.ends_with("\n\n"));
        assert!(encoded.contains("\"_rttMeasure\":42"));
    }

    #[test]
    fn keepalive_is_a_comment_line() {
        assert_eq!(keepalive_line(), ":keepalive\n\n");
    }
}
