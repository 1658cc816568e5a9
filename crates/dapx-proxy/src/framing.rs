//! Content-Length framing for DAP byte streams
//!
//! Every DAP message on the wire is a header block terminated by a blank
//! line followed by a JSON body of exactly `Content-Length` bytes:
//!
//! ```text
//! Content-Length: 58\r\n
//! \r\n
//! {"seq":1,"type":"event","event":"initialized"}
//! ```
//!
//! [`FrameDecoder`] is incremental: bytes are pushed as they arrive and
//! complete bodies are pulled out. A header block without a usable
//! `Content-Length` is dropped (only that block) and scanning continues.
//! A body that has not fully arrived stays buffered.

use crate::error::Result;
use crate::protocol::ProtocolMessage;
use tracing::{trace, warn};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Preview length for malformed headers in logs
const HEADER_PREVIEW_LEN: usize = 120;

/// Largest body accepted; longer declared lengths are treated as malformed
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Incremental Content-Length frame decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete body, or `None` until more input arrives.
    pub fn next_body(&mut self) -> Option<Vec<u8>> {
        loop {
            let header_end = find_subsequence(&self.buffer, HEADER_TERMINATOR)?;
            let header = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
            let body_start = header_end + HEADER_TERMINATOR.len();

            let frame = parse_content_length(&header)
                .filter(|&length| length <= MAX_CONTENT_LENGTH)
                .and_then(|length| body_start.checked_add(length).map(|end| (length, end)));
            let Some((content_length, body_end)) = frame else {
                let preview: String = header.chars().take(HEADER_PREVIEW_LEN).collect();
                warn!("Discarding DAP header block without usable Content-Length: {:?}", preview);
                self.buffer.drain(..body_start);
                continue;
            };

            if self.buffer.len() < body_end {
                trace!(
                    "Incomplete DAP body: need {}, have {}",
                    content_length,
                    self.buffer.len() - body_start
                );
                return None;
            }

            let body = self.buffer[body_start..body_end].to_vec();
            self.buffer.drain(..body_end);
            return Some(body);
        }
    }

    /// Pull and decode the next message.
    ///
    /// The frame is consumed before JSON decoding, so a body that fails to
    /// parse is reported once and never re-read.
    pub fn next_message(&mut self) -> Option<Result<ProtocolMessage>> {
        let body = self.next_body()?;
        Some(serde_json::from_slice(&body).map_err(Into::into))
    }
}

/// Extract `Content-Length` from a header block (key matched case-insensitively).
///
/// The key may be preceded by stray bytes left over from a discarded frame,
/// which lets the decoder resynchronize on the next real header.
pub fn parse_content_length(header: &str) -> Option<usize> {
    header.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim().to_ascii_lowercase();
        if key.ends_with(CONTENT_LENGTH) {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Frame a raw JSON body.
pub fn encode_body(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Serialize and frame a protocol message.
pub fn encode_message(message: &ProtocolMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    Ok(encode_body(&body))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Event, Request};
    use serde_json::json;

    fn frame(json: &str) -> Vec<u8> {
        encode_body(json.as_bytes())
    }

    #[test]
    fn test_encode_uses_byte_length() {
        // "é" is two bytes in UTF-8
        let encoded = encode_body("{\"a\":\"é\"}".as_bytes());
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("Content-Length: 10\r\n\r\n"));
    }

    #[test]
    fn test_reencode_is_stable() {
        let msg = ProtocolMessage::Request(
            Request::new(3, "continue").with_arguments(json!({"threadId": 1})),
        );
        let encoded = encode_message(&msg).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let decoded = decoder.next_message().unwrap().unwrap();

        assert_eq!(encode_message(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_complete_messages_plus_partial() {
        let mut stream = Vec::new();
        for seq in 1..=3 {
            let event = ProtocolMessage::Event(Event::new(seq, "output"));
            stream.extend(encode_message(&event).unwrap());
        }
        let partial = frame(r#"{"seq":4,"type":"event","event":"stopped"}"#);
        stream.extend_from_slice(&partial[..partial.len() - 5]);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);

        let mut seqs = Vec::new();
        while let Some(message) = decoder.next_message() {
            seqs.push(message.unwrap().seq());
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(decoder.buffered_len(), partial.len() - 5);

        decoder.push(&partial[partial.len() - 5..]);
        let last = decoder.next_message().unwrap().unwrap();
        assert_eq!(last.seq(), 4);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_content_length_case_insensitive() {
        let body = r#"{"seq":1,"type":"event","event":"initialized"}"#;
        let raw = format!("content-LENGTH: {}\r\n\r\n{}", body.len(), body);

        let mut decoder = FrameDecoder::new();
        decoder.push(raw.as_bytes());
        assert_eq!(decoder.next_body().unwrap(), body.as_bytes());
    }

    #[test]
    fn test_extra_headers_are_ignored() {
        let body = r#"{"seq":1,"type":"event","event":"initialized"}"#;
        let raw = format!(
            "Content-Type: application/vscode-jsonrpc\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let mut decoder = FrameDecoder::new();
        decoder.push(raw.as_bytes());
        assert!(decoder.next_message().unwrap().is_ok());
    }

    #[test]
    fn test_malformed_header_skipped() {
        let good = frame(r#"{"seq":7,"type":"event","event":"thread"}"#);
        let mut stream = b"X-Garbage: yes\r\n\r\n".to_vec();
        stream.extend_from_slice(&good);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(message.seq(), 7);
        assert!(decoder.next_message().is_none());
    }

    #[test]
    fn test_oversized_content_length_skipped() {
        let good = frame(r#"{"seq":8,"type":"event","event":"thread"}"#);
        let mut stream = format!("Content-Length: {}\r\n\r\n{{}}", usize::MAX).into_bytes();
        let too_long = format!("Content-Length: {}\r\n\r\n", MAX_CONTENT_LENGTH + 1);
        stream.extend_from_slice(too_long.as_bytes());
        stream.extend_from_slice(&good);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(message.seq(), 8);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_invalid_json_consumed_once() {
        let mut stream = frame("{not json");
        stream.extend(frame(r#"{"seq":2,"type":"event","event":"exited"}"#));

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert!(decoder.next_message().unwrap().is_err());
        assert_eq!(decoder.next_message().unwrap().unwrap().seq(), 2);
    }

    #[test]
    fn test_header_split_across_pushes() {
        let bytes = frame(r#"{"seq":1,"type":"event","event":"output"}"#);
        let mut decoder = FrameDecoder::new();

        decoder.push(&bytes[..8]);
        assert!(decoder.next_body().is_none());
        decoder.push(&bytes[8..]);
        assert!(decoder.next_body().is_some());
    }

    #[test]
    fn test_parse_content_length_rejects_non_numeric() {
        assert_eq!(parse_content_length("Content-Length: abc"), None);
        assert_eq!(parse_content_length("Content-Length: 42"), Some(42));
        assert_eq!(parse_content_length("Other: 1\r\nContent-Length:5"), Some(5));
        assert_eq!(parse_content_length("{}Content-Length: 7"), Some(7));
    }
}
