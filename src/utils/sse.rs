//! Line splitting for `text/event-stream` bodies.
//!
//! Both the provider adapter and the streamable-HTTP MCP transport receive
//! SSE frames in arbitrary byte chunks; this buffer reassembles complete
//! lines and tolerates `\r\n` endings and chunk boundaries inside multi-byte
//! characters.

use memchr::memchr;

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Appends a chunk and returns every complete, non-empty line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(text) = decode_line(&line[..newline_pos]) {
                lines.push(text);
            }
        }
        lines
    }

    /// Flushes whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest).into_iter().collect()
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(err) => {
            tracing::warn!(error = %err, "Dropping SSE line with invalid UTF-8");
            None
        }
    }
}

/// Returns the payload of a `data:` line, tolerating a missing space.
pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}
