//! Incremental Server-Sent Events decoding over raw byte chunks.

/// Sentinel data payload that ends both upstream streams
pub const DONE_MARKER: &str = "[DONE]";

/// Splits a byte stream into SSE `data` payloads.
///
/// Events may arrive split across chunks or several per chunk; a payload is
/// only yielded once its terminating blank line has been seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the data payloads of every completed event
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_event_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(data) = parse_event(&raw[..end]) {
                events.push(data);
            }
        }
        events
    }

    /// Flush whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        parse_event(&raw)
    }
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Joins the `data:` lines of one event; comments and other fields are dropped.
fn parse_event(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut data_lines = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
