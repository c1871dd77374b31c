use crate::types::StreamEvent;
use serde_json::Value;
use tracing::debug;

/// Client-side NDJSON line reassembly.
///
/// This intentionally does not reuse the relay's framer: the client treats
/// the relay as another untrusted byte source and re-validates every line.
/// Lines that are not JSON or do not match the schema are skipped.
#[derive(Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(end) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let line_end = start + end;
            if let Some(event) = parse_line(&self.buffer[start..line_end]) {
                events.push(event);
            }
            start = line_end + 1;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        events
    }

    /// Parses whatever is left after the final separator.
    pub fn flush(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }

    /// Drops an incomplete trailing line.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}

fn parse_line(line: &[u8]) -> Option<StreamEvent> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(error) => {
            debug!(%error, "skipping non-JSON stream line");
            return None;
        }
    };

    match StreamEvent::from_value(value) {
        Ok(event) => Some(event),
        Err(error) => {
            debug!(%error, "skipping stream line that does not match the event schema");
            None
        }
    }
}
