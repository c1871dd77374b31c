use crate::types::{EventSchemaError, StreamEvent};
use serde_json::Value;
use tracing::{debug, warn};

pub const INVALID_TYPE_MESSAGE: &str = "Invalid event type";
pub const INVALID_TYPE_CODE: &str = "invalid_type";
pub const VALIDATION_ERROR_MESSAGE: &str = "Invalid event format";
pub const VALIDATION_ERROR_CODE: &str = "validation_error";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FramerStats {
    pub forwarded: usize,
    pub synthesized: usize,
    pub skipped: usize,
}

/// Reassembles upstream NDJSON lines across arbitrary chunk boundaries and
/// validates each complete line against the event schema.
///
/// Bytes are buffered rather than decoded per chunk so a multi-byte
/// character split across two reads survives intact.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    stats: FramerStats,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset;
            let line = self.buffer[start..end].to_vec();
            start = end + 1;
            if let Some(event) = self.accept_line(&line) {
                events.push(event);
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        events
    }

    /// Final pass over whatever followed the last separator.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.accept_line(&rest).into_iter().collect()
    }

    /// Drops a buffered partial line, returning how many bytes were lost.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    fn accept_line(&mut self, line: &[u8]) -> Option<StreamEvent> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(error) => {
                self.stats.skipped += 1;
                debug!(%error, bytes = line.len(), "skipping non-JSON upstream line");
                return None;
            }
        };

        match StreamEvent::from_value(value) {
            Ok(event) => {
                self.stats.forwarded += 1;
                Some(event)
            }
            Err(EventSchemaError::InvalidType) => {
                self.stats.synthesized += 1;
                warn!("upstream event has missing or unknown type");
                Some(StreamEvent::error(INVALID_TYPE_MESSAGE, INVALID_TYPE_CODE))
            }
            Err(EventSchemaError::InvalidShape(reason)) => {
                self.stats.synthesized += 1;
                warn!(%reason, "upstream event failed schema validation");
                Some(StreamEvent::error(
                    VALIDATION_ERROR_MESSAGE,
                    VALIDATION_ERROR_CODE,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = concat!(
        "{\"type\":\"delta\",\"token\":\"Hel\"}\n",
        "{\"type\":\"delta\",\"token\":\"lo ü∑\"}\n",
        "{\"type\":\"tool\",\"name\":\"flashcards\",\"args\":{\"num\":3}}\n",
        "{\"type\":\"done\"}\n",
    );

    #[test]
    fn test_fragmented_line_is_reassembled() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"type\":\"delta\",\"tok").is_empty());
        assert_eq!(framer.pending_bytes(), 20);

        let events = framer.push(b"en\":\"Hi\"}\n{\"type\"");
        assert_eq!(events, vec![StreamEvent::delta("Hi")]);

        let events = framer.push(b":\"done\"}\n");
        assert_eq!(events, vec![StreamEvent::done()]);
        assert_eq!(framer.pending_bytes(), 0);
    }

    #[test]
    fn test_every_split_offset_yields_same_events() {
        let expected = LineFramer::new().push(PAYLOAD.as_bytes());
        assert_eq!(expected.len(), 4);

        let bytes = PAYLOAD.as_bytes();
        for split in 0..=bytes.len() {
            let mut framer = LineFramer::new();
            let mut events = framer.push(&bytes[..split]);
            events.extend(framer.push(&bytes[split..]));
            events.extend(framer.finish());
            assert_eq!(events, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_invalid_json_is_skipped_and_loop_continues() {
        let mut framer = LineFramer::new();
        let events = framer.push(b"{not json}\n\n{\"type\":\"delta\",\"token\":\"ok\"}\n");
        assert_eq!(events, vec![StreamEvent::delta("ok")]);
        assert_eq!(
            framer.stats(),
            FramerStats {
                forwarded: 1,
                synthesized: 0,
                skipped: 1,
            }
        );
    }

    #[test]
    fn test_schema_invalid_line_becomes_one_error_event() {
        let mut framer = LineFramer::new();
        let events = framer.push(
            b"{\"type\":\"delta\",\"token\":\"\"}\n{\"type\":\"delta\",\"token\":\"next\"}\n",
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::error(VALIDATION_ERROR_MESSAGE, VALIDATION_ERROR_CODE),
                StreamEvent::delta("next"),
            ]
        );
    }

    #[test]
    fn test_unknown_type_uses_invalid_type_code() {
        let mut framer = LineFramer::new();
        let events = framer.push(b"{\"type\":\"ping\"}\n");
        assert_eq!(
            events,
            vec![StreamEvent::error(INVALID_TYPE_MESSAGE, INVALID_TYPE_CODE)]
        );
    }

    #[test]
    fn test_finish_parses_unterminated_tail() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"type\":\"done\"}").is_empty());
        assert_eq!(framer.finish(), vec![StreamEvent::done()]);
        assert!(framer.finish().is_empty());
    }

    #[test]
    fn test_crlf_separators_are_tolerated() {
        let mut framer = LineFramer::new();
        let events = framer.push(b"{\"type\":\"delta\",\"token\":\"a\"}\r\n{\"type\":\"done\"}\r\n");
        assert_eq!(events, vec![StreamEvent::delta("a"), StreamEvent::done()]);
    }

    #[test]
    fn test_discard_drops_partial_line() {
        let mut framer = LineFramer::new();
        framer.push(b"{\"type\":\"delta\",\"token\":\"cut");
        assert_eq!(framer.discard(), 28);
        assert!(framer.finish().is_empty());
    }
}
