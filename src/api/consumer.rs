use super::client::ByteStream;
use super::stream::StreamParser;
use crate::relay::framer::{INVALID_TYPE_CODE, VALIDATION_ERROR_CODE};
use crate::types::StreamEvent;
use futures::StreamExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ROLE_PREFIX: &str = "assistant:";

/// Error codes the relay attaches to events it synthesized in place of a
/// malformed upstream line. These do not end the turn.
pub const RECOVERABLE_ERROR_CODES: [&str; 2] = [VALIDATION_ERROR_CODE, INVALID_TYPE_CODE];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("relay returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("relay response carried no body")]
    MissingBody,
    #[error("{0}")]
    Transport(String),
    #[error("stream reported an error: {message}")]
    Remote {
        message: String,
        code: Option<String>,
    },
}

/// How a consumed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A `done` event arrived.
    Completed,
    /// The body ended without a `done` event.
    Closed,
    /// The transport failed mid-stream; any partial line was dropped.
    Interrupted(String),
    /// The caller cancelled the read loop.
    Cancelled,
}

/// Callbacks invoked in wire order for each validated event.
pub trait StreamHandlers {
    fn on_token(&mut self, token: &str);

    fn on_tool(&mut self, name: &str, args: &Map<String, Value>) {
        debug!(tool = name, args = args.len(), "ignoring tool event");
    }

    fn on_done(&mut self, extra: &Map<String, Value>) {
        let _ = extra;
    }

    /// Relay-synthesized errors for lines it could not forward.
    fn on_recoverable_error(&mut self, message: &str, code: &str) {
        warn!(code, message, "relay replaced a malformed event");
    }
}

/// Drives one relay response through a [`StreamParser`] and dispatches events.
#[derive(Default)]
pub struct StreamConsumer {
    cancel: Option<CancellationToken>,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub async fn consume<H>(
        &self,
        mut stream: ByteStream,
        handlers: &mut H,
    ) -> Result<StreamOutcome, ConsumerError>
    where
        H: StreamHandlers + ?Sized,
    {
        let mut parser = StreamParser::new();
        let mut dispatcher = Dispatcher::new(handlers);

        loop {
            let next = match &self.cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        let dropped = parser.discard();
                        debug!(dropped, "stream consumption cancelled");
                        return Ok(StreamOutcome::Cancelled);
                    }
                    next = stream.next() => next,
                },
                None => stream.next().await,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => {
                    let dropped = parser.discard();
                    warn!(%error, dropped, "relay stream interrupted");
                    return Ok(StreamOutcome::Interrupted(error.to_string()));
                }
                None => break,
            };

            for event in parser.process(&chunk) {
                if dispatcher.dispatch(event)? {
                    return Ok(StreamOutcome::Completed);
                }
            }
        }

        if let Some(event) = parser.flush() {
            if dispatcher.dispatch(event)? {
                return Ok(StreamOutcome::Completed);
            }
        }
        debug!("relay stream closed without a done event");
        Ok(StreamOutcome::Closed)
    }
}

/// Consumes `stream` without cancellation support.
pub async fn consume_stream<H>(
    stream: ByteStream,
    handlers: &mut H,
) -> Result<StreamOutcome, ConsumerError>
where
    H: StreamHandlers + ?Sized,
{
    StreamConsumer::new().consume(stream, handlers).await
}

struct Dispatcher<'a, H: ?Sized> {
    handlers: &'a mut H,
    first_delta: bool,
}

impl<'a, H: StreamHandlers + ?Sized> Dispatcher<'a, H> {
    fn new(handlers: &'a mut H) -> Self {
        Self {
            handlers,
            first_delta: true,
        }
    }

    /// Returns `true` once the stream is finished.
    fn dispatch(&mut self, event: StreamEvent) -> Result<bool, ConsumerError> {
        match event {
            StreamEvent::Delta { token } => {
                let token = if self.first_delta {
                    self.first_delta = false;
                    strip_leading_role_prefix(&token)
                } else {
                    token.as_str()
                };
                if !token.is_empty() {
                    self.handlers.on_token(token);
                }
                Ok(false)
            }
            StreamEvent::Tool { name, args } => {
                self.handlers.on_tool(&name, &args);
                Ok(false)
            }
            StreamEvent::Error { message, code } => {
                if let Some(recoverable) = code
                    .as_deref()
                    .filter(|code| RECOVERABLE_ERROR_CODES.contains(code))
                {
                    self.handlers.on_recoverable_error(&message, recoverable);
                    return Ok(false);
                }
                Err(ConsumerError::Remote { message, code })
            }
            StreamEvent::Done { extra } => {
                self.handlers.on_done(&extra);
                Ok(true)
            }
        }
    }
}

fn strip_leading_role_prefix(token: &str) -> &str {
    match token.get(..ROLE_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(ROLE_PREFIX) => {
            token[ROLE_PREFIX.len()..].trim_start_matches([' ', '\t'])
        }
        _ => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use bytes::Bytes;
    use futures::stream;

    #[derive(Default)]
    struct Recorder {
        tokens: Vec<String>,
        tools: Vec<String>,
        done: usize,
        recovered: Vec<String>,
    }

    impl StreamHandlers for Recorder {
        fn on_token(&mut self, token: &str) {
            self.tokens.push(token.to_string());
        }

        fn on_tool(&mut self, name: &str, _args: &Map<String, Value>) {
            self.tools.push(name.to_string());
        }

        fn on_done(&mut self, _extra: &Map<String, Value>) {
            self.done += 1;
        }

        fn on_recoverable_error(&mut self, _message: &str, code: &str) {
            self.recovered.push(code.to_string());
        }
    }

    fn chunks(parts: &[&str]) -> ByteStream {
        let items: Vec<anyhow::Result<Bytes>> = parts
            .iter()
            .map(|part| Ok(Bytes::from(part.to_string())))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_dispatches_in_wire_order_and_stops_at_done() {
        let mut recorder = Recorder::default();
        let outcome = consume_stream(
            chunks(&[
                "{\"type\":\"delta\",\"token\":\"Hel",
                "lo\"}\n{\"type\":\"tool\",\"name\":\"flashcards\",\"args\":{}}\n",
                "{\"type\":\"done\"}\n{\"type\":\"delta\",\"token\":\"late\"}\n",
            ]),
            &mut recorder,
        )
        .await
        .expect("consume");

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(recorder.tokens, vec!["Hello"]);
        assert_eq!(recorder.tools, vec!["flashcards"]);
        assert_eq!(recorder.done, 1);
    }

    #[tokio::test]
    async fn test_role_prefix_stripped_from_first_delta_only() {
        let mut recorder = Recorder::default();
        consume_stream(
            chunks(&[
                "{\"type\":\"delta\",\"token\":\"Assistant: Hi\"}\n",
                "{\"type\":\"delta\",\"token\":\"assistant: again\"}\n",
            ]),
            &mut recorder,
        )
        .await
        .expect("consume");

        assert_eq!(recorder.tokens, vec!["Hi", "assistant: again"]);
    }

    #[tokio::test]
    async fn test_prefix_only_first_delta_is_not_dispatched() {
        let mut recorder = Recorder::default();
        consume_stream(
            chunks(&[
                "{\"type\":\"delta\",\"token\":\"assistant:\"}\n",
                "{\"type\":\"delta\",\"token\":\"Hi\"}\n",
            ]),
            &mut recorder,
        )
        .await
        .expect("consume");

        assert_eq!(recorder.tokens, vec!["Hi"]);
    }

    #[tokio::test]
    async fn test_invalid_lines_are_skipped() {
        let mut recorder = Recorder::default();
        let outcome = consume_stream(
            chunks(&[
                "not json\n{\"type\":\"delta\",\"token\":\"\"}\n",
                "{\"type\":\"mystery\"}\n{\"type\":\"delta\",\"token\":\"ok\"}\n",
            ]),
            &mut recorder,
        )
        .await
        .expect("consume");

        assert_eq!(outcome, StreamOutcome::Closed);
        assert_eq!(recorder.tokens, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline_is_flushed() {
        let mut recorder = Recorder::default();
        let outcome = consume_stream(
            chunks(&["{\"type\":\"delta\",\"token\":\"a\"}\n{\"type\":\"done\"}"]),
            &mut recorder,
        )
        .await
        .expect("consume");

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(recorder.done, 1);
    }

    #[tokio::test]
    async fn test_recoverable_error_continues() {
        let mut recorder = Recorder::default();
        let outcome = consume_stream(
            chunks(&[
                "{\"type\":\"error\",\"message\":\"Invalid event format\",\"code\":\"validation_error\"}\n",
                "{\"type\":\"delta\",\"token\":\"fine\"}\n{\"type\":\"done\"}\n",
            ]),
            &mut recorder,
        )
        .await
        .expect("consume");

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(recorder.recovered, vec!["validation_error"]);
        assert_eq!(recorder.tokens, vec!["fine"]);
    }

    #[tokio::test]
    async fn test_remote_error_is_returned() {
        let mut recorder = Recorder::default();
        let err = consume_stream(
            chunks(&[
                "{\"type\":\"delta\",\"token\":\"par\"}\n",
                "{\"type\":\"error\",\"message\":\"Error during chat completion\",\"code\":\"stream_error\"}\n{\"type\":\"done\"}\n",
            ]),
            &mut recorder,
        )
        .await
        .expect_err("remote error");

        assert_eq!(
            err,
            ConsumerError::Remote {
                message: "Error during chat completion".to_string(),
                code: Some("stream_error".to_string()),
            }
        );
        assert_eq!(recorder.done, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_drops_partial_line() {
        let items: Vec<anyhow::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"delta\",\"token\":\"a\"}\n{\"type\":\"del")),
            Err(anyhow!("connection reset")),
        ];
        let mut recorder = Recorder::default();
        let outcome = consume_stream(Box::pin(stream::iter(items)), &mut recorder)
            .await
            .expect("consume");

        assert_eq!(
            outcome,
            StreamOutcome::Interrupted("connection reset".to_string())
        );
        assert_eq!(recorder.tokens, vec!["a"]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_pending_read() {
        let token = CancellationToken::new();
        token.cancel();
        let mut recorder = Recorder::default();
        let outcome = StreamConsumer::new()
            .with_cancellation(token)
            .consume(
                Box::pin(stream::pending::<anyhow::Result<Bytes>>()),
                &mut recorder,
            )
            .await
            .expect("consume");

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert!(recorder.tokens.is_empty());
    }

    #[test]
    fn test_strip_leading_role_prefix_handles_multibyte() {
        assert_eq!(strip_leading_role_prefix("ASSISTANT:\tx"), "x");
        assert_eq!(strip_leading_role_prefix("é"), "é");
        assert_eq!(strip_leading_role_prefix("assistan"), "assistan");
        assert_eq!(strip_leading_role_prefix("ééééé"), "ééééé");
    }
}
