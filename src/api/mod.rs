pub mod client;
pub mod consumer;
#[cfg(test)]
pub mod mock_client;
pub mod stream;

pub use client::{ByteStream, ChatClient};
pub use consumer::{consume_stream, ConsumerError, StreamConsumer, StreamHandlers, StreamOutcome};
