//! NDJSON chat streaming for the tutor: a validating relay, a client-side
//! consumer and post-stream response repair.

pub mod api;
pub mod config;
pub mod finalize;
pub mod logging;
pub mod relay;
pub mod state;
pub mod types;
pub mod util;

#[cfg(test)]
mod test_support;
