//! Async ingest runtime.
//!
//! Wires the pure engine in `fw-core` to a live feed:
//! - [`Gateway`] normalizes raw messages and fans them out to one worker
//!   task per plate
//! - each worker reorders its plate's messages, drives the state machine and
//!   writes the resulting effects through a [`fw_core::SessionStore`] with
//!   bounded retry
//! - [`run_websocket`] and [`feed_lines`] are the two transports

mod config;
mod gateway;
mod replay;
mod retry;
mod stats;
mod websocket;
mod worker;
mod writer;

pub use config::{IngestConfig, RetryPolicy};
pub use gateway::{Dispatch, Gateway};
pub use replay::{FeedSummary, feed_lines};
pub use stats::{IngestStats, IngestStatsSnapshot};
pub use websocket::{WebSocketError, run_websocket};
pub use writer::WriteFailure;
