//! Per-connection stream handling: the state machine that ties inbound audio,
//! the resampler and a recognition session together.

pub mod controller;

pub use controller::{StreamController, StreamEvent, StreamOutcome, StreamSummary};
