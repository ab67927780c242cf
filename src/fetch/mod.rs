//! Batch execution
//!
//! Tasks are dispatched onto a bounded worker pool, executed through the
//! proxy layer and merged into a deduplicated result set.

pub mod aggregator;
pub mod dispatcher;
pub mod engine;
pub mod parser;

pub use aggregator::{normalize_url, ResultAggregator};
pub use dispatcher::{CancelHandle, FetchDispatcher};
pub use engine::FetchEngine;
pub use parser::{OnionLinkParser, PageTextParser, RawBodyParser, ResponseParser};
