//! Network flow accounting: classification, per-interval tables and the
//! aggregator that turns capture lines into `FlowRecord`s.

pub mod aggregator;
pub mod classify;
pub mod record;
pub mod table;

pub use aggregator::{AggregatorStats, FlowAggregator};
pub use classify::{is_public_ip, LocalAddrs};
pub use record::{Direction, FlowKey, FlowRecord, Protocol};
pub use table::FlowTable;
