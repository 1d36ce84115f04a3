//! vitalflow: streaming validation, risk scoring and windowed aggregation for
//! patient vitals telemetry.
//!
//! - `pipeline` - the transform graph and its coordinator
//! - `sink` - analytics store and batching writer
//! - `channel` - message sources
//! - `endpoints` - parsing of source/sink/dead-letter identifiers
//! - `simulator` - telemetry generator with error injection

pub mod channel;
pub mod endpoints;
pub mod pipeline;
pub mod simulator;
pub mod sink;
