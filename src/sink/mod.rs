//! Analytics sink: storage backend plus the batching writer in front of it

pub mod batcher;
pub mod schema;
pub mod sqlite_pragma;
pub mod sqlite_writer;
pub mod writer_backend;

pub use batcher::{SinkClosed, SinkHandle, SinkReport, SinkStats, SinkWriter, SinkWriterConfig};
pub use sqlite_writer::SqliteSink;
pub use writer_backend::{AnalyticsSink, SinkError};
