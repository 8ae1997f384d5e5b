// BigQuery Target Kernel
//
// Stream-to-batch ingestion core for a Singer target: decodes protocol
// lines, keeps stream schemas, buffers records per stream, provisions
// destination tables, writes batches and releases checkpoints only once
// the data they cover is durable.

pub mod adapters;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod provision;
pub mod schema;
pub mod state;
pub mod sync_schema;
pub mod warehouse;
pub mod writer;
