// tallystream-core - Protocol and aggregation logic
//
// This crate contains the PURE processing logic for the ingestion
// pipeline: wire frame decoding, record filtering, time bucketing and
// the aggregation accumulator. No I/O, no async, no runtime
// dependencies - everything here is deterministic and directly
// testable.

pub mod accum;
pub mod bucket;
pub mod filter;
pub mod frame;
pub mod job;
pub mod record;

// Re-export commonly used types
pub use accum::Totals;
pub use bucket::{bucket_key, BucketUnit};
pub use filter::{Condition, FuncRegistry};
pub use frame::{CloseReason, Decoded, Frame, FrameDecoder, TimedRecord, WireFormat};
pub use job::JobDefinition;
pub use record::Record;
