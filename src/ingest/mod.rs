//! Ingestion pipeline: decode, normalize, resolve duplicates, write in batches.

pub mod decoder;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod normalize;
pub mod orchestrator;
pub mod record;
pub mod resolver;
pub mod worker;
pub mod writer;

pub use decoder::{decode, detect_delimiter, FormatHint, RowSource};
pub use normalize::{is_date_like_column, normalize};
pub use orchestrator::{Orchestrator, ProcessRequest};
pub use record::{RawValue, RowRecord};
pub use resolver::{composite_key, resolve, DuplicateMode, DuplicatePolicy, Resolution};
pub use worker::{decode_isolated, DecodedTable};
pub use writer::{split_affected_rows, BatchWriter, ColumnPlan, WriteCounts};
