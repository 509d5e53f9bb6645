//! Shared memory ABI: constants, headers, and cross-process addressing

pub mod constants;
pub mod headers;
pub mod relative;

pub use headers::{payload_offset, ChunkHeader, SegmentHeader};
pub use relative::{ChunkRef, RelativePointer, SegmentId, SegmentTable};
