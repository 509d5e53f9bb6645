//! Shared memory: segments, fixed-size chunk pools, and their manager

pub mod mempool;
pub mod segment;
pub mod segment_manager;

pub use mempool::{acquire_chunk, chunk_header_of, pool_of, release_chunk, MemPool, PoolHeader};
pub use segment::{BackingType, CreationPolicy, SegmentConfig, SharedMemorySegment};
pub use segment_manager::SegmentManager;
