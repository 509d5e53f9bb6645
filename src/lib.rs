//! # Monet - Zero-Copy Shared Memory Publish/Subscribe
//!
//! Monet is a true zero-copy inter-process publish/subscribe middleware
//! for latency-sensitive systems. Producers publish typed samples into
//! shared memory; consumers read the same pages without any copy or
//! serialization. A central broker daemon (`monetd`) mediates discovery,
//! segment allocation, and lifecycle, but never sits in the data path.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                   monetd (broker)                  │
//! │  process registry │ port matching │ liveness reap  │
//! └──────────┬──────────────────────────────┬──────────┘
//!            │ control IPC (unix socket)    │
//! ┌──────────▼──────────┐        ┌──────────▼──────────┐
//! │     publisher       │ shared │     subscriber      │
//! │ loan → write → pub  │ memory │ take → read → drop  │
//! │  chunk distributor ─┼────────┼─► chunk queue       │
//! └─────────────────────┘        └─────────────────────┘
//! ```
//!
//! All data-path structures live in shared memory, are lock-free, and are
//! addressed by relative pointers so identical pages mapped at different
//! virtual addresses yield identical reachability.

// Core modules
pub mod config;
pub mod daemon;
pub mod error;
pub mod layout;
pub mod memory;
pub mod port;

// Main API re-exports
pub use config::{DaemonConfig, PoolEntry, SegmentGroupConfig};
pub use daemon::{
    Daemon, DaemonClient, PortId, PortManager, ProcessRegistry, ProcessState, Registration,
};
pub use error::{ErrorCode, MonetError, Result};
pub use layout::{ChunkHeader, ChunkRef, RelativePointer, SegmentId, SegmentTable};
pub use memory::{BackingType, MemPool, SegmentConfig, SegmentManager, SharedMemorySegment};
pub use port::{
    ChunkDistributor, ChunkQueue, PublisherPort, QueuePolicy, Sample, SampleMut,
    ServiceDescriptor, SubscriberPort,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
