//! Constants and compile-time bounds for the shared memory ABI

/// Cache line size for alignment (64 bytes on most x86_64 systems)
pub const CACHE_LINE_SIZE: usize = 64;

/// Magic number identifying a Monet segment header
pub const SEGMENT_MAGIC: u32 = 0x4D4F4E45; // "MONE"

/// Magic number of a live (allocated) chunk header
pub const CHUNK_MAGIC: u32 = 0x43484E4B; // "CHNK"

/// Magic word written into a chunk header when it returns to its pool,
/// used to detect double frees in debug builds
pub const CHUNK_FREE_MAGIC: u32 = 0x46524545; // "FREE"

/// Magic number of a mempool header
pub const POOL_MAGIC: u32 = 0x504F4F4C; // "POOL"

/// Magic number of a subscriber chunk queue
pub const QUEUE_MAGIC: u32 = 0x51554555; // "QUEU"

/// Magic number of a publisher port structure
pub const PUBLISHER_PORT_MAGIC: u32 = 0x50554250; // "PUBP"

/// Magic number of a subscriber port structure
pub const SUBSCRIBER_PORT_MAGIC: u32 = 0x53554250; // "SUBP"

/// Magic number of a per-process management block
pub const MGMT_BLOCK_MAGIC: u32 = 0x4D474D42; // "MGMB"

/// Current shared memory ABI version; compared at registration time
pub const ABI_VERSION: u32 = 1;

/// Maximum number of mempools per segment
pub const MAX_POOLS_PER_SEGMENT: usize = 16;

/// Maximum number of registered processes
pub const MAX_PROCESSES: usize = 256;

/// Maximum number of ports (publisher or subscriber) per process
pub const MAX_PORTS_PER_PROCESS: usize = 64;

/// Maximum number of publisher ports daemon-wide
pub const MAX_PUBLISHERS: usize = 256;

/// Maximum number of subscriber ports daemon-wide
pub const MAX_SUBSCRIBERS: usize = 1024;

/// Maximum number of subscribers attached to one publisher
pub const MAX_SUBSCRIBERS_PER_PUBLISHER: usize = 16;

/// Maximum number of distinct service descriptors with live ports
pub const MAX_TOPICS: usize = 256;

/// Maximum history entries a publisher may retain for late joiners
pub const MAX_HISTORY_CAPACITY: usize = 16;

/// Maximum capacity of a subscriber chunk queue (power of two)
pub const MAX_QUEUE_CAPACITY: usize = 256;

/// Default cap on chunks a publisher may hold unpublished
pub const DEFAULT_ALLOCATION_BUDGET: u32 = 8;

/// Maximum length of each service descriptor component
pub const MAX_DESCRIPTOR_COMPONENT_LEN: usize = 64;

/// Payload alignment inside a chunk unless a pool overrides it
pub const DEFAULT_CHUNK_ALIGNMENT: usize = 8;

/// Free-list terminator index
pub const FREE_LIST_END: u32 = u32::MAX;

/// Largest frame accepted on the daemon IPC channel
pub const MAX_IPC_MESSAGE_SIZE: usize = 4096;

/// Default liveness threshold before a silent process is declared lost
pub const DEFAULT_LIVENESS_THRESHOLD_MS: u64 = 1500;

/// Period of the daemon liveness/introspection tick
pub const DEFAULT_MONITOR_TICK_MS: u64 = 500;
