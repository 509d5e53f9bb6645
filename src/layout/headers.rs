//! Header structures of the shared memory ABI
//!
//! Every structure here is `#[repr(C)]` with explicit 8-byte-friendly field
//! order; processes built against different ABI versions refuse to attach
//! at registration time.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{MonetError, Result};

use super::constants::*;
use super::relative::ChunkRef;

/// Header at offset 0 of every shared memory segment
#[repr(C)]
pub struct SegmentHeader {
    /// Magic number for validation
    pub magic: u32,
    /// ABI version; mismatch is a [`MonetError::CompatibilityError`]
    pub version: u32,
    /// Segment id assigned by the daemon
    pub segment_id: u32,
    /// Number of valid entries in `pool_offsets`
    pub pool_count: u32,
    /// Total segment size in bytes
    pub total_size: u64,
    /// Pid of the creating daemon
    pub owner_pid: u32,
    _reserved: u32,
    /// Byte offsets of the pool headers within this segment
    pub pool_offsets: [u64; MAX_POOLS_PER_SEGMENT],
}

impl SegmentHeader {
    pub fn new(segment_id: u32, total_size: u64) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: ABI_VERSION,
            segment_id,
            pool_count: 0,
            total_size,
            owner_pid: std::process::id(),
            _reserved: 0,
            pool_offsets: [0; MAX_POOLS_PER_SEGMENT],
        }
    }

    /// Validate magic and ABI version
    pub fn validate(&self) -> Result<()> {
        if self.magic != SEGMENT_MAGIC {
            return Err(MonetError::invariant(format!(
                "segment magic {:#x} does not match {:#x}",
                self.magic, SEGMENT_MAGIC
            )));
        }
        if self.version != ABI_VERSION {
            return Err(MonetError::CompatibilityError {
                expected: ABI_VERSION,
                actual: self.version,
            });
        }
        Ok(())
    }
}

/// Header preceding the payload of every chunk
///
/// The refcount tracks every durable holder of the chunk: the publisher
/// while loaned, each subscriber queue slot, and the history ring. The
/// chunk returns to its pool exactly once, when the count reaches zero.
#[repr(C)]
pub struct ChunkHeader {
    /// `CHUNK_MAGIC` while allocated, `CHUNK_FREE_MAGIC` after release
    pub magic: AtomicU32,
    /// Number of outstanding references
    pub ref_count: AtomicU32,
    /// Back-reference to this chunk's own location (segment, pool, index);
    /// lets `release` find the originating pool without a raw pointer
    pub origin: u64,
    /// Publisher sequence number, stamped before delivery
    pub sequence: u64,
    /// Bytes of payload actually written
    pub payload_size: u32,
    /// Bytes of user header preceding the payload (0 when unused)
    pub user_header_size: u32,
}

impl ChunkHeader {
    /// Initialize a freshly allocated chunk with one reference
    pub fn init(&mut self, origin: ChunkRef) {
        self.magic = AtomicU32::new(CHUNK_MAGIC);
        self.ref_count = AtomicU32::new(1);
        self.origin = origin.to_raw();
        self.sequence = 0;
        self.payload_size = 0;
        self.user_header_size = 0;
    }

    /// The chunk's own packed reference
    pub fn origin(&self) -> ChunkRef {
        ChunkRef::from_raw(self.origin).expect("chunk header holds null origin")
    }

    /// Atomically add a reference; call before storing the ref durably
    pub fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; returns true when this was the last holder
    ///
    /// Underflow means a double free and is reported as a fatal invariant
    /// violation rather than wrapping.
    pub fn release_ref(&self) -> Result<bool> {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Undo the wrap so repeated reports stay readable.
            self.ref_count.store(0, Ordering::Relaxed);
            return Err(MonetError::invariant("chunk refcount underflow"));
        }
        Ok(previous == 1)
    }

    /// Current reference count (diagnostic)
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Check the live-chunk magic word
    pub fn validate_live(&self) -> Result<()> {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic == CHUNK_FREE_MAGIC {
            return Err(MonetError::invariant("operation on freed chunk"));
        }
        if magic != CHUNK_MAGIC {
            return Err(MonetError::invariant(format!(
                "corrupted chunk magic {:#x}",
                magic
            )));
        }
        Ok(())
    }

    /// Mark the header as freed for double-free detection
    pub fn mark_freed(&self) {
        self.magic.store(CHUNK_FREE_MAGIC, Ordering::Relaxed);
    }
}

/// Offset of the payload within a chunk for a given pool alignment
pub fn payload_offset(alignment: usize) -> usize {
    let header = std::mem::size_of::<ChunkHeader>();
    (header + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_header_validates() {
        let header = SegmentHeader::new(1, 4096);
        assert!(header.validate().is_ok());

        let mut bad = SegmentHeader::new(1, 4096);
        bad.version = ABI_VERSION + 1;
        assert!(matches!(
            bad.validate(),
            Err(MonetError::CompatibilityError { .. })
        ));
    }

    #[test]
    fn chunk_refcount_lifecycle() {
        let mut header: ChunkHeader = unsafe { std::mem::zeroed() };
        header.init(ChunkRef::new(0, 0, 5));

        header.acquire();
        assert_eq!(header.ref_count(), 2);
        assert!(!header.release_ref().unwrap());
        assert!(header.release_ref().unwrap());

        // Releasing past zero is an invariant violation, not a wrap.
        assert!(header.release_ref().is_err());
    }

    #[test]
    fn payload_offset_is_aligned() {
        assert_eq!(payload_offset(8) % 8, 0);
        assert_eq!(payload_offset(64) % 64, 0);
        assert!(payload_offset(8) >= std::mem::size_of::<ChunkHeader>());
    }
}
