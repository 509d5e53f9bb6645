//! Cross-process addressing: relative pointers and the segment table
//!
//! Shared segments map at different virtual addresses in different
//! processes, so nothing inside shared memory may hold a raw address.
//! Everything is expressed as `(segment_id, offset)` and resolved against
//! the local [`SegmentTable`] at dereference time.

use std::{collections::HashMap, sync::RwLock};

use crate::error::{MonetError, Result};

/// Identifier of a shared memory segment, stable across processes
pub type SegmentId = u16;

/// A `(segment_id, offset)` pair replacing raw pointers in shared memory
///
/// Packs into a single `u64` so it can live in an atomic slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RelativePointer {
    pub segment: SegmentId,
    pub offset: u32,
}

impl RelativePointer {
    /// Packed representation of the null pointer
    pub const NULL_RAW: u64 = u64::MAX;

    pub fn new(segment: SegmentId, offset: u32) -> Self {
        Self { segment, offset }
    }

    /// Pack into a u64 for storage in an atomic slot
    pub fn to_raw(self) -> u64 {
        ((self.segment as u64) << 32) | self.offset as u64
    }

    /// Unpack from a u64 slot value; `None` for the null sentinel
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == Self::NULL_RAW {
            return None;
        }
        Some(Self {
            segment: (raw >> 32) as SegmentId,
            offset: raw as u32,
        })
    }
}

/// Packed reference to one chunk: `(segment_id, pool_index, chunk_index)`
///
/// Chunks are addressed by index within their pool, never by address, so a
/// reference is meaningful in every process that has the segment mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRef(u64);

impl ChunkRef {
    /// Packed representation of "no chunk"
    pub const NULL_RAW: u64 = u64::MAX;

    pub fn new(segment: SegmentId, pool_index: u16, chunk_index: u32) -> Self {
        Self(((segment as u64) << 48) | ((pool_index as u64) << 32) | chunk_index as u64)
    }

    pub fn segment(&self) -> SegmentId {
        (self.0 >> 48) as SegmentId
    }

    pub fn pool_index(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn chunk_index(&self) -> u32 {
        self.0 as u32
    }

    /// Packed value for storage in queue and history slots
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Unpack from a slot value; `None` for the null sentinel
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == Self::NULL_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SegmentMapping {
    base: *mut u8,
    len: usize,
}

/// Per-process map of segment id to local mapping base
///
/// The table is the only component allowed to turn a [`RelativePointer`]
/// into an address. Insertions happen when a segment is mapped; the daemon
/// and every application hold their own table.
#[derive(Debug, Default)]
pub struct SegmentTable {
    entries: RwLock<HashMap<SegmentId, SegmentMapping>>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a mapped segment
    ///
    /// # Safety
    /// `base` must point to a mapping of at least `len` bytes that outlives
    /// every resolution made through this table.
    pub unsafe fn insert(&self, id: SegmentId, base: *mut u8, len: usize) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(id, SegmentMapping { base, len });
    }

    /// Forget a segment; outstanding pointers into it become unresolvable
    pub fn remove(&self, id: SegmentId) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(&id);
    }

    /// Local base address of a segment
    pub fn base_of(&self, id: SegmentId) -> Result<*mut u8> {
        let entries = self.entries.read().unwrap();
        entries
            .get(&id)
            .map(|m| m.base)
            .ok_or_else(|| MonetError::invalid_parameter("segment", format!("segment {} not mapped", id)))
    }

    /// Mapped length of a segment
    pub fn len_of(&self, id: SegmentId) -> Result<usize> {
        let entries = self.entries.read().unwrap();
        entries
            .get(&id)
            .map(|m| m.len)
            .ok_or_else(|| MonetError::invalid_parameter("segment", format!("segment {} not mapped", id)))
    }

    /// Resolve a relative pointer to a local address, bounds-checked
    pub fn resolve(&self, ptr: RelativePointer) -> Result<*mut u8> {
        let entries = self.entries.read().unwrap();
        let mapping = entries.get(&ptr.segment).ok_or_else(|| {
            MonetError::invalid_parameter("segment", format!("segment {} not mapped", ptr.segment))
        })?;
        if ptr.offset as usize >= mapping.len {
            return Err(MonetError::invariant(format!(
                "offset {} outside segment {} of {} bytes",
                ptr.offset, ptr.segment, mapping.len
            )));
        }
        Ok(unsafe { mapping.base.add(ptr.offset as usize) })
    }

    /// Number of mapped segments
    pub fn segment_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Ids of all mapped segments
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.entries.read().unwrap().keys().copied().collect()
    }
}

// Raw bases are only dereferenced through bounds-checked resolution.
unsafe impl Send for SegmentTable {}
unsafe impl Sync for SegmentTable {}
