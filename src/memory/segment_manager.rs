//! Segment manager: startup layout of shared memory per user group
//!
//! At daemon startup every configured group gets one segment sized to hold
//! its mempool table plus fixed overhead. Pools inside a segment are kept
//! sorted by chunk size so allocation can pick the smallest fitting pool.

use std::{
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, info, warn};

use crate::{
    config::SegmentGroupConfig,
    error::{MonetError, Result},
    layout::constants::{DEFAULT_CHUNK_ALIGNMENT, MAX_POOLS_PER_SEGMENT},
    layout::{ChunkRef, SegmentId, SegmentTable},
};

use super::{
    mempool::MemPool,
    segment::{BackingType, CreationPolicy, SegmentConfig, SharedMemorySegment},
};

#[derive(Debug)]
struct ManagedSegment {
    segment: SharedMemorySegment,
    group: Option<String>,
    pools: Vec<MemPool>,
}

/// Owner of all daemon-created segments and their pools
#[derive(Debug)]
pub struct SegmentManager {
    table: Arc<SegmentTable>,
    segments: RwLock<Vec<ManagedSegment>>,
    next_segment_id: Mutex<SegmentId>,
}

impl SegmentManager {
    pub fn new(table: Arc<SegmentTable>) -> Self {
        Self {
            table,
            segments: RwLock::new(Vec::new()),
            next_segment_id: Mutex::new(1),
        }
    }

    /// The process-local segment table all segments register with
    pub fn table(&self) -> &Arc<SegmentTable> {
        &self.table
    }

    fn next_id(&self) -> SegmentId {
        let mut guard = self.next_segment_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        id
    }

    /// Remove leftover segment files from a crashed predecessor
    ///
    /// The daemon is the sole creator, so any `monet_` file present before
    /// startup is stale by definition and unlinked.
    pub fn purge_stale(dir: &Path) -> Result<usize> {
        let mut purged = 0;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(MonetError::from_io(e, "failed to scan segment directory")),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("monet_") {
                warn!("purging stale segment file {:?}", name);
                let _ = std::fs::remove_file(entry.path());
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Create one segment for a configured group, carving out its pools
    pub fn create_group_segment(
        &self,
        config: &SegmentGroupConfig,
        backing: BackingType,
    ) -> Result<SegmentId> {
        if config.pools.is_empty() {
            return Err(MonetError::config("pools", "group defines no pools"));
        }
        if config.pools.len() > MAX_POOLS_PER_SEGMENT {
            return Err(MonetError::config(
                "pools",
                format!("at most {} pools per segment", MAX_POOLS_PER_SEGMENT),
            ));
        }

        // Sort ascending by chunk size so lookup can stop at the first fit.
        let mut entries = config.pools.clone();
        entries.sort_by_key(|e| e.chunk_size);

        let header_area = 4096usize;
        let mut total = header_area;
        for entry in &entries {
            total += MemPool::required_bytes(
                entry.chunk_size,
                entry.chunk_count,
                DEFAULT_CHUNK_ALIGNMENT as u32,
            );
            total = (total + 63) & !63;
        }

        let segment_id = self.next_id();
        let mut segment_config = SegmentConfig::new(&config.name, segment_id, total)
            .with_backing(backing)
            .with_policy(CreationPolicy::ExclusiveCreate);
        if let Some(group) = &config.group {
            segment_config = segment_config.with_group(group.clone());
        }
        let segment = SharedMemorySegment::create(segment_config)?;

        let base = segment.base_ptr();
        let mut pools = Vec::with_capacity(entries.len());
        let mut cursor = header_area;
        for (pool_index, entry) in entries.iter().enumerate() {
            let pool = unsafe {
                MemPool::init(
                    base,
                    segment_id,
                    pool_index as u16,
                    cursor,
                    entry.chunk_size,
                    entry.chunk_count,
                    DEFAULT_CHUNK_ALIGNMENT as u32,
                )?
            };
            unsafe {
                let header = segment.header_mut();
                header.pool_offsets[pool_index] = cursor as u64;
                header.pool_count = pool_index as u32 + 1;
            }
            cursor += MemPool::required_bytes(
                entry.chunk_size,
                entry.chunk_count,
                DEFAULT_CHUNK_ALIGNMENT as u32,
            );
            cursor = (cursor + 63) & !63;
            debug!(
                "segment {} pool {}: {} chunks of {} bytes",
                segment_id, pool_index, entry.chunk_count, entry.chunk_size
            );
            pools.push(pool);
        }

        segment.register_with(&self.table);
        info!(
            "created segment {} ({}) with {} pools, {} bytes",
            segment_id,
            segment.name(),
            pools.len(),
            total
        );

        let mut segments = self.segments.write().unwrap();
        segments.push(ManagedSegment {
            segment,
            group: config.group.clone(),
            pools,
        });
        Ok(segment_id)
    }

    /// Create a pool-less segment for daemon management structures
    pub fn create_raw_segment(
        &self,
        name: &str,
        size: usize,
        backing: BackingType,
    ) -> Result<SegmentId> {
        let segment_id = self.next_id();
        let config = SegmentConfig::new(name, segment_id, size)
            .with_backing(backing)
            .with_policy(CreationPolicy::ExclusiveCreate);
        let segment = SharedMemorySegment::create(config)?;
        segment.register_with(&self.table);

        let mut segments = self.segments.write().unwrap();
        segments.push(ManagedSegment {
            segment,
            group: None,
            pools: Vec::new(),
        });
        Ok(segment_id)
    }

    /// Data segment serving a given uid
    ///
    /// Picks the first segment whose POSIX group lists the user as a
    /// member; groupless segments accept everyone.
    pub fn segment_for(&self, uid: u32) -> Result<SegmentId> {
        let segments = self.segments.read().unwrap();
        let user_name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name);

        for managed in segments.iter().filter(|m| !m.pools.is_empty()) {
            match (&managed.group, &user_name) {
                (None, _) => return Ok(managed.segment.segment_id()),
                (Some(group), Some(user)) => {
                    let is_member = nix::unistd::Group::from_name(group)
                        .ok()
                        .flatten()
                        .map(|g| g.mem.iter().any(|m| m == user))
                        .unwrap_or(false);
                    if is_member {
                        return Ok(managed.segment.segment_id());
                    }
                }
                (Some(_), None) => {}
            }
        }
        Err(MonetError::PermissionDenied {
            message: format!("no segment accepts uid {}", uid),
        })
    }

    /// Smallest pool in `segment` whose chunks fit `payload_size` bytes
    pub fn mempool_for(&self, segment: SegmentId, payload_size: usize) -> Result<MemPool> {
        let segments = self.segments.read().unwrap();
        let managed = segments
            .iter()
            .find(|m| m.segment.segment_id() == segment)
            .ok_or_else(|| MonetError::invalid_parameter("segment", format!("unknown segment {}", segment)))?;

        // Pools are sorted ascending; ties broken by lowest index.
        managed
            .pools
            .iter()
            .find(|p| p.payload_capacity() as usize >= payload_size)
            .copied()
            .ok_or(MonetError::NoFittingPool {
                payload_size: payload_size as u32,
            })
    }

    /// Allocate a chunk able to hold `payload_size` bytes from `segment`
    pub fn allocate(&self, segment: SegmentId, payload_size: usize) -> Result<ChunkRef> {
        self.mempool_for(segment, payload_size)?.allocate()
    }

    /// Ids of all managed segments
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        let segments = self.segments.read().unwrap();
        segments.iter().map(|m| m.segment.segment_id()).collect()
    }

    /// `(id, name, size)` of every managed segment, for registration replies
    pub fn segment_infos(&self) -> Vec<(SegmentId, String, u64)> {
        let segments = self.segments.read().unwrap();
        segments
            .iter()
            .map(|m| {
                (
                    m.segment.segment_id(),
                    m.segment.name().to_string(),
                    m.segment.size() as u64,
                )
            })
            .collect()
    }

    /// Unmap and unlink every segment; called on daemon shutdown
    pub fn unlink_all(&self) {
        let mut segments = self.segments.write().unwrap();
        for managed in segments.drain(..) {
            info!("unlinking segment {}", managed.segment.segment_id());
            self.table.remove(managed.segment.segment_id());
            // Owner drop unlinks the backing file.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolEntry;

    fn test_group(name: &str) -> SegmentGroupConfig {
        SegmentGroupConfig {
            name: name.to_string(),
            group: None,
            pools: vec![
                PoolEntry {
                    chunk_size: 1024,
                    chunk_count: 4,
                },
                PoolEntry {
                    chunk_size: 128,
                    chunk_count: 4,
                },
            ],
        }
    }

    #[test]
    fn pool_selection_prefers_smallest_fit() {
        let manager = SegmentManager::new(Arc::new(SegmentTable::new()));
        let id = manager
            .create_group_segment(&test_group("select"), BackingType::MemFd)
            .unwrap();

        let small = manager.mempool_for(id, 16).unwrap();
        assert_eq!(small.chunk_size(), 128);

        let large = manager.mempool_for(id, 200).unwrap();
        assert_eq!(large.chunk_size(), 1024);

        assert!(matches!(
            manager.mempool_for(id, 4096),
            Err(MonetError::NoFittingPool { .. })
        ));
    }

    #[test]
    fn allocation_routes_through_fitting_pool() {
        let manager = SegmentManager::new(Arc::new(SegmentTable::new()));
        let id = manager
            .create_group_segment(&test_group("alloc"), BackingType::MemFd)
            .unwrap();

        let chunk = manager.allocate(id, 64).unwrap();
        let pool = manager.mempool_for(id, 64).unwrap();
        assert_eq!(chunk.pool_index(), pool.pool_index());
        assert_eq!(pool.used(), 1);
        pool.release(chunk.chunk_index()).unwrap();
    }

    #[test]
    fn groupless_segment_accepts_any_uid() {
        let manager = SegmentManager::new(Arc::new(SegmentTable::new()));
        let id = manager
            .create_group_segment(&test_group("any"), BackingType::MemFd)
            .unwrap();
        assert_eq!(manager.segment_for(0).unwrap(), id);
    }
}
