//! Tests for mempools and the segment manager

use std::sync::Arc;

use monet::{
    config::{PoolEntry, SegmentGroupConfig},
    memory::{acquire_chunk, release_chunk, BackingType, SegmentManager},
    MonetError, SegmentTable,
};

fn manager_with_pools(pools: Vec<PoolEntry>) -> (Arc<SegmentManager>, monet::SegmentId) {
    let manager = Arc::new(SegmentManager::new(Arc::new(SegmentTable::new())));
    let group = SegmentGroupConfig {
        name: "test".to_string(),
        group: None,
        pools,
    };
    let id = manager
        .create_group_segment(&group, BackingType::MemFd)
        .expect("failed to create segment");
    (manager, id)
}

#[test]
fn boundary_allocation_succeeds_then_pool_empty() {
    let (manager, segment) = manager_with_pools(vec![PoolEntry {
        chunk_size: 128,
        chunk_count: 4,
    }]);
    let pool = manager.mempool_for(segment, 16).unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.allocate().unwrap());
    }

    // Exactly one chunk left: the allocation succeeds.
    held.push(pool.allocate().unwrap());
    // The next one reports exhaustion to the caller, no retry inside.
    assert!(matches!(pool.allocate(), Err(MonetError::PoolEmpty { .. })));

    for chunk in held {
        pool.release(chunk.chunk_index()).unwrap();
    }
}

#[test]
fn free_plus_used_always_equals_capacity() {
    let (manager, segment) = manager_with_pools(vec![PoolEntry {
        chunk_size: 128,
        chunk_count: 8,
    }]);
    let pool = manager.mempool_for(segment, 16).unwrap();

    let a = pool.allocate().unwrap();
    let b = pool.allocate().unwrap();
    assert_eq!(pool.used() + pool.free_chunks(), pool.chunk_count());

    pool.release(a.chunk_index()).unwrap();
    assert_eq!(pool.used() + pool.free_chunks(), pool.chunk_count());

    pool.release(b.chunk_index()).unwrap();
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.free_chunks(), pool.chunk_count());
}

#[test]
fn net_references_return_chunk_exactly_once() {
    let (manager, segment) = manager_with_pools(vec![PoolEntry {
        chunk_size: 128,
        chunk_count: 2,
    }]);
    let table = manager.table();
    let chunk = manager.allocate(segment, 16).unwrap();

    // Three holders: allocator, queue, history.
    acquire_chunk(table, chunk).unwrap();
    acquire_chunk(table, chunk).unwrap();

    assert!(!release_chunk(table, chunk).unwrap());
    assert!(!release_chunk(table, chunk).unwrap());
    assert!(release_chunk(table, chunk).unwrap());

    // A fourth release is a detected invariant violation.
    assert!(matches!(
        release_chunk(table, chunk),
        Err(MonetError::InvariantViolation { .. })
    ));

    let pool = manager.mempool_for(segment, 16).unwrap();
    assert_eq!(pool.used(), 0);
}

#[test]
fn size_selection_prefers_smallest_fitting_pool() {
    let (manager, segment) = manager_with_pools(vec![
        PoolEntry {
            chunk_size: 1024,
            chunk_count: 4,
        },
        PoolEntry {
            chunk_size: 128,
            chunk_count: 4,
        },
        PoolEntry {
            chunk_size: 256,
            chunk_count: 4,
        },
    ]);

    assert_eq!(manager.mempool_for(segment, 8).unwrap().chunk_size(), 128);
    assert_eq!(manager.mempool_for(segment, 150).unwrap().chunk_size(), 256);
    assert_eq!(manager.mempool_for(segment, 500).unwrap().chunk_size(), 1024);
    assert!(matches!(
        manager.mempool_for(segment, 4096),
        Err(MonetError::NoFittingPool { .. })
    ));
}

#[test]
fn concurrent_churn_preserves_pool_accounting() {
    let (manager, segment) = manager_with_pools(vec![PoolEntry {
        chunk_size: 256,
        chunk_count: 32,
    }]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        handles.push(std::thread::spawn(move || {
            let pool = manager.mempool_for(segment, 64).unwrap();
            for _ in 0..2_000 {
                match pool.allocate() {
                    Ok(chunk) => {
                        pool.release(chunk.chunk_index()).unwrap();
                    }
                    Err(MonetError::PoolEmpty { .. }) => std::hint::spin_loop(),
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let pool = manager.mempool_for(segment, 64).unwrap();
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.free_chunks(), 32);
}

#[test]
fn payload_round_trips_through_shared_memory() {
    let (manager, segment) = manager_with_pools(vec![PoolEntry {
        chunk_size: 256,
        chunk_count: 2,
    }]);
    let pool = manager.mempool_for(segment, 64).unwrap();

    let chunk = pool.allocate().unwrap();
    let payload = b"radar frame 0042";
    unsafe {
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            pool.payload_ptr(chunk.chunk_index()),
            payload.len(),
        );
    }

    let read_back = unsafe {
        std::slice::from_raw_parts(pool.payload_ptr(chunk.chunk_index()), payload.len())
    };
    assert_eq!(read_back, payload);
    pool.release(chunk.chunk_index()).unwrap();
}
