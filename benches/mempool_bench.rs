use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use monet::{
    config::{PoolEntry, SegmentGroupConfig},
    memory::{BackingType, SegmentManager},
    SegmentTable,
};
use std::sync::Arc;

fn pool_fixture(chunk_size: u32) -> (Arc<SegmentManager>, monet::SegmentId) {
    let manager = Arc::new(SegmentManager::new(Arc::new(SegmentTable::new())));
    let group = SegmentGroupConfig {
        name: format!("bench_{}", chunk_size),
        group: None,
        pools: vec![PoolEntry {
            chunk_size,
            chunk_count: 1024,
        }],
    };
    let segment = manager
        .create_group_segment(&group, BackingType::MemFd)
        .unwrap();
    (manager, segment)
}

fn benchmark_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("MemPool");

    for chunk_size in [128u32, 1024, 4096].iter() {
        group.bench_with_input(
            BenchmarkId::new("allocate_release", chunk_size),
            chunk_size,
            |b, &chunk_size| {
                let (manager, segment) = pool_fixture(chunk_size);
                let pool = manager.mempool_for(segment, 8).unwrap();

                b.iter(|| {
                    let mut chunks = Vec::new();
                    for _ in 0..64 {
                        match pool.allocate() {
                            Ok(chunk) => chunks.push(chunk),
                            Err(_) => break,
                        }
                    }
                    for chunk in chunks {
                        pool.release(chunk.chunk_index()).unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn benchmark_refcount_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("MemPool");

    group.bench_function("acquire_release_pair", |b| {
        let (manager, segment) = pool_fixture(256);
        let pool = manager.mempool_for(segment, 8).unwrap();
        let chunk = pool.allocate().unwrap();

        b.iter(|| {
            pool.acquire(chunk.chunk_index()).unwrap();
            pool.release(chunk.chunk_index()).unwrap();
        });

        pool.release(chunk.chunk_index()).unwrap();
    });

    group.finish();
}

criterion_group!(benches, benchmark_allocate_release, benchmark_refcount_churn);
criterion_main!(benches);
