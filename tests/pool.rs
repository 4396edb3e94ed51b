use std::time::{Duration, Instant};

use glue_rpc::pool::{ChunkPool, ChunkPoolConfig};

fn pool(max: usize) -> ChunkPool {
    ChunkPool::new(ChunkPoolConfig {
        initial_capacity: 256,
        max_chunk_pool_count: max,
        idle_chunk_life: Duration::from_secs(120),
        dormant_period: Duration::from_secs(60),
    })
}

#[test]
fn released_chunk_stays_dormant() {
    let pool = pool(8);
    let t0 = Instant::now();

    let chunk = pool.acquire_at(t0);
    let id = chunk.id();
    pool.release_at(chunk, t0);
    assert_eq!(pool.len(), 1);

    let early = pool.acquire_at(t0 + Duration::from_secs(59));
    assert_ne!(early.id(), id, "dormant chunk handed out early");
    assert_eq!(pool.len(), 1);

    let late = pool.acquire_at(t0 + Duration::from_secs(60));
    assert_eq!(late.id(), id);
    assert!(pool.is_empty());
}

#[test]
fn reused_chunk_comes_back_empty_with_its_capacity() {
    let pool = pool(8);
    let t0 = Instant::now();

    let mut chunk = pool.acquire_at(t0);
    assert!(chunk.capacity() >= 256);
    chunk.buffer_mut().extend_from_slice(b"leftover");
    pool.release_at(chunk, t0);

    let chunk = pool.acquire_at(t0 + Duration::from_secs(61));
    assert!(chunk.is_empty());
    assert!(chunk.capacity() >= 256);
}

#[test]
fn pool_never_exceeds_its_cap() {
    let pool = pool(2);
    let t0 = Instant::now();

    let chunks: Vec<_> = (0..4).map(|_| pool.acquire_at(t0)).collect();
    for chunk in chunks {
        pool.release_at(chunk, t0);
    }
    assert_eq!(pool.len(), 2);
}

#[test]
fn idle_chunks_are_evicted() {
    let pool = pool(8);
    let t0 = Instant::now();

    let old = pool.acquire_at(t0);
    let young = pool.acquire_at(t0);
    pool.release_at(old, t0);
    pool.release_at(young, t0 + Duration::from_secs(100));

    assert_eq!(pool.evict_idle_at(t0 + Duration::from_secs(119)), 0);
    assert_eq!(pool.evict_idle_at(t0 + Duration::from_secs(120)), 1);
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.evict_idle_at(t0 + Duration::from_secs(220)), 1);
    assert!(pool.is_empty());
}

#[test]
fn chunk_ids_are_unique() {
    let pool = pool(8);
    let a = pool.acquire_or_create();
    let b = pool.acquire_or_create();
    assert_ne!(a.id(), b.id());
}
