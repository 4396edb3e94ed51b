//! Pool of reusable byte buffers for socket I/O.
//!
//! Every socket reads and writes through a [`MemChunk`] borrowed from the
//! binding's [`ChunkPool`] instead of allocating a buffer per call. The pool
//! only holds released chunks; a chunk that is in use is owned by exactly one
//! socket and cannot be reached through the pool.
//!
//! A released chunk stays dormant for `chunk-dormant-period` before it may be
//! handed out again. An I/O operation observed as complete by one task can
//! still be referencing the buffer elsewhere; reusing it sooner would corrupt
//! unrelated traffic. Chunks are only released once their last I/O finished.
//!
//! Housekeeping mirrors the retention logic of a transaction tracker: chunks
//! idle longer than `idle-chunk-life` are dropped by [`ChunkPool::evict_idle`],
//! and the pool never holds more than `max-chunk-pool-count` chunks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::BindingConfig;

/// A growable byte buffer owned by one socket at a time.
#[derive(Debug)]
pub struct MemChunk {
    id: u64,
    data: Vec<u8>,
    last_release: Option<Instant>,
}

impl MemChunk {
    fn with_capacity(id: u64, capacity: usize) -> Self {
        Self {
            id,
            data: Vec::with_capacity(capacity),
            last_release: None,
        }
    }

    /// Pool-unique identity, stable across acquire/release cycles.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// When the chunk was last returned to a pool; `None` for a fresh chunk.
    pub fn last_release(&self) -> Option<Instant> {
        self.last_release
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[derive(Clone, Debug)]
pub struct ChunkPoolConfig {
    /// Capacity of freshly allocated chunks.
    pub initial_capacity: usize,
    pub max_chunk_pool_count: usize,
    pub idle_chunk_life: Duration,
    pub dormant_period: Duration,
}

impl ChunkPoolConfig {
    pub fn from_binding(config: &BindingConfig) -> Self {
        Self {
            initial_capacity: config.client.snd_buf_size.max(config.server.rcv_buf_size),
            max_chunk_pool_count: config.max_chunk_pool_count,
            idle_chunk_life: config.idle_chunk_life,
            dormant_period: config.chunk_dormant_period,
        }
    }
}

impl Default for ChunkPoolConfig {
    fn default() -> Self {
        ChunkPoolConfig::from_binding(&BindingConfig::default())
    }
}

pub struct ChunkPool {
    config: ChunkPoolConfig,
    chunks: Mutex<Vec<MemChunk>>,
    next_id: AtomicU64,
}

impl ChunkPool {
    pub fn new(config: ChunkPoolConfig) -> Self {
        Self {
            config,
            chunks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ChunkPoolConfig {
        &self.config
    }

    /// Claims a dormant chunk from the pool or allocates a new one.
    pub fn acquire_or_create(&self) -> MemChunk {
        self.acquire_at(Instant::now())
    }

    /// [`acquire_or_create`](Self::acquire_or_create) against an explicit clock reading.
    pub fn acquire_at(&self, now: Instant) -> MemChunk {
        let reused = {
            let mut chunks = self.chunks.lock().expect("unable to lock chunk pool mutex");
            let dormant = self.config.dormant_period;
            let position = chunks.iter().position(|c| match c.last_release {
                Some(released) => now.saturating_duration_since(released) >= dormant,
                None => true,
            });
            position.map(|i| chunks.swap_remove(i))
        };

        match reused {
            Some(mut chunk) => {
                chunk.clear();
                trace!("Reusing chunk {}", chunk.id);
                chunk
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                trace!("Allocating chunk {}", id);
                MemChunk::with_capacity(id, self.config.initial_capacity)
            }
        }
    }

    /// Returns a chunk whose I/O has completed.
    pub fn release(&self, chunk: MemChunk) {
        self.release_at(chunk, Instant::now())
    }

    pub fn release_at(&self, mut chunk: MemChunk, now: Instant) {
        chunk.last_release = Some(now);
        let mut chunks = self.chunks.lock().expect("unable to lock chunk pool mutex");
        if chunks.len() < self.config.max_chunk_pool_count {
            chunks.push(chunk);
        } else {
            trace!("Chunk pool full, dropping chunk {}", chunk.id);
        }
    }

    /// Drops chunks released longer than `idle_chunk_life` ago. Returns how
    /// many were evicted.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let max_age = self.config.idle_chunk_life;
        let mut chunks = self.chunks.lock().expect("unable to lock chunk pool mutex");
        let before = chunks.len();
        chunks.retain(|c| match c.last_release {
            Some(released) => now.saturating_duration_since(released) < max_age,
            None => true,
        });
        before - chunks.len()
    }

    /// Number of released chunks currently held.
    pub fn len(&self) -> usize {
        self.chunks.lock().expect("unable to lock chunk pool mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
