//! # Capacity-Class Buffer Pool
//!
//! Pre-allocated buffer slots grouped into capacity classes, serving the
//! packet hot path with zero heap churn after construction. Acquisition
//! picks the smallest class that fits the request and pops a slot from that
//! class's freelist; the lock is released before the caller fills the
//! buffer. Exhaustion fails immediately — the pool never blocks and never
//! grows.
//!
//! At 500k packets/sec with 256-byte telemetry frames, the default class
//! table (~7 MB resident) buffers several milliseconds of burst.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

/// Default capacity classes: (slot capacity, slot count).
pub const DEFAULT_CLASSES: [(usize, usize); 5] = [
    (64, 4096),
    (256, 2048),
    (1024, 1024),
    (4096, 512),
    (8192, 256),
];

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PoolError {
    /// No configured class can hold a buffer of the requested size.
    #[error("no capacity class fits {requested} bytes")]
    Oversized { requested: usize },
    /// The selected class has no free slots.
    #[error("pool exhausted: class of {class_capacity} bytes has no free slot ({requested} bytes requested)")]
    Exhausted {
        requested: usize,
        class_capacity: usize,
    },
}

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Pool counters. Relaxed ordering — observation only.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub exhausted: AtomicU64,
}

impl PoolStats {
    /// Buffers currently out of the pool.
    pub fn outstanding(&self) -> u64 {
        self.acquired
            .load(Ordering::Relaxed)
            .saturating_sub(self.released.load(Ordering::Relaxed))
    }
}

// ─── Pool ───────────────────────────────────────────────────────────────────

struct ClassPool {
    capacity: usize,
    total: usize,
    free: Mutex<Vec<BytesMut>>,
}

/// Fixed-size buffer pool with per-class freelists.
pub struct BufferPool {
    classes: Vec<ClassPool>,
    stats: PoolStats,
}

impl BufferPool {
    /// Build a pool from (capacity, count) pairs. Classes are sorted by
    /// capacity; every slot is allocated up front.
    pub fn new(classes: &[(usize, usize)]) -> Arc<Self> {
        let mut sorted: Vec<(usize, usize)> = classes.to_vec();
        sorted.sort_by_key(|(capacity, _)| *capacity);

        let classes = sorted
            .into_iter()
            .map(|(capacity, count)| {
                let mut free = Vec::with_capacity(count);
                for _ in 0..count {
                    free.push(BytesMut::with_capacity(capacity));
                }
                ClassPool {
                    capacity,
                    total: count,
                    free: Mutex::new(free),
                }
            })
            .collect::<Vec<ClassPool>>();

        let resident: usize = classes.iter().map(|c| c.capacity * c.total).sum();
        info!(
            classes = classes.len(),
            resident_bytes = resident,
            "buffer pool allocated"
        );

        Arc::new(BufferPool {
            classes,
            stats: PoolStats::default(),
        })
    }

    /// Build a pool with [`DEFAULT_CLASSES`].
    pub fn with_defaults() -> Arc<Self> {
        Self::new(&DEFAULT_CLASSES)
    }

    /// Acquire a buffer able to hold `size` bytes.
    ///
    /// O(classes) to select, O(1) to pop. The freelist lock covers only the
    /// pop itself; the returned buffer is filled lock-free by the caller.
    pub fn acquire(self: &Arc<Self>, size: usize) -> Result<PooledBuffer, PoolError> {
        let class = self
            .classes
            .iter()
            .position(|c| c.capacity >= size)
            .ok_or(PoolError::Oversized { requested: size })?;

        let slot = {
            let mut free = self.classes[class]
                .free
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            free.pop()
        };

        match slot {
            Some(mut data) => {
                data.clear();
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(PooledBuffer {
                    data: Some(data),
                    class,
                    pool: Arc::clone(self),
                })
            }
            None => {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Exhausted {
                    requested: size,
                    class_capacity: self.classes[class].capacity,
                })
            }
        }
    }

    fn release(&self, class: usize, mut data: BytesMut) {
        data.clear();
        let mut free = self.classes[class]
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        debug_assert!(free.len() < self.classes[class].total);
        free.push(data);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Free slots in the class that would serve a `size`-byte request.
    pub fn available_for(&self, size: usize) -> usize {
        self.classes
            .iter()
            .find(|c| c.capacity >= size)
            .map(|c| c.free.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    /// Total free slots across all classes.
    pub fn available(&self) -> usize {
        self.classes
            .iter()
            .map(|c| c.free.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Configured class capacities, ascending.
    pub fn class_capacities(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.capacity).collect()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

// ─── PooledBuffer ───────────────────────────────────────────────────────────

/// Owning handle to one pool slot. The slot returns to its freelist on drop,
/// on every exit path.
pub struct PooledBuffer {
    data: Option<BytesMut>,
    class: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Slot capacity (the class capacity, not the current length).
    pub fn capacity(&self) -> usize {
        self.data
            .as_ref()
            .map(BytesMut::capacity)
            .unwrap_or_default()
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.data.as_ref().expect("pooled buffer already released")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.data.as_mut().expect("pooled buffer already released")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(self.class, data);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("class", &self.class)
            .field("len", &self.data.as_ref().map(|d| d.len()))
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_selects_smallest_fitting_class() {
        let pool = BufferPool::new(&[(64, 2), (256, 2), (1024, 2)]);
        let buf = pool.acquire(100).unwrap();
        assert_eq!(buf.capacity(), 256);

        let buf = pool.acquire(64).unwrap();
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn acquire_oversized_fails() {
        let pool = BufferPool::new(&[(64, 2)]);
        assert!(matches!(
            pool.acquire(65),
            Err(PoolError::Oversized { requested: 65 })
        ));
    }

    #[test]
    fn exhaustion_fails_without_blocking() {
        let pool = BufferPool::new(&[(64, 2)]);
        let _a = pool.acquire(10).unwrap();
        let _b = pool.acquire(10).unwrap();

        let err = pool.acquire(10).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(pool.stats().exhausted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn release_on_drop_returns_slot() {
        let pool = BufferPool::new(&[(64, 1)]);
        {
            let mut buf = pool.acquire(10).unwrap();
            buf.extend_from_slice(b"payload");
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().released.load(Ordering::Relaxed), 1);

        // Reacquired slot comes back empty.
        let buf = pool.acquire(10).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn outstanding_tracks_live_handles() {
        let pool = BufferPool::new(&[(64, 4)]);
        let a = pool.acquire(1).unwrap();
        let b = pool.acquire(1).unwrap();
        assert_eq!(pool.stats().outstanding(), 2);
        drop(a);
        assert_eq!(pool.stats().outstanding(), 1);
        drop(b);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn classes_sorted_regardless_of_input_order() {
        let pool = BufferPool::new(&[(1024, 1), (64, 1), (256, 1)]);
        assert_eq!(pool.class_capacities(), vec![64, 256, 1024]);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = BufferPool::new(&[(256, 64)]);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Ok(mut buf) = pool.acquire(128) {
                        buf.extend_from_slice(&[0u8; 128]);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.stats().outstanding(), 0);
        assert_eq!(pool.available(), 64);
    }
}
