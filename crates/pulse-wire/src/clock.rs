//! Monotonic timestamping and sequence numbering for packet producers.

use quanta::{Clock, Instant};
use std::sync::atomic::{AtomicU32, Ordering};

// ─── TimestampClock ─────────────────────────────────────────────────────────

/// Nanosecond clock for packet timestamps, anchored to a monotonic epoch
/// captured at construction.
pub struct TimestampClock {
    clock: Clock,
    epoch: Instant,
}

impl TimestampClock {
    pub fn new() -> Self {
        let clock = Clock::new();
        let epoch = clock.now();
        TimestampClock { clock, epoch }
    }

    /// Nanoseconds since this clock's epoch.
    pub fn now_ns(&self) -> u64 {
        let elapsed = self.clock.now() - self.epoch;
        elapsed.as_nanos() as u64
    }
}

impl Default for TimestampClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── SequenceGenerator ──────────────────────────────────────────────────────

/// Thread-safe wrapping sequence counter. One per (source, packet-id)
/// stream; wrap near `u32::MAX` is expected and handled downstream.
pub struct SequenceGenerator {
    next: AtomicU32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        SequenceGenerator {
            next: AtomicU32::new(0),
        }
    }

    /// Start from a specific sequence (resuming a stream).
    pub fn starting_at(sequence: u32) -> Self {
        SequenceGenerator {
            next: AtomicU32::new(sequence),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = TimestampClock::new();
        let t1 = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = clock.now_ns();
        assert!(t2 > t1);
    }

    #[test]
    fn sequence_increments() {
        let seq = SequenceGenerator::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.current(), 3);
    }

    #[test]
    fn sequence_wraps() {
        let seq = SequenceGenerator::starting_at(u32::MAX);
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 0);
    }

    #[test]
    fn sequence_unique_across_threads() {
        let seq = std::sync::Arc::new(SequenceGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let seq = seq.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| seq.next()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
