//! Buffer manager statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics tracked by the buffer manager.
///
/// All fields are atomic for lock-free, thread-safe updates; statistics
/// are eventually consistent, so `Ordering::Relaxed` is sufficient.
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Number of times a page was found in the cache.
    pub cache_hits: AtomicU64,
    /// Number of times a page had to be read from disk.
    pub cache_misses: AtomicU64,
    /// Number of pages evicted from the cache.
    pub evictions: AtomicU64,
    /// Number of pages read from disk.
    pub pages_read: AtomicU64,
    /// Number of pages written to disk.
    pub pages_written: AtomicU64,
    /// Number of checkpoints performed.
    pub checkpoints: AtomicU64,
}

impl BufferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get a non-atomic snapshot for display/logging.
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of buffer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub checkpoints: u64,
}

impl fmt::Display for BufferStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferStats {{ hits: {}, misses: {}, evictions: {}, checkpoints: {} }}",
            self.cache_hits, self.cache_misses, self.evictions, self.checkpoints
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = BufferStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.snapshot().cache_hits, 0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = BufferStats::new();
        stats.cache_hits.fetch_add(7, Ordering::Relaxed);
        stats.cache_misses.fetch_add(3, Ordering::Relaxed);
        assert_eq!(stats.hit_rate(), 0.7);
    }
}
