//! Shared cache memory manager with generation-based invalidation.
//!
//! **Why**: every source keeps its own frame cache, but memory pressure is a
//! global concern. One manager tracks bytes across all caches against a limit
//! derived from available system memory. The generation counters cancel stale
//! decode results during fast scrubbing.
//!
//! **Used by**: Engine (owns the singleton), FrameCache (per-source tracking),
//! Orchestrator (generation tagging).

use log::{debug, info};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use sysinfo::System;

/// Global cache memory manager
#[derive(Debug)]
pub struct CacheManager {
    /// Atomically tracked memory usage (bytes)
    memory_usage: Arc<AtomicUsize>,
    /// Maximum allowed memory (bytes)
    max_memory_bytes: AtomicUsize,
}

impl CacheManager {
    /// Create cache manager with memory limit.
    ///
    /// * `mem_fraction` - fraction of available memory (0.0-1.0)
    /// * `reserve_gb` - memory kept free for the rest of the system
    pub fn new(mem_fraction: f64, reserve_gb: f64) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
        let usable = available.saturating_sub(reserve);
        let max_memory_bytes = (usable as f64 * mem_fraction) as usize;

        info!(
            "CacheManager init: available={} MB, reserve={} MB, limit={} MB ({}%)",
            available / 1024 / 1024,
            reserve / 1024 / 1024,
            max_memory_bytes / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );

        Self {
            memory_usage: Arc::new(AtomicUsize::new(0)),
            max_memory_bytes: AtomicUsize::new(max_memory_bytes),
        }
    }

    /// Fixed-limit constructor for tests and embedders with their own policy.
    pub fn with_limit(max_memory_bytes: usize) -> Self {
        Self {
            memory_usage: Arc::new(AtomicUsize::new(0)),
            max_memory_bytes: AtomicUsize::new(max_memory_bytes),
        }
    }

    /// Check if memory limit exceeded
    pub fn over_limit(&self) -> bool {
        self.memory_usage.load(Ordering::Relaxed) > self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// Get memory statistics (usage, limit)
    pub fn mem(&self) -> (usize, usize) {
        let usage = self.memory_usage.load(Ordering::Relaxed);
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        (usage, limit)
    }

    /// Add memory usage
    pub fn add_memory(&self, bytes: usize) {
        let new_usage = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        if new_usage > limit {
            debug!(
                "Memory limit exceeded: {} MB / {} MB",
                new_usage / 1024 / 1024,
                limit / 1024 / 1024
            );
        }
    }

    /// Free memory usage (saturating subtraction to prevent underflow)
    pub fn free_memory(&self, bytes: usize) {
        loop {
            let current = self.memory_usage.load(Ordering::Relaxed);
            let new_val = current.saturating_sub(bytes);
            if self
                .memory_usage
                .compare_exchange_weak(current, new_val, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Update memory limit (e.g. from settings)
    pub fn set_memory_limit(&self, mem_fraction: f64, reserve_gb: f64) {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
        let usable = available.saturating_sub(reserve);
        let new_limit = (usable as f64 * mem_fraction) as usize;
        self.max_memory_bytes.store(new_limit, Ordering::Relaxed);

        info!(
            "Memory limit updated: {} MB ({}%)",
            new_limit / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );
    }
}

/// Per-source request generation.
///
/// Every seek bumps the counter; decode results carry the generation they
/// were requested under, and results with a stale generation are discarded
/// before they reach the cache.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    counter: Arc<AtomicU64>,
}

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new generation.
    pub fn bump(&self) -> u64 {
        let next = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("generation bumped: {}", next);
        next
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn is_current(&self, issued: u64) -> bool {
        self.current() == issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tracking() {
        let manager = CacheManager::with_limit(10 * 1024 * 1024);

        manager.add_memory(1024 * 1024);
        let (usage, _) = manager.mem();
        assert_eq!(usage, 1024 * 1024);

        manager.free_memory(512 * 1024);
        let (usage, _) = manager.mem();
        assert_eq!(usage, 512 * 1024);

        // Saturates at zero
        manager.free_memory(usize::MAX);
        assert_eq!(manager.mem().0, 0);
    }

    #[test]
    fn test_over_limit() {
        let manager = CacheManager::with_limit(100);
        assert!(!manager.over_limit());
        manager.add_memory(101);
        assert!(manager.over_limit());
    }

    #[test]
    fn test_generation_staleness() {
        let generation = Generation::new();
        let g0 = generation.current();
        assert!(generation.is_current(g0));
        let g1 = generation.bump();
        assert!(!generation.is_current(g0));
        assert!(generation.is_current(g1));
    }
}
