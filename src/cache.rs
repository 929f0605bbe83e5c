//! Per-source frame caches, bounded to the current buffering window.
//!
//! **Why**: decoded frames arrive on decode threads and are drawn on the
//! render thread. The cache is the meeting point: a pts-ordered map per
//! source, generation-tagged so stale results from a superseded seek never
//! land, and pruned to a window around the playhead so memory stays bounded
//! no matter how long playback runs.
//!
//! **Used by**: Orchestrator (inserts), Engine/Compositor (lookups).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use uuid::Uuid;

use crate::cache_man::CacheManager;
use crate::frame::Frame;

/// Frames of one source, keyed by presentation time in microseconds.
#[derive(Debug)]
pub struct FrameCache {
    frames: BTreeMap<i64, Frame>,
    manager: Arc<CacheManager>,
}

impl FrameCache {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            frames: BTreeMap::new(),
            manager,
        }
    }

    /// Insert a decoded frame. Replacing an existing pts frees the old bytes.
    pub fn insert(&mut self, pts_us: i64, frame: Frame) {
        self.manager.add_memory(frame.mem());
        if let Some(old) = self.frames.insert(pts_us, frame) {
            self.manager.free_memory(old.mem());
        }
        trace!("cache insert pts={}us ({} frames)", pts_us, self.frames.len());
    }

    /// Latest frame at or before `pts_us`. This is the compositor's lookup:
    /// a frame is shown until its successor's pts passes.
    pub fn nearest_at_or_before(&self, pts_us: i64) -> Option<(i64, Frame)> {
        self.frames
            .range(..=pts_us)
            .next_back()
            .map(|(&pts, frame)| (pts, frame.clone()))
    }

    /// Drop every frame outside `[center - half_window, center + half_window]`.
    pub fn retain_window(&mut self, center_us: i64, half_window_us: i64) {
        let lo = center_us.saturating_sub(half_window_us);
        let hi = center_us.saturating_add(half_window_us);
        self.evict(|pts| pts < lo || pts > hi);
    }

    /// Drop frames strictly after `pts_us`. Backward seeks call this so the
    /// redecode from the keyframe anchor repopulates the span.
    pub fn invalidate_after(&mut self, pts_us: i64) {
        self.evict(|pts| pts > pts_us);
    }

    pub fn clear(&mut self) {
        let freed: usize = self.frames.values().map(|f| f.mem()).sum();
        self.manager.free_memory(freed);
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Span of cached pts values, if any.
    pub fn span(&self) -> Option<(i64, i64)> {
        let first = self.frames.keys().next()?;
        let last = self.frames.keys().next_back()?;
        Some((*first, *last))
    }

    fn evict(&mut self, drop: impl Fn(i64) -> bool) {
        let before = self.frames.len();
        let mut freed = 0usize;
        self.frames.retain(|&pts, frame| {
            if drop(pts) {
                freed += frame.mem();
                false
            } else {
                true
            }
        });
        if freed > 0 {
            self.manager.free_memory(freed);
            debug!(
                "cache evicted {} frames, freed {} KB",
                before - self.frames.len(),
                freed / 1024
            );
        }
    }
}

impl Drop for FrameCache {
    fn drop(&mut self) {
        let held: usize = self.frames.values().map(|f| f.mem()).sum();
        self.manager.free_memory(held);
    }
}

/// All per-source caches, shared between decode threads and the render
/// thread.
#[derive(Clone)]
pub struct CacheSet {
    inner: Arc<Mutex<HashMap<Uuid, FrameCache>>>,
    manager: Arc<CacheManager>,
}

impl CacheSet {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            manager,
        }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Run `f` with the cache of `source`, creating it on first use.
    pub fn with_cache<R>(&self, source: Uuid, f: impl FnOnce(&mut FrameCache) -> R) -> R {
        let mut map = self.lock();
        let cache = map
            .entry(source)
            .or_insert_with(|| FrameCache::new(Arc::clone(&self.manager)));
        f(cache)
    }

    /// Lookup without creating a cache for unknown sources.
    pub fn nearest_at_or_before(&self, source: Uuid, pts_us: i64) -> Option<(i64, Frame)> {
        self.lock()
            .get(&source)
            .and_then(|c| c.nearest_at_or_before(pts_us))
    }

    /// Remove a source's cache entirely, freeing its frames.
    pub fn remove(&self, source: Uuid) {
        self.lock().remove(&source);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, FrameCache>> {
        // A panicking decode thread must not wedge the render loop
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<CacheManager> {
        Arc::new(CacheManager::with_limit(64 * 1024 * 1024))
    }

    fn frame() -> Frame {
        Frame::solid(8, 8, [1, 2, 3, 255])
    }

    #[test]
    fn test_nearest_at_or_before() {
        let mut cache = FrameCache::new(manager());
        cache.insert(0, frame());
        cache.insert(40_000, frame());
        cache.insert(80_000, frame());

        assert_eq!(cache.nearest_at_or_before(55_000).map(|(p, _)| p), Some(40_000));
        assert_eq!(cache.nearest_at_or_before(40_000).map(|(p, _)| p), Some(40_000));
        assert!(cache.nearest_at_or_before(-1).is_none());
    }

    #[test]
    fn test_retain_window_bounds_cache() {
        let mgr = manager();
        let mut cache = FrameCache::new(Arc::clone(&mgr));
        for i in 0..100 {
            cache.insert(i * 100_000, frame());
        }
        // Window of +-2 s around 5 s keeps [3s, 7s]
        cache.retain_window(5_000_000, 2_000_000);
        let (lo, hi) = cache.span().unwrap();
        assert!(lo >= 3_000_000 && hi <= 7_000_000);
        assert_eq!(cache.len(), 41);
    }

    #[test]
    fn test_memory_accounting() {
        let mgr = manager();
        let mut cache = FrameCache::new(Arc::clone(&mgr));
        cache.insert(0, frame());
        cache.insert(1, frame());
        assert_eq!(mgr.mem().0, 2 * 8 * 8 * 4);

        // Replacement does not double count
        cache.insert(0, frame());
        assert_eq!(mgr.mem().0, 2 * 8 * 8 * 4);

        cache.clear();
        assert_eq!(mgr.mem().0, 0);
    }

    #[test]
    fn test_drop_releases_accounting() {
        let mgr = manager();
        {
            let mut cache = FrameCache::new(Arc::clone(&mgr));
            cache.insert(0, frame());
            assert!(mgr.mem().0 > 0);
        }
        assert_eq!(mgr.mem().0, 0);
    }

    #[test]
    fn test_invalidate_after() {
        let mut cache = FrameCache::new(manager());
        for i in 0..10 {
            cache.insert(i * 1_000_000, frame());
        }
        cache.invalidate_after(4_000_000);
        assert_eq!(cache.span(), Some((0, 4_000_000)));
    }

    #[test]
    fn test_cache_set_per_source_isolation() {
        let set = CacheSet::new(manager());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        set.with_cache(a, |c| c.insert(0, frame()));
        assert!(set.nearest_at_or_before(a, 0).is_some());
        assert!(set.nearest_at_or_before(b, 0).is_none());
        set.remove(a);
        assert!(set.nearest_at_or_before(a, 0).is_none());
    }
}
