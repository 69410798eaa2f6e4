//! Sharing of watchers between consumers.
//!
//! Every consumer interested in a target (a pin, an open thread view)
//! obtains the target's watcher from the pool and releases it when done.
//! At most one live watcher exists per target. When the last listener
//! leaves, the watcher is parked in a bounded LRU cache with its state
//! intact, so re-opening the thread shortly after closing it resumes where
//! it left off. Only eviction from the cache really destroys a watcher.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::backoff::BackoffTable;
use crate::errors::PoolError;
use crate::target::WatchTarget;
use crate::watcher::{Listener, ListenerId, ThreadWatcher, WatcherId};

pub struct LoaderPool {
    live: HashMap<WatchTarget, ThreadWatcher>,
    cache: LruCache<WatchTarget, ThreadWatcher>,
    table: BackoffTable,
    next_id: u64,
}

impl LoaderPool {
    pub fn new(capacity: NonZeroUsize, table: BackoffTable) -> Self {
        Self {
            live: HashMap::new(),
            cache: LruCache::new(capacity),
            table,
            next_id: 0,
        }
    }

    /// Attach `listener` to the watcher for `target`, reviving it from the
    /// cache or creating it as needed.
    pub fn obtain(&mut self, target: &WatchTarget, listener: Listener) -> Result<WatcherId, PoolError> {
        if let Some(watcher) = self.live.get_mut(target) {
            watcher.attach(listener)?;
            return Ok(watcher.id());
        }

        let mut watcher = match self.cache.pop(target) {
            Some(watcher) => {
                debug!(thread = %target, id = %watcher.id(), "watcher revived from cache");
                watcher
            }
            None => {
                self.next_id += 1;
                ThreadWatcher::new(WatcherId(self.next_id), target.clone(), self.table.clone())
            }
        };

        watcher.attach(listener)?;
        let id = watcher.id();
        self.live.insert(target.clone(), watcher);
        Ok(id)
    }

    /// Detach `listener`. Releasing a pair that was never obtained, or
    /// releasing it twice, is an error.
    pub fn release(&mut self, target: &WatchTarget, listener: ListenerId) -> Result<(), PoolError> {
        let watcher = self
            .live
            .get_mut(target)
            .ok_or_else(|| PoolError::NotObtained {
                target: target.clone(),
                listener,
            })?;

        if watcher.detach(listener)? > 0 {
            return Ok(());
        }

        if let Some(mut watcher) = self.live.remove(target) {
            watcher.cancel();
            debug!(thread = %target, id = %watcher.id(), "watcher parked in cache");
            if let Some((evicted_target, evicted)) = self.cache.push(target.clone(), watcher) {
                debug!(thread = %evicted_target, "evicting least recently used watcher");
                evicted.destroy();
            }
        }
        Ok(())
    }

    pub fn get(&self, target: &WatchTarget) -> Option<&ThreadWatcher> {
        self.live.get(target)
    }

    pub fn get_mut(&mut self, target: &WatchTarget) -> Option<&mut ThreadWatcher> {
        self.live.get_mut(target)
    }

    pub fn live(&self) -> impl Iterator<Item = &ThreadWatcher> {
        self.live.values()
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut ThreadWatcher> {
        self.live.values_mut()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn is_cached(&self, target: &WatchTarget) -> bool {
        self.cache.contains(target)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Destroy every watcher, live and cached.
    pub fn clear(&mut self) {
        for (_, watcher) in self.live.drain() {
            watcher.destroy();
        }
        while let Some((_, watcher)) = self.cache.pop_lru() {
            watcher.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FetchResult;
    use crate::watcher::tests::{success, t0, thread_posts, RecordingDispatcher};

    fn pool(capacity: usize) -> LoaderPool {
        LoaderPool::new(NonZeroUsize::new(capacity).unwrap(), BackoffTable::default())
    }

    fn listener(id: u64) -> Listener {
        Listener::silent(ListenerId(id))
    }

    #[test]
    fn equal_targets_share_one_watcher() {
        let mut pool = pool(4);
        let a = pool.obtain(&WatchTarget::thread("g", 1), listener(1)).unwrap();
        let b = pool.obtain(&WatchTarget::thread("g", 1), listener(2)).unwrap();
        let c = pool.obtain(&WatchTarget::thread("g", 2), listener(3)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.live_len(), 2);
        assert_eq!(pool.get(&WatchTarget::thread("g", 1)).unwrap().listener_count(), 2);
    }

    #[test]
    fn mode_is_part_of_the_key() {
        let mut pool = pool(4);
        let thread = pool.obtain(&WatchTarget::thread("g", 0), listener(1)).unwrap();
        let catalog = pool.obtain(&WatchTarget::catalog("g"), listener(2)).unwrap();
        assert_ne!(thread, catalog);
    }

    #[test]
    fn release_keeps_watcher_while_a_listener_remains() {
        let mut pool = pool(4);
        let target = WatchTarget::thread("g", 1);
        pool.obtain(&target, listener(1)).unwrap();
        pool.obtain(&target, listener(2)).unwrap();

        pool.release(&target, ListenerId(1)).unwrap();
        assert!(pool.get(&target).is_some());
        assert!(!pool.is_cached(&target));

        pool.release(&target, ListenerId(2)).unwrap();
        assert!(pool.get(&target).is_none());
        assert!(pool.is_cached(&target));
    }

    #[test]
    fn revived_watcher_keeps_its_state() {
        let d = RecordingDispatcher::default();
        let mut pool = pool(4);
        let target = WatchTarget::thread("g", 1);
        let id = pool.obtain(&target, listener(1)).unwrap();

        let w = pool.get_mut(&target).unwrap();
        for count in [3, 5] {
            assert!(w.poll(&d));
            let (_, seq, _) = d.last();
            w.complete(seq, success(thread_posts(count)), t0(), None);
        }
        let before = w.snapshot();
        let unseen = w.unseen();
        assert_eq!(unseen.posts.len(), 2);

        pool.release(&target, ListenerId(1)).unwrap();
        let revived = pool.obtain(&target, listener(2)).unwrap();
        assert_eq!(revived, id);

        let w = pool.get(&target).unwrap();
        assert_eq!(w.unseen(), unseen);
        assert_eq!(w.state().last_post_count(), before.last_post_count);
        assert_eq!(w.state().last_fetch(), before.last_fetch);
        assert!(!w.is_due(t0()), "no re-fetch is forced");
    }

    #[test]
    fn parking_cancels_the_in_flight_fetch() {
        let d = RecordingDispatcher::default();
        let mut pool = pool(4);
        let target = WatchTarget::thread("g", 1);
        pool.obtain(&target, listener(1)).unwrap();
        assert!(pool.get_mut(&target).unwrap().poll(&d));

        pool.release(&target, ListenerId(1)).unwrap();
        assert!(d.was_cancelled(0));

        pool.obtain(&target, listener(1)).unwrap();
        let (_, seq, _) = d.last();
        let w = pool.get_mut(&target).unwrap();
        assert!(!w.is_fetching());
        assert!(!w.complete(seq, FetchResult::failure(crate::source::FailureKind::Network, "late"), t0(), None));
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut pool = pool(2);
        let targets: Vec<WatchTarget> = (1..=3).map(|no| WatchTarget::thread("g", no)).collect();
        let mut ids = Vec::new();
        for (i, t) in targets.iter().enumerate() {
            ids.push(pool.obtain(t, listener(i as u64)).unwrap());
        }
        for (i, t) in targets.iter().enumerate() {
            pool.release(t, ListenerId(i as u64)).unwrap();
        }

        assert_eq!(pool.cached_len(), 2);
        assert!(!pool.is_cached(&targets[0]));
        assert!(pool.is_cached(&targets[1]));
        assert!(pool.is_cached(&targets[2]));

        let fresh = pool.obtain(&targets[0], listener(9)).unwrap();
        assert_ne!(fresh, ids[0], "evicted watcher is rebuilt from scratch");
    }

    #[test]
    fn release_without_obtain_fails() {
        let mut pool = pool(2);
        let target = WatchTarget::thread("g", 1);
        assert_eq!(
            pool.release(&target, ListenerId(1)),
            Err(PoolError::NotObtained {
                target: target.clone(),
                listener: ListenerId(1)
            })
        );
    }

    #[test]
    fn double_release_fails() {
        let mut pool = pool(2);
        let target = WatchTarget::thread("g", 1);
        pool.obtain(&target, listener(1)).unwrap();
        pool.obtain(&target, listener(2)).unwrap();
        pool.release(&target, ListenerId(1)).unwrap();
        assert!(matches!(
            pool.release(&target, ListenerId(1)),
            Err(PoolError::NotObtained { .. })
        ));

        pool.release(&target, ListenerId(2)).unwrap();
        assert!(pool.release(&target, ListenerId(2)).is_err(), "cached watchers cannot be released");
    }

    #[test]
    fn clear_destroys_everything() {
        let mut pool = pool(2);
        pool.obtain(&WatchTarget::thread("g", 1), listener(1)).unwrap();
        pool.obtain(&WatchTarget::thread("g", 2), listener(2)).unwrap();
        pool.release(&WatchTarget::thread("g", 2), ListenerId(2)).unwrap();

        pool.clear();
        assert_eq!(pool.live_len(), 0);
        assert_eq!(pool.cached_len(), 0);
    }
}
