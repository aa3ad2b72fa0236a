//! # Node Cache
//!
//! Unlinked nodes are not freed on the spot: a concurrent walker of a
//! neighbouring range may still be reading them. Walkers hand every node
//! they unlink to [`NodeCache::retire`], which defers it through an epoch
//! [`Collector`] owned by the cache. Once every walker that could have
//! seen the node has unpinned, the whole batch is returned to a per-worker
//! frame list and reused by the next allocation on that worker.
//!
//! ```text
//!  walker ── unlink ──► RetireBatch ── defer ──► grace period ──► shard[worker]
//!                                                                     │
//!  walker ◄─────────────────────── acquire ◄──────────────────────────┘
//!                                     │ (empty)
//!                                     └──► PageProvider::alloc_node
//! ```
//!
//! Shards are bounded; overflow and everything left when the cache drops go
//! back to the [`PageProvider`].

use crate::node::PageTableNode;
use crate::provider::{EntryTable, NodeFrame, PageProvider, PageProviderError};
use crossbeam_epoch::{Collector, Guard, LocalHandle, Owned, Shared};
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use gpu_memory_addresses::{DeviceAddress, PhysicalPage, Size4K};
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A node frame together with the device address it is mapped at.
#[derive(Debug)]
pub(crate) struct MappedFrame {
    frame: NodeFrame,
    dma: DeviceAddress,
}

impl MappedFrame {
    pub(crate) const fn new(frame: NodeFrame, dma: DeviceAddress) -> Self {
        Self { frame, dma }
    }

    #[inline]
    pub(crate) const fn dma(&self) -> DeviceAddress {
        self.dma
    }

    #[inline]
    pub(crate) const fn page(&self) -> PhysicalPage<Size4K> {
        self.frame.page()
    }

    #[inline]
    pub(crate) fn table(&self) -> &EntryTable {
        self.frame.table()
    }

    pub(crate) fn into_parts(self) -> (NodeFrame, DeviceAddress) {
        (self.frame, self.dma)
    }
}

/// Sizing of a [`NodeCache`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeCacheConfig {
    /// Number of per-worker frame lists; `0` disables caching.
    pub shards: usize,
    /// Frames kept per list before overflow goes back to the provider.
    pub per_shard_capacity: usize,
}

impl NodeCacheConfig {
    /// One list per available CPU, 64 frames each.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: std::thread::available_parallelism().map_or(4, NonZeroUsize::get),
            per_shard_capacity: 64,
        }
    }

    /// Every reclaimed frame goes straight back to the provider.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            shards: 0,
            per_shard_capacity: 0,
        }
    }
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time counters of a [`NodeCache`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Frames obtained from the provider.
    pub allocated: u64,
    /// Allocations served from a frame list.
    pub reused: u64,
    /// Nodes dropped before they were ever linked (lost publication races).
    pub discarded: u64,
    /// Nodes unlinked from a tree and handed to deferred reclamation.
    pub retired: u64,
    /// Retired nodes whose grace period ended.
    pub reclaimed: u64,
    /// Frames handed back to the provider.
    pub released: u64,
    /// Frames currently held in frame lists.
    pub cached: usize,
}

#[derive(Default)]
struct Counters {
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    retired: AtomicU64,
    reclaimed: AtomicU64,
    released: AtomicU64,
}

static NEXT_WORKER: AtomicUsize = AtomicUsize::new(0);

/// Upper bound on collection rounds when a cache drops.
const DRAIN_ROUNDS: usize = 1024;

thread_local! {
    static WORKER: usize = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);

    /// This thread's registration with each live cache's collector, keyed
    /// by the cache's frame pool.
    static HANDLES: RefCell<Vec<(Weak<FramePool>, LocalHandle)>> = const { RefCell::new(Vec::new()) };
}

/// Frame lists shared by a cache and its pending deferred reclamations.
pub(crate) struct FramePool {
    shards: Box<[CachePadded<ArrayQueue<MappedFrame>>]>,
    provider: Arc<dyn PageProvider>,
    counters: Counters,
}

impl FramePool {
    fn home(&self) -> usize {
        WORKER.with(|w| *w) % self.shards.len()
    }

    fn take(&self) -> Option<MappedFrame> {
        if self.shards.is_empty() {
            return None;
        }
        let home = self.home();
        (0..self.shards.len())
            .map(|i| (home + i) % self.shards.len())
            .find_map(|i| self.shards[i].pop())
    }

    /// Keeps `frame` for reuse, or releases it if the worker's list is full.
    pub(crate) fn put(&self, frame: MappedFrame) {
        if self.shards.is_empty() {
            self.release(frame);
            return;
        }
        if let Err(frame) = self.shards[self.home()].push(frame) {
            self.release(frame);
        }
    }

    fn release(&self, frame: MappedFrame) {
        let (frame, dma) = frame.into_parts();
        self.provider.unmap_for_device(&frame, dma);
        self.provider.free_node(frame);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }

    fn reclaim(&self, batch: RetireBatch) {
        let n = batch.nodes.len() as u64;
        for node in batch.nodes {
            // SAFETY: the node was unlinked before it was retired and the
            // grace period ended, so no walker holds a reference anymore.
            let node = unsafe { Owned::from_raw(node.0) }.into_box();
            self.put(node.into_frame());
        }
        self.counters.reclaimed.fetch_add(n, Ordering::Relaxed);
        log::trace!("reclaimed {n} retired nodes");
    }

    fn drain(&self) -> usize {
        let mut drained = 0;
        for shard in &self.shards {
            while let Some(frame) = shard.pop() {
                self.release(frame);
                drained += 1;
            }
        }
        drained
    }

    fn cached(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let drained = self.drain();
        if drained > 0 {
            log::debug!("released {drained} cached node frames");
        }
    }
}

struct RetiredNode(*mut PageTableNode);

// SAFETY: a retired node is unreachable from any tree; the pointer is only
// dereferenced once, by the reclamation that owns the batch.
unsafe impl Send for RetiredNode {}

/// Nodes a single walk unlinked, retired together when the walk ends.
#[derive(Default)]
pub(crate) struct RetireBatch {
    nodes: Vec<RetiredNode>,
}

impl RetireBatch {
    pub(crate) fn push(&mut self, node: Shared<'_, PageTableNode>) {
        debug_assert!(!node.is_null());
        self.nodes.push(RetiredNode(node.as_raw().cast_mut()));
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Shared source of table nodes for any number of address spaces.
pub struct NodeCache {
    pool: Arc<FramePool>,
    collector: Collector,
}

impl NodeCache {
    pub fn new(provider: Arc<dyn PageProvider>, config: NodeCacheConfig) -> Self {
        let shards = if config.per_shard_capacity == 0 {
            0
        } else {
            config.shards
        };
        let shards = (0..shards)
            .map(|_| CachePadded::new(ArrayQueue::new(config.per_shard_capacity)))
            .collect();
        Self {
            pool: Arc::new(FramePool {
                shards,
                provider,
                counters: Counters::default(),
            }),
            collector: Collector::new(),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn PageProvider> {
        &self.pool.provider
    }

    /// Pins the calling thread for the duration of one walk.
    ///
    /// A thread registers with the collector once per cache and keeps the
    /// handle for later walks. During thread teardown it falls back to a
    /// throwaway registration.
    pub(crate) fn pin(&self) -> Guard {
        HANDLES
            .try_with(|handles| {
                let mut handles = handles.borrow_mut();
                handles.retain(|(pool, _)| pool.strong_count() > 0);
                if let Some((_, handle)) = handles.iter().find(|(pool, _)| self.owns(pool)) {
                    return handle.pin();
                }
                let handle = self.collector.register();
                let guard = handle.pin();
                handles.push((Arc::downgrade(&self.pool), handle));
                guard
            })
            .unwrap_or_else(|_| self.collector.register().pin())
    }

    fn owns(&self, pool: &Weak<FramePool>) -> bool {
        core::ptr::eq(pool.as_ptr(), Arc::as_ptr(&self.pool))
    }

    pub(crate) fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// A frame mapped for the device, reused when possible.
    pub(crate) fn acquire(&self) -> Result<MappedFrame, PageProviderError> {
        if let Some(frame) = self.pool.take() {
            self.pool.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }
        let provider = &self.pool.provider;
        let frame = provider.alloc_node()?;
        match provider.map_for_device(&frame) {
            Ok(dma) => {
                self.pool.counters.allocated.fetch_add(1, Ordering::Relaxed);
                Ok(MappedFrame::new(frame, dma))
            }
            Err(err) => {
                provider.free_node(frame);
                Err(err)
            }
        }
    }

    /// Takes back a node that was never linked into a tree.
    pub(crate) fn discard(&self, node: Owned<PageTableNode>) {
        self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
        self.pool.put(node.into_box().into_frame());
    }

    /// Takes back a frame the caller owns exclusively.
    pub(crate) fn recycle(&self, frame: MappedFrame) {
        self.pool.put(frame);
    }

    /// Defers reclamation of unlinked nodes until no walker pinned at or
    /// before `guard` can still reach them.
    pub(crate) fn retire(&self, batch: RetireBatch, guard: &Guard) {
        if batch.is_empty() {
            return;
        }
        let n = batch.len() as u64;
        self.pool.counters.retired.fetch_add(n, Ordering::Relaxed);
        let pool = Arc::clone(&self.pool);
        guard.defer(move || pool.reclaim(batch));
        guard.flush();
    }

    /// Nudges deferred reclamation forward. Best effort: batches retired
    /// while other walkers are pinned stay pending.
    pub fn flush(&self) {
        for _ in 0..3 {
            self.pin().flush();
        }
    }

    /// Releases every cached frame to the provider and returns how many.
    pub fn drain(&self) -> usize {
        self.pool.drain()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.pool.counters;
        CacheStats {
            allocated: c.allocated.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            retired: c.retired.load(Ordering::Relaxed),
            reclaimed: c.reclaimed.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            cached: self.pool.cached(),
        }
    }
}

impl Drop for NodeCache {
    fn drop(&mut self) {
        // Registered handles keep the collector alive past this point, so
        // pending batches have to be collected here.
        let counters = &self.pool.counters;
        let mut rounds = 0;
        while counters.reclaimed.load(Ordering::Acquire) < counters.retired.load(Ordering::Acquire) {
            if rounds == DRAIN_ROUNDS {
                log::warn!(
                    "{} retired nodes still pending as the node cache drops",
                    counters
                        .retired
                        .load(Ordering::Relaxed)
                        .saturating_sub(counters.reclaimed.load(Ordering::Relaxed))
                );
                break;
            }
            self.pin().flush();
            rounds += 1;
        }
        let _ = HANDLES.try_with(|handles| {
            handles.borrow_mut().retain(|(pool, _)| !self.owns(pool));
        });
    }
}

impl core::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeCache")
            .field("shards", &self.pool.shards.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Level;
    use crate::provider::HeapPageProvider;
    use std::thread;

    fn cache(config: NodeCacheConfig) -> (Arc<HeapPageProvider>, NodeCache) {
        let provider = Arc::new(HeapPageProvider::new());
        let cache = NodeCache::new(provider.clone(), config);
        (provider, cache)
    }

    #[test]
    fn recycled_frames_are_reused() {
        let (provider, cache) = cache(NodeCacheConfig {
            shards: 2,
            per_shard_capacity: 4,
        });
        let frame = cache.acquire().unwrap();
        let page = frame.page();
        cache.recycle(frame);
        let again = cache.acquire().unwrap();
        assert_eq!(again.page(), page);
        cache.recycle(again);

        let stats = cache.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.cached, 1);

        drop(cache);
        assert_eq!(provider.live(), 0);
        assert_eq!(provider.mapped(), 0);
    }

    #[test]
    fn overflow_goes_to_provider() {
        let (provider, cache) = cache(NodeCacheConfig {
            shards: 1,
            per_shard_capacity: 1,
        });
        let a = cache.acquire().unwrap();
        let b = cache.acquire().unwrap();
        cache.recycle(a);
        cache.recycle(b);
        assert_eq!(provider.live(), 1);
        assert_eq!(cache.drain(), 1);
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn disabled_cache_never_holds_frames() {
        let (provider, cache) = cache(NodeCacheConfig::disabled());
        let a = cache.acquire().unwrap();
        cache.recycle(a);
        assert_eq!(cache.stats().cached, 0);
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn failed_device_map_returns_the_frame() {
        let (provider, cache) = cache(NodeCacheConfig::new());
        provider.fail_device_map(true);
        assert_eq!(
            cache.acquire().unwrap_err(),
            PageProviderError::DeviceMapFailed
        );
        assert_eq!(provider.live(), 0);
    }

    fn registrations() -> usize {
        HANDLES.with(|handles| {
            handles
                .borrow()
                .iter()
                .filter(|(pool, _)| pool.strong_count() > 0)
                .count()
        })
    }

    #[test]
    fn a_thread_registers_once_per_cache() {
        let (_provider, a) = cache(NodeCacheConfig::new());
        let (_provider, b) = cache(NodeCacheConfig::new());
        for _ in 0..100 {
            drop(a.pin());
            let outer = b.pin();
            drop(b.pin());
            drop(outer);
        }
        assert_eq!(registrations(), 2);

        drop(a);
        assert_eq!(registrations(), 1);
        thread::spawn(move || {
            drop(b.pin());
            assert_eq!(registrations(), 1);
        })
        .join()
        .unwrap();
        assert_eq!(registrations(), 0);
    }

    #[test]
    fn retirements_from_other_threads_drain_on_drop() {
        let (provider, cache) = cache(NodeCacheConfig::new());
        let cache = Arc::new(cache);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let guard = cache.pin();
                    let frame = cache.acquire().unwrap();
                    let node = Owned::new(PageTableNode::new(frame, Level::LEAF, 0, 0, false));
                    let mut batch = RetireBatch::default();
                    batch.push(node.into_shared(&guard));
                    cache.retire(batch, &guard);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        // Keep this thread registered while the cache drops.
        drop(cache.pin());
        let cache = Arc::into_inner(cache).unwrap();
        assert_eq!(cache.stats().retired, 4);
        drop(cache);
        assert_eq!(provider.live(), 0);
        assert_eq!(provider.allocated(), provider.freed());
    }

    #[test]
    fn retired_nodes_are_reclaimed_by_the_time_the_cache_drops() {
        let (provider, cache) = cache(NodeCacheConfig::new());
        {
            let guard = cache.pin();
            let mut batch = RetireBatch::default();
            for _ in 0..3 {
                let frame = cache.acquire().unwrap();
                let node = Owned::new(PageTableNode::new(frame, Level::LEAF, 0, 0, false));
                batch.push(node.into_shared(&guard));
            }
            cache.retire(batch, &guard);
        }
        assert_eq!(cache.stats().retired, 3);
        drop(cache);
        assert_eq!(provider.live(), 0);
        assert_eq!(provider.allocated(), provider.freed());
    }
}
