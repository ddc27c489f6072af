//! # Sharded Page Cache
//!
//! Read cache over the file registry with SIEVE eviction and 64-way lock
//! sharding. Every committed page read flows through here; writes do not —
//! mutations live in atomic-operation buffers until commit, which writes
//! pages through to the files and refreshes any cached copy. Entries are
//! therefore never dirty and eviction never does I/O.
//!
//! ## Why SIEVE Instead of LRU?
//!
//! A sequential scan over a large cluster would evict the entire cache under
//! LRU: every scanned page becomes the most recently used. SIEVE keeps a
//! "visited" flag per entry and an eviction hand instead:
//!
//! - On access: set the visited flag
//! - On eviction: entries with visited=true get a second chance (flag
//!   cleared, hand moves on); entries with visited=false are evicted
//!
//! Scan pages are touched once and fall out quickly; hot pages survive.
//!
//! ## Lock Sharding
//!
//! Pages are spread over independent shards, each behind its own `RwLock`:
//! `shard = (file_id * 31 + page_index) % CACHE_SHARD_COUNT`. Pin counts are
//! atomics, so pinning needs only a shard read lock.
//!
//! ## Pin Protocol
//!
//! [`PageRef`] pins its entry for its lifetime and unpins on drop; a pinned
//! entry is never evicted. Long-lived pins (the cluster state page) use
//! [`PageCache::pin`]/[`PageCache::unpin`] directly and survive across
//! operations.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::{CACHE_SHARD_COUNT, PAGE_SIZE};

use super::registry::FileRegistry;

/// Address of one page: file id plus page index within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: u64,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file_id: u64, page_index: u64) -> Self {
        Self { file_id, page_index }
    }
}

struct CacheEntry {
    key: PageKey,
    visited: AtomicBool,
    pin_count: AtomicU32,
    data: Box<[u8; PAGE_SIZE]>,
}

impl CacheEntry {
    fn new(key: PageKey) -> Self {
        Self {
            key,
            visited: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned page");
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<PageKey, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, key: &PageKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn evict(&mut self) -> Option<PageKey> {
        if self.entries.is_empty() {
            return None;
        }

        let start = self.hand;
        let mut wrapped_once = false;

        loop {
            let entry = &self.entries[self.hand];

            if entry.is_pinned() {
                self.hand = (self.hand + 1) % self.entries.len();
                if self.hand == start {
                    if wrapped_once {
                        return None;
                    }
                    wrapped_once = true;
                }
                continue;
            }

            if entry.clear_visited() {
                self.hand = (self.hand + 1) % self.entries.len();
                continue;
            }

            return Some(entry.key);
        }
    }

    fn remove(&mut self, idx: usize) {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.key);

        if idx < self.entries.len() {
            let moved_key = self.entries[idx].key;
            self.index.insert(moved_key, idx);
        }

        if self.hand >= self.entries.len() && !self.entries.is_empty() {
            self.hand = 0;
        }
    }

    fn insert(&mut self, entry: CacheEntry) -> usize {
        let key = entry.key;
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(key, idx);
        idx
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
    registry: Arc<FileRegistry>,
}

impl PageCache {
    pub fn new(registry: Arc<FileRegistry>, total_capacity: usize) -> Result<Self> {
        ensure!(
            total_capacity >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one page per shard)",
            total_capacity,
            CACHE_SHARD_COUNT
        );

        let capacity_per_shard = total_capacity / CACHE_SHARD_COUNT;
        let remainder = total_capacity % CACHE_SHARD_COUNT;

        let shards: Vec<_> = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder {
                    capacity_per_shard + 1
                } else {
                    capacity_per_shard
                };
                RwLock::new(CacheShard::new(cap))
            })
            .collect();

        Ok(Self { shards, registry })
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    fn shard_index(&self, key: &PageKey) -> usize {
        let hash = (key.file_id as usize)
            .wrapping_mul(31)
            .wrapping_add(key.page_index as usize);
        hash % CACHE_SHARD_COUNT
    }

    fn shard(&self, key: &PageKey) -> &RwLock<CacheShard> {
        &self.shards[self.shard_index(key)]
    }

    /// Loads a page (from cache or disk) and returns it pinned.
    pub fn load(&self, key: PageKey) -> Result<PageRef<'_>> {
        {
            let shard = self.shard(&key);
            let guard = shard.read();

            if let Some(idx) = guard.get(&key) {
                guard.entries[idx].pin();
                guard.entries[idx].mark_visited();
                return Ok(PageRef { cache: self, key });
            }
        }

        let shard = self.shard(&key);
        let mut guard = shard.write();

        if let Some(idx) = guard.get(&key) {
            guard.entries[idx].pin();
            guard.entries[idx].mark_visited();
            return Ok(PageRef { cache: self, key });
        }

        if guard.is_full() {
            match guard.evict() {
                Some(victim) => {
                    if let Some(idx) = guard.get(&victim) {
                        guard.remove(idx);
                    }
                }
                None => eyre::bail!(
                    "cache shard full and all pages pinned (capacity={})",
                    guard.capacity
                ),
            }
        }

        let mut entry = CacheEntry::new(key);
        self.registry
            .read_page_into(key.file_id, key.page_index, entry.data.as_mut_slice())?;
        entry.pin();
        entry.mark_visited();
        guard.insert(entry);

        Ok(PageRef { cache: self, key })
    }

    /// Best-effort read-ahead of the pages following `key`. Pages past the
    /// end of the file are silently skipped.
    pub fn prefetch(&self, key: PageKey, count: u32) {
        let Ok(page_count) = self.registry.page_count(key.file_id) else {
            return;
        };

        for i in 1..count as u64 {
            let page_index = key.page_index + i;
            if page_index >= page_count {
                break;
            }
            let _ = self.load(PageKey::new(key.file_id, page_index));
        }
    }

    /// Refreshes a cached copy after the page was written through to its
    /// file. No-op when the page is not cached.
    ///
    /// Callers must hold the exclusive lock of the component owning the
    /// page's file: no `PageRef` of that component may be alive while its
    /// bytes change.
    pub fn refresh(&self, key: &PageKey, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);

        let shard = self.shard(key);
        let guard = shard.read();

        if let Some(idx) = guard.get(key) {
            let entry = &guard.entries[idx];
            let ptr = entry.data.as_ptr() as *mut u8;
            // SAFETY: entry.data is a Box<[u8; PAGE_SIZE]>, valid for
            // PAGE_SIZE bytes. The committing component's exclusive lock
            // excludes every reader that could observe the entry, and shard
            // insertion/eviction is excluded by the shard read guard.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, PAGE_SIZE);
            }
        }
    }

    /// Pins a page until [`PageCache::unpin`]. Used for the cluster state
    /// page, which must never be evicted while the cluster is open.
    pub fn pin(&self, key: PageKey) -> Result<()> {
        let page = self.load(key)?;
        // transfer the load pin to the caller instead of dropping it
        std::mem::forget(page);
        Ok(())
    }

    pub fn unpin(&self, key: &PageKey) {
        let shard = self.shard(key);
        let guard = shard.read();

        if let Some(idx) = guard.get(key) {
            guard.entries[idx].unpin();
        }
    }

    /// Drops every cached page of a file. Called on delete/truncate/replace.
    pub fn drop_file(&self, file_id: u64) {
        for shard in &self.shards {
            let mut guard = shard.write();
            let stale: Vec<usize> = guard
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.key.file_id == file_id)
                .map(|(i, _)| i)
                .collect();

            for idx in stale.into_iter().rev() {
                guard.remove(idx);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pinned view of one cached page. Unpins on drop.
pub struct PageRef<'a> {
    cache: &'a PageCache,
    key: PageKey,
}

impl<'a> PageRef<'a> {
    pub fn key(&self) -> &PageKey {
        &self.key
    }

    pub fn data(&self) -> &[u8] {
        let shard = self.cache.shard(&self.key);
        let guard = shard.read();
        let idx = guard.get(&self.key).expect("pinned page missing from cache");
        let entry = &guard.entries[idx];
        let ptr = entry.data.as_ptr();
        // SAFETY: entry.data is a Box<[u8; PAGE_SIZE]> valid for PAGE_SIZE
        // bytes. The entry is pinned for the lifetime of this PageRef, so it
        // cannot be evicted, and shard vectors only swap_remove unpinned
        // entries — the box's heap allocation is stable.
        unsafe { std::slice::from_raw_parts(ptr, PAGE_SIZE) }
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, Arc<FileRegistry>, u64) {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new(dir.path()).unwrap());
        let file_id = registry.add_file("test.pcl").unwrap();
        (dir, registry, file_id)
    }

    fn write_marker_page(registry: &FileRegistry, file_id: u64, page: u64, marker: u8) {
        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = marker;
        registry.write_page(file_id, page, &data).unwrap();
    }

    #[test]
    fn load_reads_through_registry() {
        let (_dir, registry, file_id) = fixture();
        write_marker_page(&registry, file_id, 0, 0x5A);

        let cache = PageCache::new(Arc::clone(&registry), 64).unwrap();
        let page = cache.load(PageKey::new(file_id, 0)).unwrap();

        assert_eq!(page.data()[0], 0x5A);
        drop(page);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn load_of_missing_page_fails() {
        let (_dir, registry, file_id) = fixture();
        let cache = PageCache::new(registry, 64).unwrap();

        assert!(cache.load(PageKey::new(file_id, 3)).is_err());
    }

    #[test]
    fn refresh_updates_cached_copy() {
        let (_dir, registry, file_id) = fixture();
        write_marker_page(&registry, file_id, 0, 1);

        let cache = PageCache::new(Arc::clone(&registry), 64).unwrap();
        let key = PageKey::new(file_id, 0);
        drop(cache.load(key).unwrap());

        let mut new_data = vec![0u8; PAGE_SIZE];
        new_data[0] = 2;
        cache.refresh(&key, &new_data);

        assert_eq!(cache.load(key).unwrap().data()[0], 2);
    }

    #[test]
    fn pinned_page_survives_eviction_pressure() {
        let (_dir, registry, file_id) = fixture();
        for page in 0..80 {
            write_marker_page(&registry, file_id, page, page as u8);
        }

        // capacity of exactly one page per shard forces constant eviction
        let cache = PageCache::new(Arc::clone(&registry), CACHE_SHARD_COUNT).unwrap();
        let pinned_key = PageKey::new(file_id, 0);
        cache.pin(pinned_key).unwrap();

        for page in 1..80 {
            let _ = cache.load(PageKey::new(file_id, page));
        }

        let page = cache.load(pinned_key).unwrap();
        assert_eq!(page.data()[0], 0);
        drop(page);
        cache.unpin(&pinned_key);
    }

    #[test]
    fn drop_file_discards_cached_pages() {
        let (_dir, registry, file_id) = fixture();
        write_marker_page(&registry, file_id, 0, 9);

        let cache = PageCache::new(Arc::clone(&registry), 64).unwrap();
        drop(cache.load(PageKey::new(file_id, 0)).unwrap());
        assert_eq!(cache.len(), 1);

        cache.drop_file(file_id);
        assert!(cache.is_empty());
    }
}
