//! # Configuration Constants
//!
//! This module centralizes the geometry of the on-disk format. Constants that
//! depend on each other are co-located and pinned with compile-time
//! assertions so a change in one cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (65536 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32 bytes, cluster page header)
//!       │
//!       ├─> MAX_ENTRY_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │
//!       ├─> MAX_RECORD_SIZE (derived: MAX_ENTRY_SIZE - SLOT_SIZE)
//!       │     Largest chunk a single page slot can hold. Records above
//!       │     this are chained across pages.
//!       │
//!       └─> FREE_LIST_SIZE (derived: PAGE_SIZE/1KiB - LOWEST_FREELIST_BOUNDARY)
//!             One doubly linked list of pages per free-space kilobyte
//!             bucket; the last bucket is reserved for empty pages.
//! ```
//!
//! ## Free-List Buckets
//!
//! A page's bucket is `(max_record_size - (ONE_KB - 1)) / ONE_KB -
//! LOWEST_FREELIST_BOUNDARY`; empty pages go into `FREE_LIST_SIZE - 1`.
//! Pages with less than `LOWEST_FREELIST_BOUNDARY` KiB of contiguous room
//! produce a negative bucket and are kept off every list — they are too full
//! to be worth finding.

/// Size of every page, in both the data file and the position-map file.
/// Fixed at build time; files written with a different geometry are invalid.
pub const PAGE_SIZE: usize = 65536;

/// Size of the cluster page header (free pointers, slot count, list links).
pub const PAGE_HEADER_SIZE: usize = 32;

/// Size of one slot directory entry: offset, length + deleted flag, version.
pub const SLOT_SIZE: usize = 12;

/// Largest byte span the record content area of one page can hold.
pub const MAX_ENTRY_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Largest single chunk that fits in one page slot, directory entry included.
pub const MAX_RECORD_SIZE: usize = MAX_ENTRY_SIZE - SLOT_SIZE;

pub const ONE_KB: usize = 1024;

/// Pages whose largest appendable chunk is below this many KiB are not worth
/// tracking on any free list.
pub const LOWEST_FREELIST_BOUNDARY: usize = 16;

/// Number of free-space buckets; the last one holds empty pages.
pub const FREE_LIST_SIZE: usize = PAGE_SIZE / ONE_KB - LOWEST_FREELIST_BOUNDARY;

const _: () = assert!(MAX_ENTRY_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE);
const _: () = assert!(MAX_RECORD_SIZE < MAX_ENTRY_SIZE);
const _: () = assert!(
    FREE_LIST_SIZE > 1,
    "need at least one sized bucket plus the empty-page bucket"
);
const _: () = assert!(PAGE_SIZE - 1 <= u32::MAX as usize, "slot offsets are stored as u32");

// ============================================================================
// SHARDING
// ============================================================================

/// Number of shards in the page cache. Higher values reduce lock contention
/// at the cost of per-shard bookkeeping.
pub const CACHE_SHARD_COUNT: usize = 64;

/// Default number of cached pages across all shards.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

// ============================================================================
// READ-AHEAD
// ============================================================================

/// Pages prefetched by `read_record` when the caller signals a sequential
/// scan. Forwarded to the cache as a hint; never affects semantics.
pub const SCAN_PREFETCH_PAGES: u32 = 20;
