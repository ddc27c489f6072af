//! # Storage Module
//!
//! Foundational storage layer: paged files, the file registry, the shared
//! page cache, the commit journal and the atomic-operations manager. The
//! cluster layer above consumes these through narrow interfaces — file ids,
//! page keys, operation handles — and never touches paths or raw files.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   PaginatedCluster / PositionMap          │
//! ├───────────────────────────────────────────┤
//! │   AtomicOperationsManager                 │  COW page buffers,
//! │     └── CommitJournal (journal.wal)       │  commit visibility
//! ├───────────────────────────────────────────┤
//! │   PageCache (sharded, pinned, SIEVE)      │  committed-state reads
//! ├───────────────────────────────────────────┤
//! │   FileRegistry ── PagedFile (per file)    │  positioned page I/O
//! └───────────────────────────────────────────┘
//! ```
//!
//! Mutations never touch the cache or the files directly: they are buffered
//! per atomic operation, journaled, and written through on commit. Reads go
//! through the cache, which loads from the registry's files on miss.
//!
//! ## Module Organization
//!
//! - `file_store`: positioned page I/O over one file (`PagedFile`)
//! - `registry`: file lifecycle and name↔id mapping (`FileRegistry`)
//! - `cache`: sharded pinned page cache (`PageCache`, `PageRef`)
//! - `wal`: commit journal with CRC64 frames (`CommitJournal`)
//! - `atomic`: operations and their manager (`AtomicOperation`,
//!   `AtomicOperationsManager`)
//! - `local`: `LocalStorage`, the wiring plus the cluster config root

mod atomic;
mod cache;
mod file_store;
mod local;
mod registry;
mod wal;

pub use atomic::{
    AtomicOperation, AtomicOperationsManager, OperationMetadata, PageView,
    RecordOperationMetadata, RID_METADATA_KEY,
};
pub use cache::{PageCache, PageKey, PageRef};
pub use file_store::PagedFile;
pub use local::LocalStorage;
pub use registry::FileRegistry;
pub use wal::{CommitJournal, FrameHeader, JOURNAL_FILE_NAME};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
