//! # clusterdb — Paginated Record Cluster
//!
//! An embedded record container: variable-length binary records keyed by a
//! monotonically assigned logical position, stored in fixed-size slotted
//! pages with per-page free-space buckets, a position-map sidecar file, and
//! WAL-backed atomic operations for crash safety.
//!
//! ## Quick Start
//!
//! ```ignore
//! use clusterdb::{LocalStorage, PaginatedCluster};
//!
//! let storage = LocalStorage::open("./data")?;
//! let cluster = PaginatedCluster::configure(&storage, 0, "users")?;
//! cluster.create(0)?;
//!
//! let position = cluster.create_record(b"payload", 1, 0x0B, None)?;
//! let record = cluster.read_record(position.cluster_position, false)?.unwrap();
//! assert_eq!(record.content, b"payload");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  PaginatedCluster                       │  CRUD, chunk chains,
//! │    ├── ClusterPage (slotted pages)      │  free-space buckets
//! │    ├── ClusterStateHeader (page 0)      │
//! │    └── PositionMap (.cpm sidecar)       │
//! ├─────────────────────────────────────────┤
//! │  AtomicOperationsManager + journal      │  buffered mutations,
//! ├─────────────────────────────────────────┤  commit / rollback
//! │  PageCache (sharded, pinned)            │
//! ├─────────────────────────────────────────┤
//! │  FileRegistry ── PagedFile              │  positioned page I/O
//! └─────────────────────────────────────────┘
//! ```
//!
//! A record larger than one page slot is split into chunks chained by
//! packed `(page << 16) | slot` pointers; the position map publishes the
//! head chunk under the record's logical position. Every mutator runs in
//! one atomic operation: its page changes are buffered, journaled, and
//! written through on commit — or discarded wholesale on rollback.
//!
//! ## Module Overview
//!
//! - [`cluster`]: the paginated cluster and its on-disk structures
//! - [`storage`]: paged files, registry, page cache, journal, operations
//! - [`compression`] / [`encryption`]: byte-to-byte payload transforms
//! - [`stats`]: per-session CRUD timing
//! - [`config`]: page geometry and free-list constants

#[macro_use]
mod macros;

pub mod cluster;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod error;
pub mod stats;
pub mod storage;

pub use cluster::{
    ClusterAttribute, ClusterConfig, ClusterEntryIterator, ClusterStatus, PaginatedCluster,
    PhysicalPosition, RecordBuffer, RecordStatus,
};
pub use error::{ClusterError, RecordId, RecordNotFoundError};
pub use storage::LocalStorage;
