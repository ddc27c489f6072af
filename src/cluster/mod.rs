//! # Paginated Record Cluster
//!
//! One logical record container backed by two files: a data file
//! (`<name>.pcl`) of fixed-size slotted pages and a position-map sidecar
//! (`<name>.cpm`) translating stable logical positions to `(page, slot)`
//! locations. Records are opaque byte payloads; a payload larger than one
//! page slot is chained across pages, each chunk ending in a packed pointer
//! to the next.
//!
//! ## Chunk Format
//!
//! ```text
//! Offset   Size  Field
//! ------   ----  -----------------------------------------
//! 0        1     record type          (head chunk only)
//! 1        4     declared payload len (head chunk only)
//! ...      N     payload bytes of this chunk
//! end-9    1     head flag: 1 head, 0 continuation
//! end-8    8     packed pointer to the next chunk, or -1
//! ```
//!
//! The packed pointer is `(page_index << 16) | slot`; all ones terminates a
//! chain, so slot ids must stay below 2^16.
//!
//! ## Free-Space Buckets
//!
//! Every page is classified by its largest appendable chunk into one of
//! `FREE_LIST_SIZE` kilobyte buckets; each bucket heads a doubly linked list
//! of pages threaded through the pages' prev/next fields, with the heads
//! stored on the pinned state page. Placement scans buckets upward from the
//! requested size; a page found on the wrong list is re-bucketed on the spot
//! and the scan retries — the free list self-heals instead of asserting.
//!
//! ## Durability and Locking
//!
//! Every mutator runs inside one atomic operation: all page changes are
//! buffered, journaled, and applied on commit or discarded on rollback, with
//! the rollback decision tied to the method's `Result` in exactly one place.
//! Mutators hold the cluster's exclusive lock for the whole operation;
//! readers hold the manager's per-component lock plus the cluster's shared
//! lock and see only committed state.

pub mod config;
pub mod conflict;
mod iter;
mod page;
mod position_map;
mod state;

pub use config::{ClusterAttribute, ClusterConfig, ClusterStatus};
pub use iter::ClusterEntryIterator;
pub use page::ClusterPage;
pub use position_map::{PositionEntry, PositionMap};
pub use state::ClusterStateHeader;

use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Report, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{error, warn};

use crate::compression::{compression_by_name, Compression};
use crate::config::{
    FREE_LIST_SIZE, LOWEST_FREELIST_BOUNDARY, MAX_RECORD_SIZE, ONE_KB, PAGE_HEADER_SIZE, PAGE_SIZE,
    SCAN_PREFETCH_PAGES, SLOT_SIZE,
};
use crate::encryption::{encryption_by_name, Encryption};
use crate::error::{ClusterError, RecordId, RecordNotFoundError};
use crate::stats::ClusterOperationKind;
use crate::storage::{AtomicOperation, LocalStorage, PageKey, PageRef};

use conflict::RecordConflictStrategy;
use config::{check_valid_name, parse_grow_factor};

/// Framing bytes of a head chunk: type + declared length + flag + pointer.
pub const HEAD_ENTRY_OVERHEAD: usize = 14;

/// Trailing bytes every chunk carries: flag + pointer.
pub const CHUNK_TAIL_SIZE: usize = 9;

/// Page index of the pinned cluster state page.
const STATE_PAGE_INDEX: u64 = 0;

const PAGE_INDEX_OFFSET: u32 = 16;
const RECORD_POSITION_MASK: u64 = 0xFFFF;

// chain pointers reserve 16 bits for the slot; the directory can never
// outgrow them
const _: () = assert!((PAGE_SIZE - PAGE_HEADER_SIZE) / SLOT_SIZE <= RECORD_POSITION_MASK as usize);

fn create_page_pointer(page_index: u64, record_position: u32) -> i64 {
    ((page_index << PAGE_INDEX_OFFSET) | (record_position as u64 & RECORD_POSITION_MASK)) as i64
}

fn pointer_page_index(pointer: i64) -> u64 {
    (pointer as u64) >> PAGE_INDEX_OFFSET
}

fn pointer_record_position(pointer: i64) -> u32 {
    ((pointer as u64) & RECORD_POSITION_MASK) as u32
}

fn calculate_free_page_index<B: AsRef<[u8]>>(page: &ClusterPage<B>) -> i32 {
    if page.is_empty() {
        (FREE_LIST_SIZE - 1) as i32
    } else {
        ((page.get_max_record_size() as i64 - (ONE_KB as i64 - 1)) / ONE_KB as i64) as i32
            - LOWEST_FREELIST_BOUNDARY as i32
    }
}

/// Location and metadata of one stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPosition {
    pub cluster_position: i64,
    pub record_type: u8,
    pub record_size: i32,
    pub record_version: i32,
}

impl PhysicalPosition {
    fn new(record_type: u8, cluster_position: i64, record_version: i32) -> Self {
        Self {
            cluster_position,
            record_type,
            record_size: -1,
            record_version,
        }
    }
}

/// A record read back from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBuffer {
    pub content: Vec<u8>,
    pub version: i32,
    pub record_type: u8,
}

/// Lifecycle status of a logical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    NotExistent,
    Present,
    Allocated,
    Removed,
}

/// Per-chunk view returned by [`PaginatedCluster::read_debug`].
#[derive(Debug, Clone)]
pub struct ClusterPageDebug {
    pub page_index: u64,
    pub in_page_position: u32,
    pub in_page_size: usize,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct PaginatedClusterDebug {
    pub cluster_position: i64,
    pub file_id: u64,
    pub empty: bool,
    pub content_size: usize,
    pub pages: Vec<ClusterPageDebug>,
}

struct AddEntryResult {
    page_index: u64,
    page_position: u32,
    record_version: i32,
    records_size_diff: i64,
}

struct FindFreePageResult {
    page_index: u64,
    /// Bucket the page was taken from; `FREE_LIST_SIZE` means a fresh page
    /// past the filled bound.
    free_page_index: i32,
}

struct ClusterInner {
    config: ClusterConfig,
    compression: Arc<dyn Compression>,
    encryption: Arc<dyn Encryption>,
    conflict_strategy: Option<Arc<dyn RecordConflictStrategy>>,
    position_map: PositionMap,
    file_id: Option<u64>,
}

impl ClusterInner {
    fn file_id(&self) -> Result<u64> {
        self.file_id
            .ok_or_else(|| eyre::eyre!("cluster '{}' is not open", self.config.name))
    }
}

pub struct PaginatedCluster {
    storage: Arc<LocalStorage>,
    atomic_lock: Arc<RwLock<()>>,
    state: RwLock<ClusterInner>,
}

impl PaginatedCluster {
    // ------------------------------------------------------------------
    // configuration
    // ------------------------------------------------------------------

    /// Builds a cluster descriptor for a new cluster. Touches no files.
    pub fn configure(storage: &Arc<LocalStorage>, id: i32, name: &str) -> Result<Self> {
        Self::configure_with_config(storage, ClusterConfig::new(id, name))
    }

    /// Builds a cluster from a persisted configuration. Touches no files.
    pub fn configure_with_config(storage: &Arc<LocalStorage>, config: ClusterConfig) -> Result<Self> {
        check_valid_name(&config.name)?;

        let compression = compression_by_name(&config.compression)?;
        let encryption = encryption_by_name(&config.encryption, config.encryption_key.as_deref())?;
        let conflict_strategy = match &config.conflict_strategy {
            Some(name) => Some(storage.conflict_strategies().strategy(name)?),
            None => None,
        };

        let position_map = PositionMap::new(
            Arc::clone(storage.cache()),
            config.position_map_file_name(),
        );
        let atomic_lock = storage.atomics().component_lock(&config.data_file_name());

        Ok(Self {
            storage: Arc::clone(storage),
            atomic_lock,
            state: RwLock::new(ClusterInner {
                config,
                compression,
                encryption,
                conflict_strategy,
                position_map,
                file_id: None,
            }),
        })
    }

    pub fn get_id(&self) -> i32 {
        self.state.read().config.id
    }

    pub fn get_name(&self) -> String {
        self.state.read().config.name.clone()
    }

    pub fn get_file_id(&self) -> Result<u64> {
        self.state.read().file_id()
    }

    pub fn get_file_name(&self) -> Result<String> {
        let inner = self.state.read();
        let file_id = inner.file_id()?;
        self.storage
            .registry()
            .file_name_by_id(file_id)
            .ok_or_else(|| eyre::eyre!("file id {} is not registered", file_id))
    }

    pub fn compression(&self) -> String {
        self.state.read().config.compression.clone()
    }

    pub fn encryption(&self) -> String {
        self.state.read().config.encryption.clone()
    }

    pub fn record_grow_factor(&self) -> f32 {
        self.state.read().config.record_grow_factor
    }

    pub fn record_overflow_grow_factor(&self) -> f32 {
        self.state.read().config.record_overflow_grow_factor
    }

    pub fn get_record_conflict_strategy(&self) -> Option<Arc<dyn RecordConflictStrategy>> {
        self.state.read().conflict_strategy.clone()
    }

    /// Whether the data file of this cluster exists on disk.
    pub fn exists(&self) -> bool {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        self.storage.registry().exists(&inner.config.data_file_name())
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Allocates the data file, installs and pins the state page, and
    /// creates the position-map file.
    pub fn create(&self, _start_size: u32) -> Result<()> {
        let mut op = self.storage.atomics().begin();
        let _component = self.atomic_lock.write();
        let mut inner = self.state.write();
        let name = inner.config.name.clone();

        let result = (|| -> Result<()> {
            let file_id = self
                .storage
                .registry()
                .add_file(&inner.config.data_file_name())?;
            inner.file_id = Some(file_id);

            self.init_cluster_state(&inner, &mut op)?;
            self.storage.store_cluster_config(inner.config.clone());
            inner.position_map.create()?;
            Ok(())
        })();

        let result = self.finish(&name, op, result, "Error during creation of cluster");
        if result.is_ok() {
            let file_id = inner.file_id()?;
            self.storage
                .cache()
                .pin(PageKey::new(file_id, STATE_PAGE_INDEX))?;
        }
        result
    }

    /// Opens both files and re-pins the state page.
    pub fn open(&self) -> Result<()> {
        let _component = self.atomic_lock.write();
        let mut inner = self.state.write();

        let file_id = self
            .storage
            .registry()
            .open_file(&inner.config.data_file_name())?;
        inner.file_id = Some(file_id);

        let state_key = PageKey::new(file_id, STATE_PAGE_INDEX);
        {
            let page = self.storage.cache().load(state_key)?;
            ClusterStateHeader::from_page(page.data())?;
        }
        self.storage.cache().pin(state_key)?;

        inner.position_map.open()?;
        self.storage.store_cluster_config(inner.config.clone());
        Ok(())
    }

    pub fn close(&self, flush: bool) -> Result<()> {
        let _component = self.atomic_lock.write();
        let mut inner = self.state.write();

        if let Some(file_id) = inner.file_id {
            if flush {
                self.storage.registry().flush(file_id)?;
            }
            let state_key = PageKey::new(file_id, STATE_PAGE_INDEX);
            self.storage.cache().unpin(&state_key);
            self.storage.cache().drop_file(file_id);
        }
        inner.position_map.close(flush)?;
        inner.file_id = None;
        Ok(())
    }

    /// Deletes both files.
    pub fn delete(&self) -> Result<()> {
        let op = self.storage.atomics().begin();
        let _component = self.atomic_lock.write();
        let mut inner = self.state.write();
        let name = inner.config.name.clone();

        let result = (|| -> Result<()> {
            let file_id = inner.file_id()?;
            self.storage
                .cache()
                .unpin(&PageKey::new(file_id, STATE_PAGE_INDEX));
            self.storage.cache().drop_file(file_id);
            self.storage.registry().delete_file(file_id)?;
            inner.file_id = None;

            inner.position_map.delete()?;
            Ok(())
        })();

        self.finish(&name, op, result, "Error during deletion of cluster")
    }

    /// Drops every record and resets the counters; positions restart at 0.
    pub fn truncate(&self) -> Result<()> {
        let mut op = self.storage.atomics().begin();
        let _component = self.atomic_lock.write();
        let inner = self.state.write();
        let name = inner.config.name.clone();

        let result = (|| -> Result<()> {
            let file_id = inner.file_id()?;
            let state_key = PageKey::new(file_id, STATE_PAGE_INDEX);

            op.forget_file(file_id);
            self.storage.cache().unpin(&state_key);
            self.storage.cache().drop_file(file_id);
            self.storage.registry().truncate_file(file_id)?;

            inner.position_map.truncate(&mut op)?;
            self.init_cluster_state(&inner, &mut op)?;
            Ok(())
        })();

        let result = self.finish(&name, op, result, "Error during cluster truncate");
        if result.is_ok() {
            let file_id = inner.file_id()?;
            self.storage
                .cache()
                .pin(PageKey::new(file_id, STATE_PAGE_INDEX))?;
        }
        result
    }

    /// Flushes both files to disk.
    pub fn synch(&self) -> Result<()> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();

        self.storage.registry().flush(inner.file_id()?)?;
        inner.position_map.flush()
    }

    /// Swaps the data file content with a staged file, atomically from the
    /// point of view of other threads.
    pub fn replace_file(&self, source: &Path) -> Result<()> {
        let _component = self.atomic_lock.write();
        let mut inner = self.state.write();

        let old_file_id = inner.file_id()?;
        let full_name = inner.config.data_file_name();
        let temp_name = format!(
            "{}$temp",
            source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| full_name.clone())
        );

        let registry = self.storage.registry();
        let temp_id = registry.add_file(&temp_name)?;
        let result = (|| -> Result<()> {
            registry.replace_file_content_with(temp_id, source)?;

            self.storage
                .cache()
                .unpin(&PageKey::new(old_file_id, STATE_PAGE_INDEX));
            self.storage.cache().drop_file(old_file_id);
            registry.delete_file(old_file_id)?;
            registry.rename_file(temp_id, &full_name)?;
            inner.file_id = Some(temp_id);
            self.storage
                .cache()
                .pin(PageKey::new(temp_id, STATE_PAGE_INDEX))?;
            Ok(())
        })();

        if result.is_err() {
            // wipe the staged file when the swap never happened
            if registry.file_name_by_id(temp_id).as_deref() == Some(temp_name.as_str()) {
                let _ = registry.delete_file(temp_id);
            }
        }
        result
    }

    /// Swaps the position-map file content with a staged file.
    pub fn replace_cluster_map_file(&self, source: &Path) -> Result<()> {
        let _component = self.atomic_lock.write();
        let mut inner = self.state.write();

        let full_name = inner.position_map.full_name().to_string();
        let old_file_id = inner.position_map.file_id()?;
        let temp_name = format!(
            "{}$temp",
            source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| full_name.clone())
        );

        let registry = self.storage.registry();
        let temp_id = registry.add_file(&temp_name)?;
        let result = (|| -> Result<()> {
            registry.replace_file_content_with(temp_id, source)?;

            self.storage.cache().drop_file(old_file_id);
            registry.delete_file(old_file_id)?;
            registry.rename_file(temp_id, &full_name)?;
            inner.position_map.replace_file_id(temp_id);
            Ok(())
        })();

        if result.is_err() {
            if registry.file_name_by_id(temp_id).as_deref() == Some(temp_name.as_str()) {
                let _ = registry.delete_file(temp_id);
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // attributes
    // ------------------------------------------------------------------

    /// Changes a runtime attribute. `ENCRYPTION` is only allowed while the
    /// cluster holds no records.
    pub fn set(&self, attribute: ClusterAttribute, value: &str) -> Result<()> {
        let _component = self.atomic_lock.write();
        let mut inner = self.state.write();

        match attribute {
            ClusterAttribute::Name => self.set_name_internal(&mut inner, value),
            ClusterAttribute::RecordGrowFactor => {
                inner.config.record_grow_factor = parse_grow_factor("RECORD_GROW_FACTOR", value)?;
                self.storage.store_cluster_config(inner.config.clone());
                Ok(())
            }
            ClusterAttribute::RecordOverflowGrowFactor => {
                inner.config.record_overflow_grow_factor =
                    parse_grow_factor("RECORD_OVERFLOW_GROW_FACTOR", value)?;
                self.storage.store_cluster_config(inner.config.clone());
                Ok(())
            }
            ClusterAttribute::ConflictStrategy => {
                let strategy = self.storage.conflict_strategies().strategy(value)?;
                inner.conflict_strategy = Some(strategy);
                inner.config.conflict_strategy = Some(value.to_string());
                self.storage.store_cluster_config(inner.config.clone());
                Ok(())
            }
            ClusterAttribute::Status => {
                let status = ClusterStatus::parse(value)?;
                self.storage.set_cluster_status(inner.config.id, status)?;
                inner.config.status = status;
                Ok(())
            }
            ClusterAttribute::Encryption => {
                if inner.file_id.is_some() && self.entries_of(&inner)? > 0 {
                    return Err(Report::new(ClusterError::new(
                        &inner.config.name,
                        format!(
                            "cannot change encryption setting on cluster '{}' because it is not empty",
                            inner.config.name
                        ),
                    )));
                }
                let encryption = encryption_by_name(value, inner.config.encryption_key.as_deref())?;
                inner.encryption = encryption;
                inner.config.encryption = value.to_string();
                self.storage.store_cluster_config(inner.config.clone());
                Ok(())
            }
        }
    }

    fn set_name_internal(&self, inner: &mut ClusterInner, new_name: &str) -> Result<()> {
        check_valid_name(new_name)?;

        let file_id = inner.file_id()?;
        let old_name = inner.config.name.clone();
        let new_config = ClusterConfig::new(inner.config.id, new_name);

        self.storage
            .registry()
            .rename_file(file_id, &new_config.data_file_name())?;
        inner
            .position_map
            .rename(&new_config.position_map_file_name())?;

        self.storage.rename_cluster(&old_name, new_name)?;
        inner.config.name = new_name.to_string();
        self.storage.store_cluster_config(inner.config.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // record CRUD
    // ------------------------------------------------------------------

    /// Reserves a logical position with no chunks written yet.
    pub fn allocate_position(&self, record_type: u8) -> Result<PhysicalPosition> {
        let mut op = self.storage.atomics().begin();
        let inner = self.state.write();
        let name = inner.config.name.clone();

        let result = (|| -> Result<PhysicalPosition> {
            let position = inner.position_map.allocate(&mut op)?;
            self.add_atomic_operation_metadata(&inner, &mut op, position);
            Ok(PhysicalPosition::new(record_type, position, -1))
        })();

        self.finish(&name, op, result, "Error during record allocation")
    }

    /// Stores a record and binds its head into the position map. When
    /// `allocated_position` is given the record lands on that previously
    /// allocated position instead of a fresh one.
    pub fn create_record(
        &self,
        content: &[u8],
        record_version: i32,
        record_type: u8,
        allocated_position: Option<&PhysicalPosition>,
    ) -> Result<PhysicalPosition> {
        let stats = self.storage.session_statistics();
        let _timer = stats
            .as_ref()
            .map(|s| s.start_timer(ClusterOperationKind::RecordCreation));

        let (compression, encryption) = {
            let inner = self.state.read();
            (Arc::clone(&inner.compression), Arc::clone(&inner.encryption))
        };
        let content = encryption.encrypt(&compression.compress(content))?;

        let mut op = self.storage.atomics().begin();
        let inner = self.state.write();
        let name = inner.config.name.clone();

        let result = self.create_record_inner(
            &inner,
            &mut op,
            &content,
            record_version,
            record_type,
            allocated_position.map(|p| p.cluster_position),
        );
        self.finish(&name, op, result, "Error during record creation")
    }

    fn create_record_inner(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        content: &[u8],
        record_version: i32,
        record_type: u8,
        allocated_position: Option<i64>,
    ) -> Result<PhysicalPosition> {
        let entry_content_length = content.len() + HEAD_ENTRY_OVERHEAD;

        if entry_content_length < MAX_RECORD_SIZE {
            let mut entry = Vec::with_capacity(entry_content_length);
            entry.push(record_type);
            entry.extend_from_slice(&(content.len() as i32).to_le_bytes());
            entry.extend_from_slice(content);
            entry.push(1);
            entry.extend_from_slice(&(-1i64).to_le_bytes());

            let added = self.add_entry(inner, op, record_version, &entry)?;
            self.update_cluster_state(inner, op, 1, added.records_size_diff)?;

            let cluster_position = match allocated_position {
                Some(position) => {
                    inner.position_map.update(
                        op,
                        position,
                        PositionEntry::new(added.page_index, added.page_position),
                    )?;
                    position
                }
                None => inner
                    .position_map
                    .add(op, added.page_index, added.page_position)?,
            };

            self.add_atomic_operation_metadata(inner, op, cluster_position);
            Ok(PhysicalPosition::new(
                record_type,
                cluster_position,
                added.record_version,
            ))
        } else {
            let mut full_entry = Vec::with_capacity(content.len() + 5);
            full_entry.push(record_type);
            full_entry.extend_from_slice(&(content.len() as i32).to_le_bytes());
            full_entry.extend_from_slice(content);

            let mut prev_page_pointer: i64 = -1;
            let mut first_page_index: i64 = -1;
            let mut first_page_position: u32 = 0;
            let mut version = record_version;

            let mut from = 0usize;
            let mut to = (MAX_RECORD_SIZE - CHUNK_TAIL_SIZE).min(full_entry.len());
            let mut records_size_diff = 0i64;

            loop {
                let mut chunk = Vec::with_capacity(to - from + CHUNK_TAIL_SIZE);
                chunk.extend_from_slice(&full_entry[from..to]);
                chunk.push(if from > 0 { 0 } else { 1 });
                chunk.extend_from_slice(&(-1i64).to_le_bytes());

                let added = self.add_entry(inner, op, record_version, &chunk)?;
                records_size_diff += added.records_size_diff;

                if first_page_index == -1 {
                    first_page_index = added.page_index as i64;
                    first_page_position = added.page_position;
                    version = added.record_version;
                }

                let added_pointer = create_page_pointer(added.page_index, added.page_position);
                if prev_page_pointer >= 0 {
                    self.link_previous_chunk(inner, op, prev_page_pointer, added_pointer)?;
                }
                prev_page_pointer = added_pointer;

                from = to;
                to = (to + MAX_RECORD_SIZE - CHUNK_TAIL_SIZE).min(full_entry.len());
                if from >= to {
                    break;
                }
            }

            self.update_cluster_state(inner, op, 1, records_size_diff)?;

            let cluster_position = match allocated_position {
                Some(position) => {
                    inner.position_map.update(
                        op,
                        position,
                        PositionEntry::new(first_page_index as u64, first_page_position),
                    )?;
                    position
                }
                None => inner
                    .position_map
                    .add(op, first_page_index as u64, first_page_position)?,
            };

            self.add_atomic_operation_metadata(inner, op, cluster_position);
            Ok(PhysicalPosition::new(record_type, cluster_position, version))
        }
    }

    /// Rewrites the trailing pointer of an already placed chunk.
    fn link_previous_chunk(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        prev_pointer: i64,
        next_pointer: i64,
    ) -> Result<()> {
        let file_id = inner.file_id()?;
        let prev_page_index = pointer_page_index(prev_pointer);
        let prev_position = pointer_record_position(prev_pointer);

        let buf = op.load_for_write(
            self.storage.cache(),
            PageKey::new(file_id, prev_page_index),
        )?;
        let mut page = ClusterPage::attach(buf);
        page.set_record_long_value(prev_position as usize, -8, next_pointer)
    }

    /// Reads a record. `prefetch_records` widens the cache read-ahead for
    /// sequential scans; it never changes what is returned.
    pub fn read_record(&self, cluster_position: i64, prefetch_records: bool) -> Result<Option<RecordBuffer>> {
        let page_count = if prefetch_records { SCAN_PREFETCH_PAGES } else { 1 };

        let stats = self.storage.session_statistics();
        let _timer = stats
            .as_ref()
            .map(|s| s.start_timer(ClusterOperationKind::RecordRead));

        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        self.read_record_locked(&inner, cluster_position, page_count)
    }

    fn read_record_locked(
        &self,
        inner: &ClusterInner,
        cluster_position: i64,
        page_count: u32,
    ) -> Result<Option<RecordBuffer>> {
        let Some(position_entry) = inner.position_map.get(None, cluster_position, page_count)? else {
            return Ok(None);
        };

        let file_id = inner.file_id()?;
        let page_index = position_entry.page_index;
        let record_position = position_entry.record_position;

        if self.storage.registry().page_count(file_id)? <= page_index {
            return Ok(None);
        }

        let record_version = {
            let page_ref = self.load_with_prefetch(PageKey::new(file_id, page_index), page_count)?;
            let page = ClusterPage::attach(page_ref.data());
            if page.is_deleted(record_position as usize) {
                return Ok(None);
            }
            page.get_record_version(record_position as usize)?
        };

        let Some(full_content) =
            self.read_full_entry(inner, cluster_position, page_index, record_position, page_count)?
        else {
            return Ok(None);
        };

        ensure!(
            full_content.len() >= 5,
            "head chunk of record {} is too short to carry its framing",
            cluster_position
        );
        let record_type = full_content[0];
        let content_len =
            i32::from_le_bytes(full_content[1..5].try_into().unwrap()) as usize;
        ensure!(
            full_content.len() >= 5 + content_len,
            "declared record length {} exceeds the stored {} bytes",
            content_len,
            full_content.len().saturating_sub(5)
        );

        let content = inner.encryption.decrypt(&full_content[5..5 + content_len])?;
        let content = inner.compression.uncompress(&content)?;

        Ok(Some(RecordBuffer {
            content,
            version: record_version,
            record_type,
        }))
    }

    /// Returns the record when the stored version is newer than
    /// `record_version`, `None` when the caller is current. Fails with a
    /// not-found error when the record is absent.
    pub fn read_record_if_version_is_not_latest(
        &self,
        cluster_position: i64,
        record_version: i32,
    ) -> Result<Option<RecordBuffer>> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();

        let rid = RecordId::new(inner.config.id, cluster_position);
        let not_found = || Report::new(RecordNotFoundError::new(rid));

        let Some(position_entry) = inner.position_map.get(None, cluster_position, 1)? else {
            return Err(not_found());
        };

        let file_id = inner.file_id()?;
        if self.storage.registry().page_count(file_id)? <= position_entry.page_index {
            return Err(not_found());
        }

        let loaded_version = {
            let page_ref = self.load_with_prefetch(
                PageKey::new(file_id, position_entry.page_index),
                1,
            )?;
            let page = ClusterPage::attach(page_ref.data());
            if page.is_deleted(position_entry.record_position as usize) {
                return Err(not_found());
            }
            page.get_record_version(position_entry.record_position as usize)?
        };

        if loaded_version > record_version {
            return self.read_record_locked(&inner, cluster_position, 1);
        }
        Ok(None)
    }

    /// Rewrites a record in place, chunk by chunk. A missing position is a
    /// silent no-op, mirroring the none-sentinel read paths.
    pub fn update_record(
        &self,
        cluster_position: i64,
        content: &[u8],
        record_version: i32,
        record_type: u8,
    ) -> Result<()> {
        let stats = self.storage.session_statistics();
        let _timer = stats
            .as_ref()
            .map(|s| s.start_timer(ClusterOperationKind::RecordUpdate));

        let (compression, encryption) = {
            let inner = self.state.read();
            (Arc::clone(&inner.compression), Arc::clone(&inner.encryption))
        };
        let content = encryption.encrypt(&compression.compress(content))?;

        let mut op = self.storage.atomics().begin();
        let inner = self.state.write();
        let name = inner.config.name.clone();

        let result =
            self.update_record_inner(&inner, &mut op, cluster_position, &content, record_version, record_type);
        self.finish(&name, op, result, "Error during record update")
    }

    fn update_record_inner(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        cluster_position: i64,
        content: &[u8],
        record_version: i32,
        record_type: u8,
    ) -> Result<()> {
        let cache = self.storage.cache();
        let file_id = inner.file_id()?;

        let Some(position_entry) = inner.position_map.get(Some(op), cluster_position, 1)? else {
            return Ok(());
        };

        let origin_page_index = position_entry.page_index as i64;
        let origin_record_position = position_entry.record_position as i64;

        let mut next_page_index = origin_page_index;
        let mut next_record_position = origin_record_position;

        let mut new_page_index: i64 = -1;
        let mut new_record_position: i64 = -1;
        let mut prev_page_index: i64 = -1;
        let mut prev_record_position: i64 = -1;
        let mut next_entry_pointer: i64 = -1;

        let mut from = 0usize;
        let mut to;
        let mut size_diff = 0i64;
        let mut update_entry: Option<Vec<u8>> = None;

        loop {
            let entry_size;
            if update_entry.is_none() {
                if from == 0 {
                    entry_size = (content.len() + HEAD_ENTRY_OVERHEAD).min(MAX_RECORD_SIZE);
                    to = entry_size - HEAD_ENTRY_OVERHEAD;
                } else {
                    entry_size = (content.len() - from + CHUNK_TAIL_SIZE).min(MAX_RECORD_SIZE);
                    to = from + entry_size - CHUNK_TAIL_SIZE;
                }

                let mut entry = Vec::with_capacity(entry_size);
                if from == 0 {
                    entry.push(record_type);
                    entry.extend_from_slice(&(content.len() as i32).to_le_bytes());
                }
                entry.extend_from_slice(&content[from..to]);
                entry.push(if from == 0 { 1 } else { 0 });
                entry.extend_from_slice(&(-1i64).to_le_bytes());
                debug_assert!(to >= content.len() || entry_size == MAX_RECORD_SIZE);
                update_entry = Some(entry);
            } else {
                let pending = update_entry.as_ref().expect("checked above");
                entry_size = pending.len();
                to = if from == 0 {
                    entry_size - HEAD_ENTRY_OVERHEAD
                } else {
                    from + entry_size - CHUNK_TAIL_SIZE
                };
            }

            let mut free_page_index: i32 = -1;
            if next_page_index < 0 {
                let found = self.find_free_page(inner, op, entry_size)?;
                next_page_index = found.page_index as i64;
                free_page_index = found.free_page_index;
            }

            let target_page_index = next_page_index as u64;
            let is_new = target_page_index >= op.filled_up_to(cache, file_id)?;
            if is_new {
                let added = op.add_page(cache, file_id)?;
                debug_assert_eq!(added, target_page_index);
            }

            let updated_entry_position: i64;
            {
                let entry = update_entry.as_deref().expect("entry built or pending");
                let buf = op.load_for_write(cache, PageKey::new(file_id, target_page_index))?;
                let mut page = if is_new {
                    ClusterPage::format(buf)
                } else {
                    ClusterPage::attach(buf)
                };

                let page_free_space = page.get_free_space();
                if free_page_index < 0 {
                    free_page_index = calculate_free_page_index(&page);
                } else {
                    debug_assert!(is_new || free_page_index == calculate_free_page_index(&page));
                }

                if next_record_position >= 0 {
                    let slot = next_record_position as usize;
                    if page.is_deleted(slot) {
                        return Err(Report::new(ClusterError::new(
                            &inner.config.name,
                            format!(
                                "record with rid {} was deleted",
                                RecordId::new(inner.config.id, cluster_position)
                            ),
                        )));
                    }

                    let current_entry_size = page.get_record_size(slot)?;
                    next_entry_pointer = page.get_record_long_value(slot, -8)?;

                    if current_entry_size == entry_size {
                        page.replace_record(slot, entry, record_version)?;
                        updated_entry_position = slot as i64;
                    } else {
                        page.delete_record(slot)?;

                        if page.get_max_record_size() >= entry_size {
                            let appended = page.append_record(record_version, entry);
                            if appended < 0 {
                                let dump = page.dump();
                                error!(page_index = target_page_index, %dump, "page refused an append the free list promised");
                                eyre::bail!(
                                    "page {} does not have enough free space to add record content, free page index {}, entry length {}",
                                    target_page_index,
                                    free_page_index,
                                    entry.len()
                                );
                            }
                            updated_entry_position = appended;
                        } else {
                            updated_entry_position = -1;
                        }
                    }

                    if next_entry_pointer >= 0 {
                        next_page_index = pointer_page_index(next_entry_pointer) as i64;
                        next_record_position = pointer_record_position(next_entry_pointer) as i64;
                    } else {
                        next_page_index = -1;
                        next_record_position = -1;
                    }
                } else {
                    debug_assert!(page.get_max_record_size() >= entry_size);
                    let appended = page.append_record(record_version, entry);
                    if appended < 0 {
                        let dump = page.dump();
                        error!(page_index = target_page_index, %dump, "page refused an append the free list promised");
                        eyre::bail!(
                            "page {} does not have enough free space to add record content, free page index {}, entry length {}",
                            target_page_index,
                            free_page_index,
                            entry.len()
                        );
                    }
                    updated_entry_position = appended;
                    next_page_index = -1;
                    next_record_position = -1;
                }

                size_diff += page_free_space as i64 - page.get_free_space() as i64;
            }

            self.update_free_pages_index(inner, op, free_page_index, target_page_index)?;

            if updated_entry_position >= 0 {
                if from == 0 {
                    new_page_index = target_page_index as i64;
                    new_record_position = updated_entry_position;
                }

                from = to;

                if prev_page_index >= 0 {
                    let buf =
                        op.load_for_write(cache, PageKey::new(file_id, prev_page_index as u64))?;
                    let mut prev_page = ClusterPage::attach(buf);
                    prev_page.set_record_long_value(
                        prev_record_position as usize,
                        -8,
                        create_page_pointer(target_page_index, updated_entry_position as u32),
                    )?;
                }

                prev_page_index = target_page_index as i64;
                prev_record_position = updated_entry_position;
                update_entry = None;
            }

            if to >= content.len() && update_entry.is_none() {
                break;
            }
        }

        // chunks of the old chain past the new end are freed
        while next_entry_pointer >= 0 {
            let target_page_index = pointer_page_index(next_entry_pointer);
            let slot = pointer_record_position(next_entry_pointer) as usize;

            let free_page_index;
            {
                let buf = op.load_for_write(cache, PageKey::new(file_id, target_page_index))?;
                let mut page = ClusterPage::attach(buf);

                let page_free_space = page.get_free_space();
                free_page_index = calculate_free_page_index(&page);

                next_entry_pointer = page.get_record_long_value(slot, -8)?;
                page.delete_record(slot)?;

                size_diff += page_free_space as i64 - page.get_free_space() as i64;
            }
            self.update_free_pages_index(inner, op, free_page_index, target_page_index)?;
        }

        debug_assert!(new_page_index >= 0 && new_record_position >= 0);

        if new_page_index != origin_page_index || new_record_position != origin_record_position {
            inner.position_map.update(
                op,
                cluster_position,
                PositionEntry::new(new_page_index as u64, new_record_position as u32),
            )?;
        }

        self.update_cluster_state(inner, op, 0, size_diff)?;
        self.add_atomic_operation_metadata(inner, op, cluster_position);
        Ok(())
    }

    /// Deletes every chunk of a record and tombstones its position.
    /// Returns `false` when the position holds no record.
    pub fn delete_record(&self, cluster_position: i64) -> Result<bool> {
        let stats = self.storage.session_statistics();
        let _timer = stats
            .as_ref()
            .map(|s| s.start_timer(ClusterOperationKind::RecordDeletion));

        let mut op = self.storage.atomics().begin();
        let inner = self.state.write();
        let name = inner.config.name.clone();

        let result = self.delete_record_inner(&inner, &mut op, cluster_position);
        self.finish(&name, op, result, "Error during record deletion")
    }

    fn delete_record_inner(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        cluster_position: i64,
    ) -> Result<bool> {
        let cache = self.storage.cache();
        let file_id = inner.file_id()?;

        let Some(position_entry) = inner.position_map.get(Some(op), cluster_position, 1)? else {
            return Ok(false);
        };

        let mut page_index = position_entry.page_index;
        let mut record_position = position_entry.record_position as usize;

        if op.filled_up_to(cache, file_id)? <= page_index {
            return Ok(false);
        }

        let mut removed_content_size = 0i64;

        loop {
            let initial_free_page_index;
            let next_page_pointer;
            {
                let buf = op.load_for_write(cache, PageKey::new(file_id, page_index))?;
                let mut page = ClusterPage::attach(buf);
                initial_free_page_index = calculate_free_page_index(&page);

                if page.is_deleted(record_position) {
                    if removed_content_size == 0 {
                        return Ok(false);
                    }
                    return Err(Report::new(ClusterError::new(
                        &inner.config.name,
                        format!(
                            "content of record {} was broken",
                            RecordId::new(inner.config.id, cluster_position)
                        ),
                    )));
                }

                next_page_pointer = page.get_record_long_value(record_position, -8)?;

                let initial_free_space = page.get_free_space();
                page.delete_record(record_position)?;
                removed_content_size += page.get_free_space() as i64 - initial_free_space as i64;
            }

            self.update_free_pages_index(inner, op, initial_free_page_index, page_index)?;

            if next_page_pointer < 0 {
                break;
            }
            page_index = pointer_page_index(next_page_pointer);
            record_position = pointer_record_position(next_page_pointer) as usize;
        }

        self.update_cluster_state(inner, op, -1, -removed_content_size)?;
        inner.position_map.remove(op, cluster_position)?;
        self.add_atomic_operation_metadata(inner, op, cluster_position);
        Ok(true)
    }

    /// Unbinds a record from the position map without freeing its chunks.
    /// The orphaned bytes stay accounted in `records_size` on purpose.
    pub fn hide_record(&self, cluster_position: i64) -> Result<bool> {
        let mut op = self.storage.atomics().begin();
        let inner = self.state.write();
        let name = inner.config.name.clone();

        let result = (|| -> Result<bool> {
            let Some(position_entry) = inner.position_map.get(Some(&op), cluster_position, 1)? else {
                return Ok(false);
            };

            let file_id = inner.file_id()?;
            if op.filled_up_to(self.storage.cache(), file_id)? <= position_entry.page_index {
                return Ok(false);
            }

            self.update_cluster_state(&inner, &mut op, -1, 0)?;
            inner.position_map.remove(&mut op, cluster_position)?;
            self.add_atomic_operation_metadata(&inner, &mut op, cluster_position);
            Ok(true)
        })();

        self.finish(&name, op, result, "Error during record hide")
    }

    /// Writes a record back onto a previously deleted position.
    pub fn recycle_record(
        &self,
        cluster_position: i64,
        content: &[u8],
        record_version: i32,
        record_type: u8,
    ) -> Result<()> {
        let stats = self.storage.session_statistics();
        let _timer = stats
            .as_ref()
            .map(|s| s.start_timer(ClusterOperationKind::RecordUpdate));

        let (compression, encryption) = {
            let inner = self.state.read();
            (Arc::clone(&inner.compression), Arc::clone(&inner.encryption))
        };
        let content = encryption.encrypt(&compression.compress(content))?;

        let mut op = self.storage.atomics().begin();
        let inner = self.state.write();
        let name = inner.config.name.clone();

        let result =
            self.recycle_record_inner(&inner, &mut op, cluster_position, &content, record_version, record_type);
        self.finish(&name, op, result, "Error during record recycling")
    }

    fn recycle_record_inner(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        cluster_position: i64,
        content: &[u8],
        record_version: i32,
        record_type: u8,
    ) -> Result<()> {
        if inner.position_map.get(Some(op), cluster_position, 1)?.is_some() {
            return Err(Report::new(ClusterError::new(
                &inner.config.name,
                format!(
                    "record with rid {} was not deleted",
                    RecordId::new(inner.config.id, cluster_position)
                ),
            )));
        }

        let entry_content_length = content.len() + HEAD_ENTRY_OVERHEAD;

        if entry_content_length < MAX_RECORD_SIZE {
            let mut entry = Vec::with_capacity(entry_content_length);
            entry.push(record_type);
            entry.extend_from_slice(&(content.len() as i32).to_le_bytes());
            entry.extend_from_slice(content);
            entry.push(1);
            entry.extend_from_slice(&(-1i64).to_le_bytes());

            let added = self.add_entry(inner, op, record_version, &entry)?;
            self.update_cluster_state(inner, op, 1, added.records_size_diff)?;

            inner.position_map.resurrect(
                op,
                cluster_position,
                PositionEntry::new(added.page_index, added.page_position),
            )?;
        } else {
            let mut full_entry = Vec::with_capacity(content.len() + 5);
            full_entry.push(record_type);
            full_entry.extend_from_slice(&(content.len() as i32).to_le_bytes());
            full_entry.extend_from_slice(content);

            let mut prev_page_pointer: i64 = -1;
            let mut first_page_index: i64 = -1;
            let mut first_page_position: u32 = 0;

            let mut from = 0usize;
            let mut to = (MAX_RECORD_SIZE - CHUNK_TAIL_SIZE).min(full_entry.len());
            let mut records_size_diff = 0i64;

            loop {
                let mut chunk = Vec::with_capacity(to - from + CHUNK_TAIL_SIZE);
                chunk.extend_from_slice(&full_entry[from..to]);
                chunk.push(if from > 0 { 0 } else { 1 });
                chunk.extend_from_slice(&(-1i64).to_le_bytes());

                let added = self.add_entry(inner, op, record_version, &chunk)?;
                records_size_diff += added.records_size_diff;

                if first_page_index == -1 {
                    first_page_index = added.page_index as i64;
                    first_page_position = added.page_position;
                }

                let added_pointer = create_page_pointer(added.page_index, added.page_position);
                if prev_page_pointer >= 0 {
                    self.link_previous_chunk(inner, op, prev_page_pointer, added_pointer)?;
                }
                prev_page_pointer = added_pointer;

                from = to;
                to = (to + MAX_RECORD_SIZE - CHUNK_TAIL_SIZE).min(full_entry.len());
                if from >= to {
                    break;
                }
            }

            self.update_cluster_state(inner, op, 1, records_size_diff)?;

            inner.position_map.resurrect(
                op,
                cluster_position,
                PositionEntry::new(first_page_index as u64, first_page_position),
            )?;
        }

        self.add_atomic_operation_metadata(inner, op, cluster_position);
        Ok(())
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Metadata of the record stored at a position, `None` when the
    /// position holds no live head chunk.
    pub fn get_physical_position(&self, cluster_position: i64) -> Result<Option<PhysicalPosition>> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();

        let Some(position_entry) = inner.position_map.get(None, cluster_position, 1)? else {
            return Ok(None);
        };

        let file_id = inner.file_id()?;
        if self.storage.registry().page_count(file_id)? <= position_entry.page_index {
            return Ok(None);
        }

        let page_ref =
            self.load_with_prefetch(PageKey::new(file_id, position_entry.page_index), 1)?;
        let page = ClusterPage::attach(page_ref.data());
        let slot = position_entry.record_position as usize;

        if page.is_deleted(slot) {
            return Ok(None);
        }
        if page.get_record_byte_value(slot, -(CHUNK_TAIL_SIZE as i32))? == 0 {
            return Ok(None);
        }

        Ok(Some(PhysicalPosition::new(
            page.get_record_byte_value(slot, 0)?,
            cluster_position,
            page.get_record_version(slot)?,
        )))
    }

    pub fn get_record_status(&self, cluster_position: i64) -> Result<RecordStatus> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();

        let status = inner.position_map.get_status(None, cluster_position)?;
        Ok(match status {
            position_map::ALLOCATED => RecordStatus::Allocated,
            position_map::FILLED => RecordStatus::Present,
            position_map::REMOVED => RecordStatus::Removed,
            _ => RecordStatus::NotExistent,
        })
    }

    /// Count of live records.
    pub fn get_entries(&self) -> Result<i64> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        self.entries_of(&inner)
    }

    fn entries_of(&self, inner: &ClusterInner) -> Result<i64> {
        let file_id = inner.file_id()?;
        let page_ref = self
            .storage
            .cache()
            .load(PageKey::new(file_id, STATE_PAGE_INDEX))?;
        Ok(ClusterStateHeader::from_page(page_ref.data())?.size())
    }

    /// Byte footprint of live payload, chunk framing included.
    pub fn get_records_size(&self) -> Result<i64> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();

        let file_id = inner.file_id()?;
        let page_ref = self
            .storage
            .cache()
            .load(PageKey::new(file_id, STATE_PAGE_INDEX))?;
        Ok(ClusterStateHeader::from_page(page_ref.data())?.records_size())
    }

    pub fn get_first_position(&self) -> Result<i64> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        inner.position_map.first_position(None)
    }

    pub fn get_last_position(&self) -> Result<i64> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        inner.position_map.last_position(None)
    }

    pub fn get_next_position(&self) -> Result<i64> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        inner.position_map.next_position(None)
    }

    pub fn higher_positions(&self, cluster_position: i64) -> Result<Vec<i64>> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        inner.position_map.higher_positions(None, cluster_position)
    }

    pub fn ceiling_positions(&self, cluster_position: i64) -> Result<Vec<i64>> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        inner.position_map.ceiling_positions(None, cluster_position)
    }

    pub fn lower_positions(&self, cluster_position: i64) -> Result<Vec<i64>> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        inner.position_map.lower_positions(None, cluster_position)
    }

    pub fn floor_positions(&self, cluster_position: i64) -> Result<Vec<i64>> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();
        inner.position_map.floor_positions(None, cluster_position)
    }

    /// Iterates every live record in position order.
    pub fn absolute_iterator(&self) -> ClusterEntryIterator<'_> {
        ClusterEntryIterator::new(self)
    }

    /// Chunk-level view of one stored record, for inspection and repair
    /// tooling.
    pub fn read_debug(&self, cluster_position: i64) -> Result<PaginatedClusterDebug> {
        let _component = self.atomic_lock.read();
        let inner = self.state.read();

        let mut debug = PaginatedClusterDebug {
            cluster_position,
            ..Default::default()
        };

        let Some(position_entry) = inner.position_map.get(None, cluster_position, 1)? else {
            debug.empty = true;
            return Ok(debug);
        };

        let file_id = inner.file_id()?;
        debug.file_id = file_id;

        let mut page_index = position_entry.page_index;
        let mut record_position = position_entry.record_position as usize;

        if self.storage.registry().page_count(file_id)? <= page_index {
            debug.empty = true;
            return Ok(debug);
        }

        let mut first_entry = true;
        loop {
            let next_page_pointer;
            {
                let page_ref = self.load_with_prefetch(PageKey::new(file_id, page_index), 1)?;
                let page = ClusterPage::attach(page_ref.data());

                if page.is_deleted(record_position) {
                    if debug.pages.is_empty() {
                        debug.empty = true;
                        return Ok(debug);
                    }
                    return Err(Report::new(ClusterError::new(
                        &inner.config.name,
                        format!(
                            "content of record {} was broken",
                            RecordId::new(inner.config.id, cluster_position)
                        ),
                    )));
                }

                let in_page_size = page.get_record_size(record_position)?;
                ensure!(
                    in_page_size >= CHUNK_TAIL_SIZE,
                    "chunk of record {} is shorter than its trailing pointer",
                    cluster_position
                );
                let content = page.get_record_binary_value(record_position, 0, in_page_size)?;

                if first_entry && content[in_page_size - CHUNK_TAIL_SIZE] == 0 {
                    debug.empty = true;
                    return Ok(debug);
                }

                next_page_pointer =
                    i64::from_le_bytes(content[in_page_size - 8..].try_into().unwrap());
                debug.content_size += in_page_size - CHUNK_TAIL_SIZE;
                debug.pages.push(ClusterPageDebug {
                    page_index,
                    in_page_position: record_position as u32,
                    in_page_size,
                    content,
                });
                first_entry = false;
            }

            if next_page_pointer < 0 {
                break;
            }
            page_index = pointer_page_index(next_page_pointer);
            record_position = pointer_record_position(next_page_pointer) as usize;
        }

        Ok(debug)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn load_with_prefetch(&self, key: PageKey, page_count: u32) -> Result<PageRef<'_>> {
        let page = self.storage.cache().load(key)?;
        if page_count > 1 {
            self.storage.cache().prefetch(key, page_count);
        }
        Ok(page)
    }

    /// Ends the atomic operation exactly once — commit on `Ok`, rollback on
    /// `Err` — and applies the error-wrapping policy: I/O and not-found
    /// errors pass through verbatim, everything else becomes a cluster
    /// error naming this cluster and the failed operation.
    fn finish<T>(
        &self,
        cluster_name: &str,
        op: AtomicOperation,
        result: Result<T>,
        context: &'static str,
    ) -> Result<T> {
        match result {
            Ok(value) => match self.storage.atomics().end(op, false) {
                Ok(()) => Ok(value),
                Err(report) => Err(self.wrap_report(cluster_name, report, context)),
            },
            Err(report) => {
                let rollback = self.storage.atomics().end(op, true);
                debug_assert!(rollback.is_ok(), "rollback only discards buffers");
                Err(self.wrap_report(cluster_name, report, context))
            }
        }
    }

    fn wrap_report(&self, cluster_name: &str, report: Report, context: &'static str) -> Report {
        let passthrough = report.chain().any(|cause| {
            cause.is::<std::io::Error>() || cause.is::<RecordNotFoundError>()
        });
        if passthrough {
            report
        } else {
            report.wrap_err(ClusterError::new(cluster_name, context))
        }
    }

    fn add_atomic_operation_metadata(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        cluster_position: i64,
    ) {
        if !self.storage.track_record_changes() {
            return;
        }
        op.record_metadata()
            .add_rid(RecordId::new(inner.config.id, cluster_position));
    }

    /// Adds page 0 and formats the state header: zero counters, empty
    /// buckets.
    fn init_cluster_state(&self, inner: &ClusterInner, op: &mut AtomicOperation) -> Result<()> {
        let cache = self.storage.cache();
        let file_id = inner.file_id()?;

        let page_index = op.add_page(cache, file_id)?;
        ensure!(
            page_index == STATE_PAGE_INDEX,
            "state page must be page 0, file already has {} pages",
            page_index
        );

        let buf = op.load_for_write(cache, PageKey::new(file_id, STATE_PAGE_INDEX))?;
        ClusterStateHeader::init(buf)?;
        Ok(())
    }

    fn update_cluster_state(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        size_diff: i64,
        records_size_diff: i64,
    ) -> Result<()> {
        let buf = op.load_for_write(
            self.storage.cache(),
            PageKey::new(inner.file_id()?, STATE_PAGE_INDEX),
        )?;
        let state = ClusterStateHeader::from_page_mut(buf)?;
        state.set_size(state.size() + size_diff);
        state.set_records_size(state.records_size() + records_size_diff);
        Ok(())
    }

    fn update_free_pages_list(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        free_list_index: usize,
        page_index: i64,
    ) -> Result<()> {
        let buf = op.load_for_write(
            self.storage.cache(),
            PageKey::new(inner.file_id()?, STATE_PAGE_INDEX),
        )?;
        let state = ClusterStateHeader::from_page_mut(buf)?;
        state.set_free_list_page(free_list_index, page_index)
    }

    /// Picks a page with room for `content_size` bytes: scan the bucket
    /// heads upward, fall back to a fresh page past the filled bound. A page
    /// found on a list it no longer belongs to is re-bucketed and the scan
    /// retried — the iterative loop bounds stack use.
    fn find_free_page(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        content_size: usize,
    ) -> Result<FindFreePageResult> {
        let cache = self.storage.cache();
        let file_id = inner.file_id()?;
        let state_key = PageKey::new(file_id, STATE_PAGE_INDEX);

        loop {
            let mut free_page_index =
                (content_size / ONE_KB) as i32 - LOWEST_FREELIST_BOUNDARY as i32;
            if free_page_index < 0 {
                free_page_index = 0;
            }

            let mut page_index: i64 = -1;
            {
                let view = op.load_for_read(cache, state_key, 1)?;
                let state = ClusterStateHeader::from_page(&view)?;
                loop {
                    page_index = state.get_free_list_page(free_page_index as usize)?;
                    free_page_index += 1;
                    if page_index >= 0 || free_page_index as usize >= FREE_LIST_SIZE {
                        break;
                    }
                }
            }

            if page_index < 0 {
                page_index = op.filled_up_to(cache, file_id)? as i64;
            } else {
                free_page_index -= 1;
            }

            if (free_page_index as usize) < FREE_LIST_SIZE {
                if page_index >= op.filled_up_to(cache, file_id)? as i64 {
                    // the head points past the file, drop it and retry
                    warn!(
                        file = %inner.config.data_file_name(),
                        bucket = free_page_index,
                        page_index,
                        "free list head points at a missing page, repairing automatically"
                    );
                    self.update_free_pages_list(inner, op, free_page_index as usize, -1)?;
                    continue;
                }

                let real_free_page_index = {
                    let buf = op.load_for_write(cache, PageKey::new(file_id, page_index as u64))?;
                    let page = ClusterPage::attach(&*buf);
                    calculate_free_page_index(&page)
                };

                if real_free_page_index != free_page_index {
                    warn!(
                        file = %inner.config.data_file_name(),
                        page_index,
                        "page was placed in the wrong free list, repairing automatically"
                    );
                    self.update_free_pages_index(inner, op, free_page_index, page_index as u64)?;
                    continue;
                }
            }

            return Ok(FindFreePageResult {
                page_index: page_index as u64,
                free_page_index,
            });
        }
    }

    /// Moves a page between free-list buckets after its free space changed.
    /// Splices it out of its old list, clears its links, and pushes it onto
    /// the head of its new bucket.
    fn update_free_pages_index(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        prev_free_page_index: i32,
        page_index: u64,
    ) -> Result<()> {
        let cache = self.storage.cache();
        let file_id = inner.file_id()?;
        let key = PageKey::new(file_id, page_index);

        let (new_free_page_index, prev_page_index, next_page_index) = {
            let buf = op.load_for_write(cache, key)?;
            let page = ClusterPage::attach(&*buf);
            (
                calculate_free_page_index(&page),
                page.get_prev_page(),
                page.get_next_page(),
            )
        };

        if prev_free_page_index == new_free_page_index {
            return Ok(());
        }

        if prev_page_index >= 0 {
            let buf = op.load_for_write(cache, PageKey::new(file_id, prev_page_index as u64))?;
            let mut prev_page = ClusterPage::attach(buf);
            debug_assert_eq!(calculate_free_page_index(&prev_page), prev_free_page_index);
            prev_page.set_next_page(next_page_index);
        }

        if next_page_index >= 0 {
            let buf = op.load_for_write(cache, PageKey::new(file_id, next_page_index as u64))?;
            let mut next_page = ClusterPage::attach(buf);
            debug_assert_eq!(calculate_free_page_index(&next_page), prev_free_page_index);
            next_page.set_prev_page(prev_page_index);
        }

        {
            let buf = op.load_for_write(cache, key)?;
            let mut page = ClusterPage::attach(buf);
            page.set_prev_page(-1);
            page.set_next_page(-1);
        }

        if prev_free_page_index < 0 && new_free_page_index < 0 {
            return Ok(());
        }

        if prev_free_page_index >= 0 && (prev_free_page_index as usize) < FREE_LIST_SIZE {
            // the page was the bucket head; hand the head to its successor
            if prev_page_index < 0 {
                self.update_free_pages_list(
                    inner,
                    op,
                    prev_free_page_index as usize,
                    next_page_index,
                )?;
            }
        }

        if new_free_page_index >= 0 {
            let old_head = {
                let view = op.load_for_read(cache, PageKey::new(file_id, STATE_PAGE_INDEX), 1)?;
                ClusterStateHeader::from_page(&view)?
                    .get_free_list_page(new_free_page_index as usize)?
            };

            if old_head >= 0 {
                {
                    let buf = op.load_for_write(cache, PageKey::new(file_id, old_head as u64))?;
                    let mut head_page = ClusterPage::attach(buf);
                    debug_assert_eq!(calculate_free_page_index(&head_page), new_free_page_index);
                    head_page.set_prev_page(page_index as i64);
                }
                {
                    let buf = op.load_for_write(cache, key)?;
                    let mut page = ClusterPage::attach(buf);
                    page.set_next_page(old_head);
                    page.set_prev_page(-1);
                }
            }

            self.update_free_pages_list(inner, op, new_free_page_index as usize, page_index as i64)?;
        }

        Ok(())
    }

    /// Places one chunk on a page chosen from the free lists and re-buckets
    /// the page afterwards.
    fn add_entry(
        &self,
        inner: &ClusterInner,
        op: &mut AtomicOperation,
        record_version: i32,
        entry: &[u8],
    ) -> Result<AddEntryResult> {
        let cache = self.storage.cache();
        let file_id = inner.file_id()?;

        let found = self.find_free_page(inner, op, entry.len())?;
        let free_page_index = found.free_page_index;
        let page_index = found.page_index;
        let is_new = free_page_index as usize >= FREE_LIST_SIZE;

        if is_new {
            let added = op.add_page(cache, file_id)?;
            debug_assert_eq!(added, page_index);
        }

        let (page_position, final_version, records_size_diff) = {
            let buf = op.load_for_write(cache, PageKey::new(file_id, page_index))?;
            let mut page = if is_new {
                ClusterPage::format(buf)
            } else {
                ClusterPage::attach(buf)
            };
            debug_assert!(is_new || free_page_index == calculate_free_page_index(&page));

            let initial_free_space = page.get_free_space();
            let position = page.append_record(record_version, entry);
            if position < 0 {
                let dump = page.dump();
                error!(page_index, %dump, "page refused an append the free list promised");
                eyre::bail!(
                    "page {} does not have enough free space to add record content, free page index {}, entry length {}",
                    page_index,
                    free_page_index,
                    entry.len()
                );
            }

            let final_version = page.get_record_version(position as usize)?;
            (
                position as u32,
                final_version,
                initial_free_space as i64 - page.get_free_space() as i64,
            )
        };

        self.update_free_pages_index(inner, op, free_page_index, page_index)?;

        Ok(AddEntryResult {
            page_index,
            page_position,
            record_version: final_version,
            records_size_diff,
        })
    }

    /// Collects a record's chunks into the full entry image, head framing
    /// included. `None` when the head is gone or the position points at a
    /// continuation chunk.
    fn read_full_entry(
        &self,
        inner: &ClusterInner,
        cluster_position: i64,
        mut page_index: u64,
        mut record_position: u32,
        page_count: u32,
    ) -> Result<Option<Vec<u8>>> {
        let file_id = inner.file_id()?;
        if self.storage.registry().page_count(file_id)? <= page_index {
            return Ok(None);
        }

        let mut chunks: SmallVec<[Vec<u8>; 4]> = SmallVec::new();
        let mut content_size = 0usize;
        let mut first_entry = true;

        loop {
            let next_page_pointer;
            {
                let page_ref = self.load_with_prefetch(PageKey::new(file_id, page_index), page_count)?;
                let page = ClusterPage::attach(page_ref.data());
                let slot = record_position as usize;

                if page.is_deleted(slot) {
                    if chunks.is_empty() {
                        return Ok(None);
                    }
                    return Err(Report::new(ClusterError::new(
                        &inner.config.name,
                        format!(
                            "content of record {} was broken",
                            RecordId::new(inner.config.id, cluster_position)
                        ),
                    )));
                }

                let chunk_size = page.get_record_size(slot)?;
                ensure!(
                    chunk_size >= CHUNK_TAIL_SIZE,
                    "chunk of record {} is shorter than its trailing pointer",
                    cluster_position
                );
                let content = page.get_record_binary_value(slot, 0, chunk_size)?;

                if first_entry && content[chunk_size - CHUNK_TAIL_SIZE] == 0 {
                    return Ok(None);
                }

                next_page_pointer =
                    i64::from_le_bytes(content[chunk_size - 8..].try_into().unwrap());
                content_size += chunk_size - CHUNK_TAIL_SIZE;
                chunks.push(content);
                first_entry = false;
            }

            if next_page_pointer < 0 {
                break;
            }
            page_index = pointer_page_index(next_page_pointer);
            record_position = pointer_record_position(next_page_pointer);
        }

        if chunks.len() == 1 {
            return Ok(Some(chunks.swap_remove(0)));
        }

        let mut full_content = Vec::with_capacity(content_size + CHUNK_TAIL_SIZE);
        for chunk in &chunks {
            full_content.extend_from_slice(&chunk[..chunk.len() - CHUNK_TAIL_SIZE]);
        }
        Ok(Some(full_content))
    }
}
