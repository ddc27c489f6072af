//! # Cluster Position Map
//!
//! Sidecar file translating dense logical positions to `(page, slot)`
//! locations plus a one-byte status. Positions are handed out
//! monotonically and never reused: deletion flips the status to `REMOVED`
//! and leaves the entry in place forever, which is what keeps record
//! identities stable for the cluster's whole life.
//!
//! ## Bucket Layout
//!
//! The file is a sequence of bucket pages, each holding a fixed number of
//! 13-byte entries:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ---------------------------------
//! 0       4     size: entries used in this bucket
//! 4       4     reserved
//! 8       13*N  entries: [status u8][page_index u64][slot u32]
//! ```
//!
//! The fixed bucket header is a zerocopy struct; the variable entry array
//! behind it is read field by field. `position = bucket_index *
//! ENTRIES_PER_BUCKET + index_in_bucket`; every bucket before the last is
//! full, so locating a position is pure arithmetic.
//!
//! ## Status Lifecycle
//!
//! ```text
//! NOT_EXISTENT ──allocate──> ALLOCATED ──update──> FILLED
//!                                            │        │ remove
//!       NOT_EXISTENT ──add──> FILLED <──resurrect── REMOVED
//! ```

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_SIZE;
use crate::storage::{parse_zerocopy, parse_zerocopy_mut, AtomicOperation, PageCache, PageKey, PageView};

pub const NOT_EXISTENT: u8 = 0;
pub const ALLOCATED: u8 = 1;
pub const FILLED: u8 = 2;
pub const REMOVED: u8 = 3;

pub const BUCKET_HEADER_SIZE: usize = 8;
pub const ENTRY_SIZE: usize = 13;
pub const ENTRIES_PER_BUCKET: usize = (PAGE_SIZE - BUCKET_HEADER_SIZE) / ENTRY_SIZE;

/// Head-chunk location of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionEntry {
    pub page_index: u64,
    pub record_position: u32,
}

impl PositionEntry {
    pub fn new(page_index: u64, record_position: u32) -> Self {
        Self {
            page_index,
            record_position,
        }
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BucketHeader {
    size: U32,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<BucketHeader>() == BUCKET_HEADER_SIZE);

impl BucketHeader {
    zerocopy_accessors! {
        size: u32,
    }
}

fn bucket_size(page: &[u8]) -> usize {
    let header = parse_zerocopy::<BucketHeader>(page, "BucketHeader")
        .expect("bucket pages are PAGE_SIZE buffers"); // INVARIANT: callers hand over whole pages
    header.size() as usize
}

fn set_bucket_size(page: &mut [u8], size: usize) {
    let header = parse_zerocopy_mut::<BucketHeader>(page, "BucketHeader")
        .expect("bucket pages are PAGE_SIZE buffers"); // INVARIANT: callers hand over whole pages
    header.set_size(size as u32);
}

fn entry_offset(index: usize) -> usize {
    BUCKET_HEADER_SIZE + index * ENTRY_SIZE
}

fn read_status(page: &[u8], index: usize) -> u8 {
    page[entry_offset(index)]
}

fn read_entry(page: &[u8], index: usize) -> PositionEntry {
    let at = entry_offset(index);
    PositionEntry {
        page_index: u64::from_le_bytes(page[at + 1..at + 9].try_into().unwrap()),
        record_position: u32::from_le_bytes(page[at + 9..at + 13].try_into().unwrap()),
    }
}

fn write_entry(page: &mut [u8], index: usize, status: u8, entry: PositionEntry) {
    let at = entry_offset(index);
    page[at] = status;
    page[at + 1..at + 9].copy_from_slice(&entry.page_index.to_le_bytes());
    page[at + 9..at + 13].copy_from_slice(&entry.record_position.to_le_bytes());
}

pub struct PositionMap {
    cache: Arc<PageCache>,
    full_name: String,
    file_id: Option<u64>,
}

impl PositionMap {
    pub fn new(cache: Arc<PageCache>, full_name: String) -> Self {
        Self {
            cache,
            full_name,
            file_id: None,
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn file_id(&self) -> Result<u64> {
        self.file_id
            .ok_or_else(|| eyre::eyre!("position map '{}' is not open", self.full_name))
    }

    /// Swaps the backing file id after the file content was replaced.
    pub fn replace_file_id(&mut self, file_id: u64) {
        self.file_id = Some(file_id);
    }

    // ------------------------------------------------------------------
    // file lifecycle
    // ------------------------------------------------------------------

    pub fn create(&mut self) -> Result<()> {
        let file_id = self.cache.registry().add_file(&self.full_name)?;
        self.file_id = Some(file_id);
        Ok(())
    }

    pub fn open(&mut self) -> Result<()> {
        let file_id = self.cache.registry().open_file(&self.full_name)?;
        self.file_id = Some(file_id);
        Ok(())
    }

    pub fn close(&mut self, flush: bool) -> Result<()> {
        if let Some(file_id) = self.file_id {
            if flush {
                self.cache.registry().flush(file_id)?;
            }
            self.cache.drop_file(file_id);
        }
        self.file_id = None;
        Ok(())
    }

    pub fn delete(&mut self) -> Result<()> {
        let file_id = self.file_id()?;
        self.cache.drop_file(file_id);
        self.cache.registry().delete_file(file_id)?;
        self.file_id = None;
        Ok(())
    }

    pub fn truncate(&self, op: &mut AtomicOperation) -> Result<()> {
        let file_id = self.file_id()?;
        op.forget_file(file_id);
        self.cache.drop_file(file_id);
        self.cache.registry().truncate_file(file_id)
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.registry().flush(self.file_id()?)
    }

    pub fn rename(&mut self, new_full_name: &str) -> Result<()> {
        let file_id = self.file_id()?;
        self.cache.registry().rename_file(file_id, new_full_name)?;
        self.full_name = new_full_name.to_string();
        Ok(())
    }

    // ------------------------------------------------------------------
    // page plumbing
    // ------------------------------------------------------------------

    fn filled_up_to(&self, op: Option<&AtomicOperation>, file_id: u64) -> Result<u64> {
        match op {
            Some(op) => op.filled_up_to(&self.cache, file_id),
            None => self.cache.registry().page_count(file_id),
        }
    }

    fn view<'a>(
        &'a self,
        op: Option<&'a AtomicOperation>,
        page_index: u64,
        prefetch: u32,
    ) -> Result<PageView<'a>> {
        let key = PageKey::new(self.file_id()?, page_index);
        match op {
            Some(op) => op.load_for_read(&self.cache, key, prefetch),
            None => {
                let page = self.cache.load(key)?;
                if prefetch > 1 {
                    self.cache.prefetch(key, prefetch);
                }
                Ok(PageView::Cached(page))
            }
        }
    }

    /// Appends an entry with `status`, growing the bucket chain on demand.
    fn append_entry(
        &self,
        op: &mut AtomicOperation,
        status: u8,
        entry: PositionEntry,
    ) -> Result<i64> {
        let file_id = self.file_id()?;
        let bucket_count = op.filled_up_to(&self.cache, file_id)?;

        let (bucket_index, fresh) = if bucket_count == 0 {
            (op.add_page(&self.cache, file_id)?, true)
        } else {
            let last = bucket_count - 1;
            let used = {
                let view = self.view(Some(op), last, 1)?;
                bucket_size(&view)
            };
            if used >= ENTRIES_PER_BUCKET {
                (op.add_page(&self.cache, file_id)?, true)
            } else {
                (last, false)
            }
        };

        let page = op.load_for_write(&self.cache, PageKey::new(file_id, bucket_index))?;
        if fresh {
            set_bucket_size(page, 0);
        }
        let index = bucket_size(page);
        write_entry(page, index, status, entry);
        set_bucket_size(page, index + 1);

        Ok(bucket_index as i64 * ENTRIES_PER_BUCKET as i64 + index as i64)
    }

    fn locate(&self, position: i64) -> Option<(u64, usize)> {
        if position < 0 {
            return None;
        }
        let bucket = (position as u64) / ENTRIES_PER_BUCKET as u64;
        let index = (position as usize) % ENTRIES_PER_BUCKET;
        Some((bucket, index))
    }

    // ------------------------------------------------------------------
    // allocation and status transitions
    // ------------------------------------------------------------------

    /// Reserves the next position without binding a location yet.
    pub fn allocate(&self, op: &mut AtomicOperation) -> Result<i64> {
        self.append_entry(op, ALLOCATED, PositionEntry::new(0, 0))
    }

    /// Allocates a position already bound to its head chunk.
    pub fn add(&self, op: &mut AtomicOperation, page_index: u64, record_position: u32) -> Result<i64> {
        self.append_entry(op, FILLED, PositionEntry::new(page_index, record_position))
    }

    fn transition(
        &self,
        op: &mut AtomicOperation,
        position: i64,
        expect: impl Fn(u8) -> bool,
        expect_label: &str,
        status: u8,
        entry: PositionEntry,
    ) -> Result<()> {
        let file_id = self.file_id()?;
        let Some((bucket, index)) = self.locate(position) else {
            bail!("position {} is negative", position);
        };
        ensure!(
            bucket < op.filled_up_to(&self.cache, file_id)?,
            "position {} was never allocated",
            position
        );

        let page = op.load_for_write(&self.cache, PageKey::new(file_id, bucket))?;
        ensure!(index < bucket_size(page), "position {} was never allocated", position);

        let current = read_status(page, index);
        ensure!(
            expect(current),
            "position {} has status {} but {} was required",
            position,
            current,
            expect_label
        );

        write_entry(page, index, status, entry);
        Ok(())
    }

    /// Moves a `FILLED`/`ALLOCATED` position to a new location.
    pub fn update(&self, op: &mut AtomicOperation, position: i64, entry: PositionEntry) -> Result<()> {
        self.transition(
            op,
            position,
            |s| s == FILLED || s == ALLOCATED,
            "FILLED or ALLOCATED",
            FILLED,
            entry,
        )
    }

    /// Brings a `REMOVED` position back to life at a new location.
    pub fn resurrect(&self, op: &mut AtomicOperation, position: i64, entry: PositionEntry) -> Result<()> {
        self.transition(op, position, |s| s == REMOVED, "REMOVED", FILLED, entry)
    }

    /// Tombstones a `FILLED` position. The position itself is never reused.
    pub fn remove(&self, op: &mut AtomicOperation, position: i64) -> Result<()> {
        self.transition(op, position, |s| s == FILLED, "FILLED", REMOVED, PositionEntry::new(0, 0))
    }

    // ------------------------------------------------------------------
    // lookups
    // ------------------------------------------------------------------

    /// Returns the head location of a `FILLED` position, `None` otherwise.
    /// `page_count` is forwarded to the cache as a prefetch hint.
    pub fn get(
        &self,
        op: Option<&AtomicOperation>,
        position: i64,
        page_count: u32,
    ) -> Result<Option<PositionEntry>> {
        let file_id = self.file_id()?;
        let Some((bucket, index)) = self.locate(position) else {
            return Ok(None);
        };
        if bucket >= self.filled_up_to(op, file_id)? {
            return Ok(None);
        }

        let view = self.view(op, bucket, page_count)?;
        if index >= bucket_size(&view) {
            return Ok(None);
        }
        if read_status(&view, index) != FILLED {
            return Ok(None);
        }
        Ok(Some(read_entry(&view, index)))
    }

    pub fn get_status(&self, op: Option<&AtomicOperation>, position: i64) -> Result<u8> {
        let file_id = self.file_id()?;
        let Some((bucket, index)) = self.locate(position) else {
            return Ok(NOT_EXISTENT);
        };
        if bucket >= self.filled_up_to(op, file_id)? {
            return Ok(NOT_EXISTENT);
        }

        let view = self.view(op, bucket, 1)?;
        if index >= bucket_size(&view) {
            return Ok(NOT_EXISTENT);
        }
        Ok(read_status(&view, index))
    }

    /// Lowest `FILLED` position, or -1 when the cluster holds no records.
    pub fn first_position(&self, op: Option<&AtomicOperation>) -> Result<i64> {
        let file_id = self.file_id()?;
        let buckets = self.filled_up_to(op, file_id)?;

        for bucket in 0..buckets {
            let view = self.view(op, bucket, 1)?;
            let used = bucket_size(&view);
            for index in 0..used {
                if read_status(&view, index) == FILLED {
                    return Ok(bucket as i64 * ENTRIES_PER_BUCKET as i64 + index as i64);
                }
            }
        }
        Ok(-1)
    }

    /// Highest `FILLED` position, or -1 when the cluster holds no records.
    pub fn last_position(&self, op: Option<&AtomicOperation>) -> Result<i64> {
        let file_id = self.file_id()?;
        let buckets = self.filled_up_to(op, file_id)?;

        for bucket in (0..buckets).rev() {
            let view = self.view(op, bucket, 1)?;
            let used = bucket_size(&view);
            for index in (0..used).rev() {
                if read_status(&view, index) == FILLED {
                    return Ok(bucket as i64 * ENTRIES_PER_BUCKET as i64 + index as i64);
                }
            }
        }
        Ok(-1)
    }

    /// The position the next allocation will receive.
    pub fn next_position(&self, op: Option<&AtomicOperation>) -> Result<i64> {
        let file_id = self.file_id()?;
        let buckets = self.filled_up_to(op, file_id)?;
        if buckets == 0 {
            return Ok(0);
        }

        let view = self.view(op, buckets - 1, 1)?;
        Ok((buckets as i64 - 1) * ENTRIES_PER_BUCKET as i64 + bucket_size(&view) as i64)
    }

    fn collect_forward(
        &self,
        op: Option<&AtomicOperation>,
        from_position: i64,
    ) -> Result<Vec<i64>> {
        let file_id = self.file_id()?;
        let buckets = self.filled_up_to(op, file_id)?;
        let from_position = from_position.max(0);
        let Some((mut bucket, mut index)) = self.locate(from_position) else {
            return Ok(Vec::new());
        };

        // results come from the first bucket that yields any, one bucket worth at most
        while bucket < buckets {
            let view = self.view(op, bucket, 1)?;
            let used = bucket_size(&view);

            let mut found = Vec::new();
            for i in index..used {
                if read_status(&view, i) == FILLED {
                    found.push(bucket as i64 * ENTRIES_PER_BUCKET as i64 + i as i64);
                }
            }
            if !found.is_empty() {
                return Ok(found);
            }

            bucket += 1;
            index = 0;
        }
        Ok(Vec::new())
    }

    fn collect_backward(&self, op: Option<&AtomicOperation>, from_position: i64) -> Result<Vec<i64>> {
        let file_id = self.file_id()?;
        let buckets = self.filled_up_to(op, file_id)?;
        if from_position < 0 || buckets == 0 {
            return Ok(Vec::new());
        }

        let last_valid = buckets as i64 * ENTRIES_PER_BUCKET as i64 - 1;
        let from_position = from_position.min(last_valid);
        let (mut bucket, mut index) = self.locate(from_position).expect("position clamped non-negative");

        loop {
            let view = self.view(op, bucket, 1)?;
            let used = bucket_size(&view);

            let mut found = Vec::new();
            let top = index.min(used.saturating_sub(1));
            for i in (0..=top).rev() {
                if used > 0 && read_status(&view, i) == FILLED {
                    found.push(bucket as i64 * ENTRIES_PER_BUCKET as i64 + i as i64);
                }
            }
            if !found.is_empty() {
                found.reverse();
                return Ok(found);
            }

            if bucket == 0 {
                return Ok(Vec::new());
            }
            bucket -= 1;
            index = ENTRIES_PER_BUCKET - 1;
        }
    }

    /// `FILLED` positions strictly greater than `position`, at most one
    /// bucket worth.
    pub fn higher_positions(&self, op: Option<&AtomicOperation>, position: i64) -> Result<Vec<i64>> {
        if position == i64::MAX {
            return Ok(Vec::new());
        }
        self.collect_forward(op, position + 1)
    }

    /// `FILLED` positions greater than or equal to `position`.
    pub fn ceiling_positions(&self, op: Option<&AtomicOperation>, position: i64) -> Result<Vec<i64>> {
        self.collect_forward(op, position)
    }

    /// `FILLED` positions strictly lower than `position`.
    pub fn lower_positions(&self, op: Option<&AtomicOperation>, position: i64) -> Result<Vec<i64>> {
        self.collect_backward(op, position - 1)
    }

    /// `FILLED` positions lower than or equal to `position`.
    pub fn floor_positions(&self, op: Option<&AtomicOperation>, position: i64) -> Result<Vec<i64>> {
        self.collect_backward(op, position)
    }
}
