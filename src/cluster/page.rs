//! # Cluster Page
//!
//! Interprets one fixed-size frame as a slotted record container. Chunks of
//! records live in a content area that grows down from the page end; a slot
//! directory growing up from the header addresses them by stable slot id.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------------------------
//! 0       4     free_position   start of the content area
//! 4       4     free_space      logical free bytes (see below)
//! 8       2     entry_count     live records
//! 10      2     slot_count      directory size, holes included
//! 12      4     reserved
//! 16      8     prev_page       free-list back link (-1 none)
//! 24      8     next_page       free-list forward link (-1 none)
//! 32      12*N  slot directory  [offset u32][len u32|DELETED][version u32]
//! ...           free gap
//! free_position END             record content, grows downward
//! ```
//!
//! The header and the slot directory entries are zerocopy structs read
//! straight from the page buffer; only the record content area itself is
//! raw bytes.
//!
//! ## Accounting
//!
//! `free_space` is the logical counter the cluster uses for its
//! `records_size` bookkeeping: every live record costs its chunk length plus
//! one slot directory entry, and deletion refunds both. The physically
//! appendable span is [`ClusterPage::get_max_record_size`] — deletion
//! compacts the content area eagerly (shifting bytes and patching slot
//! offsets), so the two only diverge by the directory holes awaiting reuse.
//!
//! Slot ids are stable across compaction and may be reused after deletion;
//! chain pointers between record chunks reference `(page, slot)` and never
//! raw offsets.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{I64, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE, SLOT_SIZE};
use crate::storage::{parse_zerocopy, parse_zerocopy_mut};

const DELETED_FLAG: u32 = 1 << 31;
const LEN_MASK: u32 = !DELETED_FLAG;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ClusterPageHeader {
    free_position: U32,
    free_space: U32,
    entry_count: U16,
    slot_count: U16,
    reserved: [u8; 4],
    prev_page: I64,
    next_page: I64,
}

const _: () = assert!(std::mem::size_of::<ClusterPageHeader>() == PAGE_HEADER_SIZE);

impl ClusterPageHeader {
    zerocopy_accessors! {
        free_position: u32,
        free_space: u32,
        entry_count: u16,
        slot_count: u16,
        prev_page: i64,
        next_page: i64,
    }
}

/// One slot directory entry. Bit 31 of `len_flags` marks a deleted hole.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Slot {
    offset: U32,
    len_flags: U32,
    version: U32,
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    fn live(offset: u32, len: u32, version: i32) -> Self {
        Self {
            offset: U32::new(offset),
            len_flags: U32::new(len & LEN_MASK),
            version: U32::new(version as u32),
        }
    }

    fn hole() -> Self {
        Self {
            offset: U32::new(0),
            len_flags: U32::new(DELETED_FLAG),
            version: U32::new(0),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset.get() as usize
    }

    pub fn len(&self) -> usize {
        (self.len_flags.get() & LEN_MASK) as usize
    }

    pub fn is_deleted(&self) -> bool {
        self.len_flags.get() & DELETED_FLAG != 0
    }

    pub fn version(&self) -> i32 {
        self.version.get() as i32
    }

    fn set_offset(&mut self, offset: u32) {
        self.offset = U32::new(offset);
    }

    fn set_version(&mut self, version: i32) {
        self.version = U32::new(version as u32);
    }
}

/// Slotted view over one page buffer. Read-only over `&[u8]`, mutable over
/// `&mut [u8]`.
pub struct ClusterPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> ClusterPage<B> {
    pub fn attach(buf: B) -> Self {
        debug_assert_eq!(buf.as_ref().len(), PAGE_SIZE);
        Self { buf }
    }

    fn header(&self) -> &ClusterPageHeader {
        parse_zerocopy(self.buf.as_ref(), "ClusterPageHeader")
            .expect("page buffer holds at least a header") // INVARIANT: attach requires PAGE_SIZE bytes
    }

    fn slot(&self, index: usize) -> Option<Slot> {
        if index >= self.header().slot_count() as usize {
            return None;
        }
        let at = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        let slot = Slot::ref_from_bytes(&self.buf.as_ref()[at..at + SLOT_SIZE])
            .expect("slot directory stays inside the page"); // INVARIANT: slot_count is bounded by the free gap
        Some(*slot)
    }

    fn live_slot(&self, index: usize) -> Result<Slot> {
        match self.slot(index) {
            Some(slot) if !slot.is_deleted() => Ok(slot),
            Some(_) => bail!("slot {} is deleted", index),
            None => bail!(
                "slot {} is out of range ({} slots)",
                index,
                self.header().slot_count()
            ),
        }
    }

    /// Resolves a record-relative offset; negative values address from the
    /// record's end.
    fn resolve_offset(slot: Slot, offset: i32, width: usize) -> Result<usize> {
        let relative = if offset < 0 {
            let back = (-offset) as usize;
            ensure!(back <= slot.len(), "offset {} reaches before the record start", offset);
            slot.len() - back
        } else {
            offset as usize
        };
        ensure!(
            relative + width <= slot.len(),
            "range [{}, {}) is outside a {}-byte record",
            relative,
            relative + width,
            slot.len()
        );
        Ok(slot.offset() + relative)
    }

    pub fn is_deleted(&self, index: usize) -> bool {
        match self.slot(index) {
            Some(slot) => slot.is_deleted(),
            None => true,
        }
    }

    pub fn get_record_size(&self, index: usize) -> Result<usize> {
        Ok(self.live_slot(index)?.len())
    }

    pub fn get_record_version(&self, index: usize) -> Result<i32> {
        Ok(self.live_slot(index)?.version())
    }

    pub fn get_record_binary_value(&self, index: usize, offset: i32, len: usize) -> Result<Vec<u8>> {
        let slot = self.live_slot(index)?;
        let start = Self::resolve_offset(slot, offset, len)?;
        Ok(self.buf.as_ref()[start..start + len].to_vec())
    }

    pub fn get_record_byte_value(&self, index: usize, offset: i32) -> Result<u8> {
        let slot = self.live_slot(index)?;
        let at = Self::resolve_offset(slot, offset, 1)?;
        Ok(self.buf.as_ref()[at])
    }

    pub fn get_record_long_value(&self, index: usize, offset: i32) -> Result<i64> {
        let slot = self.live_slot(index)?;
        let at = Self::resolve_offset(slot, offset, 8)?;
        let bytes = self.buf.as_ref();
        Ok(i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()))
    }

    pub fn get_free_space(&self) -> usize {
        self.header().free_space() as usize
    }

    /// Largest chunk `append_record` can currently place, accounting for a
    /// fresh directory entry unless a hole is free for reuse.
    pub fn get_max_record_size(&self) -> usize {
        let dir_end = PAGE_HEADER_SIZE + self.header().slot_count() as usize * SLOT_SIZE;
        let gap = (self.header().free_position() as usize).saturating_sub(dir_end);

        if self.has_hole() {
            gap
        } else {
            gap.saturating_sub(SLOT_SIZE)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header().entry_count() == 0
    }

    pub fn get_entry_count(&self) -> usize {
        self.header().entry_count() as usize
    }

    pub fn get_prev_page(&self) -> i64 {
        self.header().prev_page()
    }

    pub fn get_next_page(&self) -> i64 {
        self.header().next_page()
    }

    fn has_hole(&self) -> bool {
        (0..self.header().slot_count() as usize)
            .any(|i| self.slot(i).map(|s| s.is_deleted()).unwrap_or(false))
    }

    /// Human-readable dump for the log when the page state contradicts the
    /// free list. Slots only; content bytes are omitted.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;

        let header = self.header();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "free_position={} free_space={} entry_count={} slot_count={} prev={} next={}",
            header.free_position(),
            header.free_space(),
            header.entry_count(),
            header.slot_count(),
            header.prev_page(),
            header.next_page(),
        );
        for i in 0..header.slot_count() as usize {
            if let Some(slot) = self.slot(i) {
                let _ = writeln!(
                    out,
                    "  slot {}: offset={} len={} deleted={} version={}",
                    i,
                    slot.offset(),
                    slot.len(),
                    slot.is_deleted(),
                    slot.version()
                );
            }
        }
        out
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> ClusterPage<B> {
    /// Initializes a freshly allocated page: empty directory, full free
    /// space, detached from every free list.
    pub fn format(mut buf: B) -> Self {
        {
            let bytes = buf.as_mut();
            bytes[..PAGE_HEADER_SIZE].fill(0);
            let header = parse_zerocopy_mut::<ClusterPageHeader>(bytes, "ClusterPageHeader")
                .expect("page buffer holds at least a header"); // INVARIANT: callers hand over PAGE_SIZE buffers
            header.set_free_position(PAGE_SIZE as u32);
            header.set_free_space((PAGE_SIZE - PAGE_HEADER_SIZE) as u32);
            header.set_prev_page(-1);
            header.set_next_page(-1);
        }
        Self { buf }
    }

    fn header_mut(&mut self) -> &mut ClusterPageHeader {
        parse_zerocopy_mut(self.buf.as_mut(), "ClusterPageHeader")
            .expect("page buffer holds at least a header") // INVARIANT: attach requires PAGE_SIZE bytes
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot {
        debug_assert!(index < self.header().slot_count() as usize);
        let at = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        Slot::mut_from_bytes(&mut self.buf.as_mut()[at..at + SLOT_SIZE])
            .expect("slot directory stays inside the page") // INVARIANT: slot_count is bounded by the free gap
    }

    /// Appends a record chunk. Returns the slot index, or -1 when the page
    /// lacks contiguous room.
    pub fn append_record(&mut self, version: i32, content: &[u8]) -> i64 {
        let slot_count = self.header().slot_count() as usize;
        let hole = (0..slot_count).find(|&i| self.slot(i).map(|s| s.is_deleted()).unwrap_or(false));

        let dir_end = PAGE_HEADER_SIZE + slot_count * SLOT_SIZE;
        let mut gap = (self.header().free_position() as usize).saturating_sub(dir_end);
        if hole.is_none() {
            gap = gap.saturating_sub(SLOT_SIZE);
        }
        if content.len() > gap {
            return -1;
        }

        let new_position = self.header().free_position() as usize - content.len();
        self.buf.as_mut()[new_position..new_position + content.len()].copy_from_slice(content);

        let index = hole.unwrap_or(slot_count);
        {
            let header = self.header_mut();
            header.set_free_position(new_position as u32);
            if index == slot_count {
                header.set_slot_count((slot_count + 1) as u16);
            }
            let entries = header.entry_count() + 1;
            header.set_entry_count(entries);
            let free = header.free_space() - (content.len() + SLOT_SIZE) as u32;
            header.set_free_space(free);
        }
        *self.slot_mut(index) = Slot::live(new_position as u32, content.len() as u32, version);

        index as i64
    }

    /// Overwrites a record in place. The replacement must have the exact
    /// length of the stored chunk.
    pub fn replace_record(&mut self, index: usize, content: &[u8], version: i32) -> Result<()> {
        let slot = self.live_slot(index)?;
        ensure!(
            slot.len() == content.len(),
            "replacement of slot {} must keep its {} bytes, got {}",
            index,
            slot.len(),
            content.len()
        );

        let offset = slot.offset();
        self.buf.as_mut()[offset..offset + content.len()].copy_from_slice(content);
        self.slot_mut(index).set_version(version);
        Ok(())
    }

    /// Deletes a record and compacts the content area so the reclaimed bytes
    /// become contiguous free room again.
    pub fn delete_record(&mut self, index: usize) -> Result<()> {
        let slot = self.live_slot(index)?;
        let free_position = self.header().free_position() as usize;
        let offset = slot.offset();
        let len = slot.len();

        // close the gap: shift everything below the record up by its length
        self.buf
            .as_mut()
            .copy_within(free_position..offset, free_position + len);

        // patch offsets of slots whose content sat below the deleted record
        let slot_count = self.header().slot_count() as usize;
        for i in 0..slot_count {
            if i == index {
                continue;
            }
            if let Some(other) = self.slot(i) {
                if !other.is_deleted() && other.offset() < offset {
                    self.slot_mut(i).set_offset((other.offset() + len) as u32);
                }
            }
        }

        {
            let header = self.header_mut();
            header.set_free_position((free_position + len) as u32);
            let entries = header.entry_count() - 1;
            header.set_entry_count(entries);
            let free = header.free_space() + (len + SLOT_SIZE) as u32;
            header.set_free_space(free);
        }
        *self.slot_mut(index) = Slot::hole();

        // trailing holes can leave the directory entirely
        let mut slots = self.header().slot_count() as usize;
        while slots > 0 && self.slot(slots - 1).map(|s| s.is_deleted()).unwrap_or(false) {
            slots -= 1;
        }
        self.header_mut().set_slot_count(slots as u16);

        Ok(())
    }

    pub fn set_record_long_value(&mut self, index: usize, offset: i32, value: i64) -> Result<()> {
        let slot = self.live_slot(index)?;
        let at = Self::resolve_offset(slot, offset, 8)?;
        self.buf.as_mut()[at..at + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn set_prev_page(&mut self, page_index: i64) {
        self.header_mut().set_prev_page(page_index);
    }

    pub fn set_next_page(&mut self, page_index: i64) {
        self.header_mut().set_next_page(page_index);
    }
}
