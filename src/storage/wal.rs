//! # Commit Journal
//!
//! Write-ahead journal for atomic operations. Every page image an operation
//! buffered is appended as a frame, followed by a commit marker; only then
//! are the pages written through to their files. After a crash, operations
//! with a commit marker are replayed and a trailing markerless operation is
//! discarded — the files never see half an operation.
//!
//! ## Frame Format
//!
//! ```text
//! +------------------+-----------+------------------+
//! | Frame Header     | File Name | Page Data        |
//! | (32 bytes)       | (n bytes) | (65536 bytes)    |
//! +------------------+-----------+------------------+
//! ```
//!
//! Header fields:
//! - `op_id`: id of the atomic operation the frame belongs to
//! - `page_index`: page within the named file
//! - `flags`: `FRAME_COMMIT` marks the end of an operation (no name, no data)
//! - `name_len`: length of the file-name bytes that follow
//! - `checksum`: CRC64 over header fields, name, and page data
//!
//! A frame with a bad checksum or a short read is treated as end-of-log;
//! that is the normal shape of a crash mid-append.
//!
//! ## Write Protocol
//!
//! 1. Append one page frame per buffered page
//! 2. Append the commit frame
//! 3. `sync` the journal
//! 4. Write pages through to the data files
//! 5. Truncate the journal once the files are synced (checkpoint)

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_SIZE;

use super::registry::FileRegistry;

pub const JOURNAL_FILE_NAME: &str = "journal.wal";
pub const FRAME_HEADER_SIZE: usize = 32;

pub const FRAME_PAGE: u32 = 0;
pub const FRAME_COMMIT: u32 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FrameHeader {
    op_id: U64,
    page_index: U64,
    flags: U32,
    name_len: U32,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);

impl FrameHeader {
    fn new(op_id: u64, page_index: u64, flags: u32, name_len: u32, checksum: u64) -> Self {
        Self {
            op_id: U64::new(op_id),
            page_index: U64::new(page_index),
            flags: U32::new(flags),
            name_len: U32::new(name_len),
            checksum: U64::new(checksum),
        }
    }

    pub fn op_id(&self) -> u64 {
        self.op_id.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }
}

fn frame_checksum(op_id: u64, page_index: u64, flags: u32, name: &[u8], data: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&op_id.to_le_bytes());
    digest.update(&page_index.to_le_bytes());
    digest.update(&flags.to_le_bytes());
    digest.update(&(name.len() as u32).to_le_bytes());
    digest.update(name);
    digest.update(data);
    digest.finalize()
}

pub struct CommitJournal {
    file: File,
    path: PathBuf,
}

impl CommitJournal {
    /// Opens the journal in `dir`, creating it when absent.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open commit journal '{}'", path.display()))?;

        Ok(Self { file, path })
    }

    fn append(&mut self, op_id: u64, page_index: u64, flags: u32, name: &[u8], data: &[u8]) -> Result<()> {
        let checksum = frame_checksum(op_id, page_index, flags, name, data);
        let header = FrameHeader::new(op_id, page_index, flags, name.len() as u32, checksum);

        self.file
            .seek(SeekFrom::End(0))
            .wrap_err("failed to seek to journal end")?;
        self.file
            .write_all(header.as_bytes())
            .wrap_err("failed to append journal frame header")?;
        if !name.is_empty() {
            self.file
                .write_all(name)
                .wrap_err("failed to append journal frame file name")?;
        }
        if !data.is_empty() {
            self.file
                .write_all(data)
                .wrap_err("failed to append journal frame page data")?;
        }
        Ok(())
    }

    /// Appends one buffered page image.
    pub fn append_page(&mut self, op_id: u64, file_name: &str, page_index: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.append(op_id, page_index, FRAME_PAGE, file_name.as_bytes(), data)
    }

    /// Appends the commit marker that makes an operation durable.
    pub fn append_commit(&mut self, op_id: u64) -> Result<()> {
        self.append(op_id, 0, FRAME_COMMIT, &[], &[])
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync journal '{}'", self.path.display()))
    }

    /// Drops every frame. Called after the data files are durable.
    pub fn truncate(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate journal '{}'", self.path.display()))?;
        self.file.sync_data().wrap_err("failed to sync truncated journal")
    }

    /// Replays committed operations into the registry's files and truncates
    /// the journal. Returns the number of pages applied.
    pub fn recover(&mut self, registry: &FileRegistry) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to rewind journal for recovery")?;

        let mut pending: HashMap<u64, Vec<(String, u64, Vec<u8>)>> = HashMap::new();
        let mut committed: Vec<(String, u64, Vec<u8>)> = Vec::new();

        loop {
            let mut header_buf = [0u8; FRAME_HEADER_SIZE];
            match self.file.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(_) => break,
            }

            let Ok(header) = FrameHeader::ref_from_bytes(&header_buf) else {
                break;
            };
            let op_id = header.op_id.get();
            let flags = header.flags.get();
            let name_len = header.name_len.get() as usize;

            if flags == FRAME_COMMIT {
                let expected = frame_checksum(op_id, header.page_index.get(), flags, &[], &[]);
                if expected != header.checksum.get() {
                    break;
                }
                if let Some(pages) = pending.remove(&op_id) {
                    committed.extend(pages);
                }
                continue;
            }

            let mut name = vec![0u8; name_len];
            if self.file.read_exact(&mut name).is_err() {
                break;
            }
            let mut data = vec![0u8; PAGE_SIZE];
            if self.file.read_exact(&mut data).is_err() {
                break;
            }

            let expected = frame_checksum(op_id, header.page_index.get(), flags, &name, &data);
            if expected != header.checksum.get() {
                break;
            }

            let Ok(name) = String::from_utf8(name) else {
                break;
            };
            pending
                .entry(op_id)
                .or_default()
                .push((name, header.page_index.get(), data));
        }

        let applied = committed.len();
        if applied > 0 {
            debug!(pages = applied, "replaying committed journal frames");
        }

        // group by file, apply in page order so growth stays contiguous
        let mut by_file: HashMap<String, Vec<(u64, Vec<u8>)>> = HashMap::new();
        for (name, page_index, data) in committed {
            by_file.entry(name).or_default().push((page_index, data));
        }

        for (name, mut pages) in by_file {
            let file_id = if registry.exists(&name) {
                registry.open_file(&name)?
            } else {
                registry.add_file(&name)?
            };

            pages.sort_by_key(|(page_index, _)| *page_index);
            let zero = vec![0u8; PAGE_SIZE];
            for (page_index, data) in pages {
                while registry.page_count(file_id)? < page_index {
                    let next = registry.page_count(file_id)?;
                    registry.write_page(file_id, next, &zero)?;
                }
                registry.write_page(file_id, page_index, &data)?;
            }
            registry.flush(file_id)?;
        }

        self.truncate()?;
        Ok(applied)
    }
}
