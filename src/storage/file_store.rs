//! # Paged File Storage
//!
//! `PagedFile` is the low-level building block for page-granular file
//! access. A database file is nothing but concatenated fixed-size pages:
//!
//! ```text
//! Offset 0:        Page 0 (64KB)
//! Offset 65536:    Page 1 (64KB)
//! Offset 131072:   Page 2 (64KB)
//! ...
//! ```
//!
//! The file size is always a multiple of `PAGE_SIZE`; a file that is not is
//! rejected on open as torn or foreign.
//!
//! ## I/O Model
//!
//! Positioned reads and writes under a `parking_lot::Mutex` — the portable
//! seek-then-read pattern. Pages read from disk land directly in
//! caller-provided buffers (the page cache's frames or an atomic operation's
//! copy-on-write buffers), so no intermediate copies are made here.
//!
//! Writes past the current end grow the file implicitly; the page count only
//! ever moves forward except through [`PagedFile::truncate`].
//!
//! ## Durability
//!
//! `sync()` maps to `File::sync_data`. Ordering against the commit journal
//! is the concern of the atomic-operations layer: journal frames are always
//! written and synced before the pages they describe reach this file.
//!
//! ## Thread Safety
//!
//! `PagedFile` is `Send + Sync`; the internal mutex serializes file-handle
//! positioning. Concurrency above page granularity (pinning, visibility) is
//! provided by the page cache and the atomic-operations manager.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct PagedFile {
    file: Mutex<File>,
    path: PathBuf,
    page_count: AtomicU64,
}

impl PagedFile {
    /// Creates a new, empty paged file. Fails if the path already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create paged file '{}'", path.display()))?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            page_count: AtomicU64::new(0),
        })
    }

    /// Opens an existing paged file and validates its geometry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open paged file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "file '{}' is not page aligned: {} bytes is not a multiple of {}",
            path.display(),
            len,
            PAGE_SIZE
        );

        Ok(Self {
            file: Mutex::new(file),
            path,
            page_count: AtomicU64::new(len / PAGE_SIZE as u64),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::Acquire)
    }

    /// Reads one page into `buf`. `buf` must be exactly `PAGE_SIZE` bytes.
    pub fn read_page_into(&self, page_no: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == PAGE_SIZE,
            "page buffer has {} bytes, expected {}",
            buf.len(),
            PAGE_SIZE
        );
        ensure!(
            page_no < self.page_count(),
            "page {} out of bounds for '{}' ({} pages)",
            page_no,
            self.path.display(),
            self.page_count()
        );

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no * PAGE_SIZE as u64))
            .wrap_err_with(|| format!("failed to seek to page {} in '{}'", page_no, self.path.display()))?;
        file.read_exact(buf)
            .wrap_err_with(|| format!("failed to read page {} from '{}'", page_no, self.path.display()))?;

        Ok(())
    }

    /// Writes one page, growing the file when `page_no` is past the end.
    /// Only appends at exactly `page_count` are allowed as growth; holes are
    /// rejected to keep the page count meaningful.
    pub fn write_page(&self, page_no: u64, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == PAGE_SIZE,
            "page buffer has {} bytes, expected {}",
            data.len(),
            PAGE_SIZE
        );

        let count = self.page_count();
        ensure!(
            page_no <= count,
            "write to page {} would leave a hole in '{}' ({} pages)",
            page_no,
            self.path.display(),
            count
        );

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no * PAGE_SIZE as u64))
            .wrap_err_with(|| format!("failed to seek to page {} in '{}'", page_no, self.path.display()))?;
        file.write_all(data)
            .wrap_err_with(|| format!("failed to write page {} to '{}'", page_no, self.path.display()))?;

        if page_no == count {
            self.page_count.store(count + 1, Ordering::Release);
        }

        Ok(())
    }

    /// Drops every page. The file stays on disk with zero length.
    pub fn truncate(&self) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;
        self.page_count.store(0, Ordering::Release);
        Ok(())
    }

    /// Replaces the whole content with the bytes of another file on disk.
    pub fn replace_content_with(&self, source: &Path) -> Result<()> {
        let bytes = std::fs::read(source)
            .wrap_err_with(|| format!("failed to read replacement content '{}'", source.display()))?;
        ensure!(
            bytes.len() % PAGE_SIZE == 0,
            "replacement content '{}' is not page aligned: {} bytes",
            source.display(),
            bytes.len()
        );

        let mut file = self.file.lock();
        file.set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;
        file.seek(SeekFrom::Start(0))
            .wrap_err_with(|| format!("failed to rewind '{}'", self.path.display()))?;
        file.write_all(&bytes)
            .wrap_err_with(|| format!("failed to rewrite '{}'", self.path.display()))?;
        self.page_count
            .store(bytes.len() as u64 / PAGE_SIZE as u64, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }
}
