//! # File Registry
//!
//! The registry owns every paged file of one storage directory and hands out
//! stable numeric file ids. Components above it (page cache, atomic
//! operations, clusters) never touch paths; they speak file ids.
//!
//! ## Directory Structure
//!
//! All files of a storage live flat in one directory:
//!
//! ```text
//! storage_dir/
//! ├── users.pcl            # cluster data file
//! ├── users.cpm            # cluster position map
//! ├── invoices.pcl
//! ├── invoices.cpm
//! └── journal.wal          # commit journal (atomic-operations manager)
//! ```
//!
//! ## Lifecycle Operations
//!
//! - `add_file` creates a new empty file and registers it
//! - `open_file` registers an existing file (idempotent per name)
//! - `rename_file` renames on disk and rebinds the name index
//! - `delete_file` unregisters and unlinks
//! - `truncate_file` drops all pages, keeping the id
//! - `replace_file_content_with` swaps in the bytes of a staged file —
//!   the building block for atomically replacing a cluster's backing file
//!
//! ## Thread Safety
//!
//! A single `RwLock` guards the id/name maps; the `PagedFile`s themselves
//! are shared via `Arc` and do their own per-handle locking, so page I/O on
//! two different files never contends here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::file_store::PagedFile;

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    by_name: HashMap<String, u64>,
    names: HashMap<u64, String>,
    files: HashMap<u64, Arc<PagedFile>>,
}

#[derive(Debug)]
pub struct FileRegistry {
    base_dir: PathBuf,
    inner: RwLock<RegistryInner>,
}

impl FileRegistry {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)
            .wrap_err_with(|| format!("failed to create storage directory '{}'", base_dir.display()))?;

        Ok(Self {
            base_dir,
            inner: RwLock::new(RegistryInner::default()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Creates a new empty file and registers it under `name`.
    pub fn add_file(&self, name: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        ensure!(
            !inner.by_name.contains_key(name),
            "file '{}' is already registered",
            name
        );

        let file = PagedFile::create(self.path_of(name))?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_name.insert(name.to_string(), id);
        inner.names.insert(id, name.to_string());
        inner.files.insert(id, Arc::new(file));
        Ok(id)
    }

    /// Registers an existing file. Returns the already assigned id when the
    /// name is known.
    pub fn open_file(&self, name: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_name.get(name) {
            return Ok(id);
        }

        let file = PagedFile::open(self.path_of(name))?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_name.insert(name.to_string(), id);
        inner.names.insert(id, name.to_string());
        inner.files.insert(id, Arc::new(file));
        Ok(id)
    }

    /// Whether a file with this name exists, registered or on disk.
    pub fn exists(&self, name: &str) -> bool {
        self.inner.read().by_name.contains_key(name) || self.path_of(name).exists()
    }

    pub fn file_id_by_name(&self, name: &str) -> Option<u64> {
        self.inner.read().by_name.get(name).copied()
    }

    pub fn file_name_by_id(&self, file_id: u64) -> Option<String> {
        self.inner.read().names.get(&file_id).cloned()
    }

    fn entry(&self, file_id: u64) -> Result<Arc<PagedFile>> {
        match self.inner.read().files.get(&file_id) {
            Some(file) => Ok(Arc::clone(file)),
            None => bail!("unknown file id {}", file_id),
        }
    }

    /// Unregisters the file and removes it from disk.
    pub fn delete_file(&self, file_id: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(name) = inner.names.remove(&file_id) else {
            bail!("unknown file id {}", file_id);
        };
        inner.by_name.remove(&name);
        inner.files.remove(&file_id);
        drop(inner);

        std::fs::remove_file(self.path_of(&name))
            .wrap_err_with(|| format!("failed to remove file '{}'", name))
    }

    pub fn truncate_file(&self, file_id: u64) -> Result<()> {
        self.entry(file_id)?.truncate()
    }

    /// Renames on disk and rebinds the name index. The open handle stays
    /// valid across the rename.
    pub fn rename_file(&self, file_id: u64, new_name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(old_name) = inner.names.get(&file_id).cloned() else {
            bail!("unknown file id {}", file_id);
        };
        ensure!(
            !inner.by_name.contains_key(new_name),
            "cannot rename '{}' to '{}': target name is taken",
            old_name,
            new_name
        );

        std::fs::rename(self.path_of(&old_name), self.path_of(new_name))
            .wrap_err_with(|| format!("failed to rename '{}' to '{}'", old_name, new_name))?;

        inner.by_name.remove(&old_name);
        inner.by_name.insert(new_name.to_string(), file_id);
        inner.names.insert(file_id, new_name.to_string());
        Ok(())
    }

    /// Overwrites the registered file with the content of `source`.
    pub fn replace_file_content_with(&self, file_id: u64, source: &Path) -> Result<()> {
        self.entry(file_id)?.replace_content_with(source)
    }

    pub fn page_count(&self, file_id: u64) -> Result<u64> {
        Ok(self.entry(file_id)?.page_count())
    }

    pub fn read_page_into(&self, file_id: u64, page_no: u64, buf: &mut [u8]) -> Result<()> {
        self.entry(file_id)?.read_page_into(page_no, buf)
    }

    pub fn write_page(&self, file_id: u64, page_no: u64, data: &[u8]) -> Result<()> {
        self.entry(file_id)?.write_page(page_no, data)
    }

    pub fn flush(&self, file_id: u64) -> Result<()> {
        self.entry(file_id)?.sync()
    }

    pub fn flush_all(&self) -> Result<()> {
        let files: Vec<_> = self.inner.read().files.values().cloned().collect();
        for file in files {
            file.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use tempfile::tempdir;

    #[test]
    fn add_open_and_lookup() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::new(dir.path()).unwrap();

        let id = registry.add_file("users.pcl").unwrap();
        assert_eq!(registry.file_id_by_name("users.pcl"), Some(id));
        assert_eq!(registry.file_name_by_id(id).as_deref(), Some("users.pcl"));
        assert!(registry.exists("users.pcl"));

        // open_file on a registered name hands back the same id
        assert_eq!(registry.open_file("users.pcl").unwrap(), id);
    }

    #[test]
    fn add_file_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::new(dir.path()).unwrap();

        registry.add_file("a.pcl").unwrap();
        assert!(registry.add_file("a.pcl").is_err());
    }

    #[test]
    fn rename_rebinds_name_index() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::new(dir.path()).unwrap();

        let id = registry.add_file("old.pcl").unwrap();
        registry.write_page(id, 0, &[7u8; PAGE_SIZE]).unwrap();

        registry.rename_file(id, "new.pcl").unwrap();

        assert!(!registry.exists("old.pcl"));
        assert!(registry.exists("new.pcl"));
        assert_eq!(registry.file_id_by_name("new.pcl"), Some(id));

        let mut buf = vec![0u8; PAGE_SIZE];
        registry.read_page_into(id, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn delete_unregisters_and_unlinks() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::new(dir.path()).unwrap();

        let id = registry.add_file("gone.pcl").unwrap();
        registry.delete_file(id).unwrap();

        assert!(!registry.exists("gone.pcl"));
        assert!(registry.page_count(id).is_err());
        assert!(!dir.path().join("gone.pcl").exists());
    }

    #[test]
    fn replace_content_swaps_pages() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::new(dir.path()).unwrap();

        let id = registry.add_file("data.pcl").unwrap();
        registry.write_page(id, 0, &[1u8; PAGE_SIZE]).unwrap();

        let staged = dir.path().join("staged");
        std::fs::write(&staged, vec![9u8; 2 * PAGE_SIZE]).unwrap();

        registry.replace_file_content_with(id, &staged).unwrap();

        assert_eq!(registry.page_count(id).unwrap(), 2);
        let mut buf = vec![0u8; PAGE_SIZE];
        registry.read_page_into(id, 1, &mut buf).unwrap();
        assert_eq!(buf[0], 9);
    }
}
