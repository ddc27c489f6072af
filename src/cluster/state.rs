//! # Cluster State Page
//!
//! Page 0 of the data file. Holds the aggregate counters (`size`,
//! `records_size`) and the head page index of every free-space bucket. The
//! page is pinned in the cache for the cluster's whole lifetime and loaded
//! for write by every state-changing operation — the cluster-level
//! exclusive lock already serializes mutators, so the hot spot is harmless.

use eyre::{ensure, Result};
use zerocopy::little_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FREE_LIST_SIZE, PAGE_SIZE};
use crate::storage::{parse_zerocopy, parse_zerocopy_mut};

pub const STATE_MAGIC: &[u8; 16] = b"PCL Cluster v1\x00\x00";

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ClusterStateHeader {
    magic: [u8; 16],
    size: I64,
    records_size: I64,
    free_list: [I64; FREE_LIST_SIZE],
}

const _: () = assert!(std::mem::size_of::<ClusterStateHeader>() <= PAGE_SIZE);

impl ClusterStateHeader {
    zerocopy_accessors! {
        size: i64,
        records_size: i64,
    }

    /// Formats a freshly added page 0: zero counters, every bucket empty.
    pub fn init(page: &mut [u8]) -> Result<&mut Self> {
        let header = parse_zerocopy_mut::<Self>(page, "ClusterStateHeader")?;
        header.magic = *STATE_MAGIC;
        header.size = I64::new(0);
        header.records_size = I64::new(0);
        for head in header.free_list.iter_mut() {
            *head = I64::new(-1);
        }
        Ok(header)
    }

    pub fn from_page(page: &[u8]) -> Result<&Self> {
        let header = parse_zerocopy::<Self>(page, "ClusterStateHeader")?;
        ensure!(
            &header.magic == STATE_MAGIC,
            "invalid magic bytes in cluster state page"
        );
        Ok(header)
    }

    pub fn from_page_mut(page: &mut [u8]) -> Result<&mut Self> {
        let header = parse_zerocopy_mut::<Self>(page, "ClusterStateHeader")?;
        ensure!(
            &header.magic == STATE_MAGIC,
            "invalid magic bytes in cluster state page"
        );
        Ok(header)
    }

    pub fn get_free_list_page(&self, bucket: usize) -> Result<i64> {
        ensure!(
            bucket < FREE_LIST_SIZE,
            "free-list bucket {} out of range ({})",
            bucket,
            FREE_LIST_SIZE
        );
        Ok(self.free_list[bucket].get())
    }

    pub fn set_free_list_page(&mut self, bucket: usize, page_index: i64) -> Result<()> {
        ensure!(
            bucket < FREE_LIST_SIZE,
            "free-list bucket {} out of range ({})",
            bucket,
            FREE_LIST_SIZE
        );
        self.free_list[bucket] = I64::new(page_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_zeroes_counters_and_empties_buckets() {
        let mut page = vec![0u8; PAGE_SIZE];
        ClusterStateHeader::init(&mut page).unwrap();

        let state = ClusterStateHeader::from_page(&page).unwrap();
        assert_eq!(state.size(), 0);
        assert_eq!(state.records_size(), 0);
        for bucket in 0..FREE_LIST_SIZE {
            assert_eq!(state.get_free_list_page(bucket).unwrap(), -1);
        }
    }

    #[test]
    fn counters_and_heads_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        ClusterStateHeader::init(&mut page).unwrap();

        {
            let state = ClusterStateHeader::from_page_mut(&mut page).unwrap();
            state.set_size(12);
            state.set_records_size(3400);
            state.set_free_list_page(5, 77).unwrap();
        }

        let state = ClusterStateHeader::from_page(&page).unwrap();
        assert_eq!(state.size(), 12);
        assert_eq!(state.records_size(), 3400);
        assert_eq!(state.get_free_list_page(5).unwrap(), 77);
        assert_eq!(state.get_free_list_page(6).unwrap(), -1);
    }

    #[test]
    fn foreign_page_is_rejected() {
        let page = vec![0u8; PAGE_SIZE];
        assert!(ClusterStateHeader::from_page(&page).is_err());
    }

    #[test]
    fn bucket_bounds_are_checked() {
        let mut page = vec![0u8; PAGE_SIZE];
        let state = ClusterStateHeader::init(&mut page).unwrap();
        assert!(state.get_free_list_page(FREE_LIST_SIZE).is_err());
    }
}
