//! Atomicity and failure semantics: a failed mutator rolls back every page
//! it touched, committed state survives, and the journal replays after a
//! crash.

use std::sync::Arc;

use clusterdb::cluster::{PaginatedCluster, PhysicalPosition, RecordStatus};
use clusterdb::storage::CommitJournal;
use clusterdb::{ClusterError, LocalStorage};
use tempfile::tempdir;

fn open_cluster(dir: &std::path::Path, name: &str) -> (Arc<LocalStorage>, PaginatedCluster) {
    let storage = LocalStorage::open(dir).unwrap();
    let cluster = PaginatedCluster::configure(&storage, 0, name).unwrap();
    cluster.create(0).unwrap();
    (storage, cluster)
}

fn bogus_allocated_position(cluster_position: i64) -> PhysicalPosition {
    PhysicalPosition {
        cluster_position,
        record_type: 0x0B,
        record_size: -1,
        record_version: -1,
    }
}

#[test]
fn failed_create_rolls_back_pages_and_counters() {
    let dir = tempdir().unwrap();
    let (storage, cluster) = open_cluster(dir.path(), "rollback");

    let file_id = cluster.get_file_id().unwrap();
    let pages_before = storage.registry().page_count(file_id).unwrap();

    // binding to a never-allocated position fails after the chunks were
    // already placed inside the operation
    let err = cluster
        .create_record(&[0x99; 500], 1, 0x0B, Some(&bogus_allocated_position(777)))
        .unwrap_err();
    assert!(err.downcast_ref::<ClusterError>().is_some());

    assert_eq!(storage.registry().page_count(file_id).unwrap(), pages_before);
    assert_eq!(cluster.get_entries().unwrap(), 0);
    assert_eq!(cluster.get_records_size().unwrap(), 0);
    assert_eq!(cluster.get_record_status(777).unwrap(), RecordStatus::NotExistent);
}

#[test]
fn failed_spanning_create_discards_every_buffered_page() {
    let dir = tempdir().unwrap();
    let (storage, cluster) = open_cluster(dir.path(), "spanroll");

    let file_id = cluster.get_file_id().unwrap();
    let pages_before = storage.registry().page_count(file_id).unwrap();

    let payload = vec![0xEE; 200_000];
    let err = cluster
        .create_record(&payload, 1, 0x0B, Some(&bogus_allocated_position(12)))
        .unwrap_err();
    assert!(err.downcast_ref::<ClusterError>().is_some());

    // four chunk pages were buffered, none reached the file
    assert_eq!(storage.registry().page_count(file_id).unwrap(), pages_before);
    assert_eq!(cluster.get_records_size().unwrap(), 0);
}

#[test]
fn rollback_preserves_previously_committed_records() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "keep");

    let committed = cluster.create_record(&[0x10; 2000], 7, 0x0B, None).unwrap();
    let entries = cluster.get_entries().unwrap();
    let records_size = cluster.get_records_size().unwrap();

    let _ = cluster
        .create_record(&[0x20; 2000], 1, 0x0B, Some(&bogus_allocated_position(55)))
        .unwrap_err();

    assert_eq!(cluster.get_entries().unwrap(), entries);
    assert_eq!(cluster.get_records_size().unwrap(), records_size);

    let record = cluster.read_record(committed.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![0x10; 2000]);
    assert_eq!(record.version, 7);
}

#[test]
fn cluster_works_normally_after_a_rollback() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "resume");

    let _ = cluster
        .create_record(&[1; 100], 1, 0x0B, Some(&bogus_allocated_position(3)))
        .unwrap_err();

    let position = cluster.create_record(&[2; 100], 1, 0x0B, None).unwrap();
    assert_eq!(position.cluster_position, 0);
    assert_eq!(
        cluster.read_record(0, false).unwrap().unwrap().content,
        vec![2; 100]
    );
    assert_eq!(cluster.get_entries().unwrap(), 1);
}

#[test]
fn cluster_error_names_the_cluster() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "named");

    let err = cluster
        .create_record(&[1], 1, 0x0B, Some(&bogus_allocated_position(9)))
        .unwrap_err();

    let cluster_error = err.downcast_ref::<ClusterError>().unwrap();
    assert_eq!(cluster_error.cluster(), "named");
    assert!(cluster_error.message().contains("record creation"));
}

#[test]
fn committed_journal_frames_replay_on_storage_open() {
    let dir = tempdir().unwrap();

    // a crash after the journal sync but before write-through leaves
    // committed frames behind
    let mut page = vec![0u8; clusterdb::config::PAGE_SIZE];
    page[0] = 0xC4;
    page[100] = 0x11;
    {
        let mut journal = CommitJournal::open(dir.path()).unwrap();
        journal.append_page(1, "crashed.pcl", 0, &page).unwrap();
        journal.append_commit(1).unwrap();
        journal.sync().unwrap();
    }

    let storage = LocalStorage::open(dir.path()).unwrap();
    assert!(storage.registry().exists("crashed.pcl"));

    let file_id = storage.registry().open_file("crashed.pcl").unwrap();
    let mut buf = vec![0u8; clusterdb::config::PAGE_SIZE];
    storage.registry().read_page_into(file_id, 0, &mut buf).unwrap();
    assert_eq!(buf[0], 0xC4);
    assert_eq!(buf[100], 0x11);

    // the journal was checkpointed away
    let journal_len = std::fs::metadata(dir.path().join("journal.wal")).unwrap().len();
    assert_eq!(journal_len, 0);
}

#[test]
fn uncommitted_journal_frames_are_dropped_on_storage_open() {
    let dir = tempdir().unwrap();

    let page = vec![0x77u8; clusterdb::config::PAGE_SIZE];
    {
        let mut journal = CommitJournal::open(dir.path()).unwrap();
        journal.append_page(1, "phantom.pcl", 0, &page).unwrap();
        // crash before the commit marker
        journal.sync().unwrap();
    }

    let storage = LocalStorage::open(dir.path()).unwrap();
    assert!(!storage.registry().exists("phantom.pcl"));
}
