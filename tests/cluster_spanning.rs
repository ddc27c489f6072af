//! Multi-page record chains: spanning writes, chain shape, shrinking and
//! growing updates.

use std::sync::Arc;

use clusterdb::cluster::{PaginatedCluster, CHUNK_TAIL_SIZE, HEAD_ENTRY_OVERHEAD};
use clusterdb::config::MAX_RECORD_SIZE;
use clusterdb::LocalStorage;
use tempfile::tempdir;

fn open_cluster(dir: &std::path::Path, name: &str) -> (Arc<LocalStorage>, PaginatedCluster) {
    let storage = LocalStorage::open(dir).unwrap();
    let cluster = PaginatedCluster::configure(&storage, 0, name).unwrap();
    cluster.create(0).unwrap();
    (storage, cluster)
}

fn expected_chunks(payload_len: usize) -> usize {
    // head framing minus the trailing flag+pointer, spread over per-chunk capacity
    (payload_len + (HEAD_ENTRY_OVERHEAD - CHUNK_TAIL_SIZE)).div_ceil(MAX_RECORD_SIZE - CHUNK_TAIL_SIZE)
}

#[test]
fn large_record_spans_multiple_chunks() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "span");

    let payload = vec![0xAB; 200_000];
    let position = cluster.create_record(&payload, 1, 0x0B, None).unwrap();

    // the first record of a fresh cluster sits at position 0
    assert_eq!(position.cluster_position, 0);

    let debug = cluster.read_debug(0).unwrap();
    assert!(!debug.empty);
    assert_eq!(debug.pages.len(), expected_chunks(payload.len()));
    assert_eq!(debug.pages.len(), 4);

    // head flag: 1 on the first chunk, 0 on every continuation
    for (i, page) in debug.pages.iter().enumerate() {
        let flag = page.content[page.in_page_size - CHUNK_TAIL_SIZE];
        assert_eq!(flag, if i == 0 { 1 } else { 0 });
    }

    let record = cluster.read_record(0, true).unwrap().unwrap();
    assert_eq!(record.content, payload);
    assert_eq!(record.version, 1);
    assert_eq!(cluster.get_entries().unwrap(), 1);
}

#[test]
fn boundary_payload_sizes_roundtrip() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "edges");

    // largest single-chunk payload, smallest spanning payload, exact
    // multiples of the per-chunk capacity
    let sizes = [
        MAX_RECORD_SIZE - HEAD_ENTRY_OVERHEAD - 1,
        MAX_RECORD_SIZE - HEAD_ENTRY_OVERHEAD,
        MAX_RECORD_SIZE - HEAD_ENTRY_OVERHEAD + 1,
        2 * (MAX_RECORD_SIZE - CHUNK_TAIL_SIZE) - 5,
        2 * (MAX_RECORD_SIZE - CHUNK_TAIL_SIZE) - 4,
        300_000,
    ];

    for (i, &size) in sizes.iter().enumerate() {
        let payload: Vec<u8> = (0..size).map(|b| (b % 251) as u8).collect();
        let position = cluster.create_record(&payload, i as i32, 0x0B, None).unwrap();

        let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
        assert_eq!(record.content.len(), size, "payload size {}", size);
        assert_eq!(record.content, payload, "payload size {}", size);

        let debug = cluster.read_debug(position.cluster_position).unwrap();
        assert_eq!(debug.pages.len(), expected_chunks(size), "payload size {}", size);
    }
}

#[test]
fn spanning_record_deletes_every_chunk() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "spandel");

    let payload = vec![0x55; 150_000];
    let position = cluster.create_record(&payload, 1, 0x0B, None).unwrap();
    assert!(cluster.get_records_size().unwrap() > 150_000);

    assert!(cluster.delete_record(position.cluster_position).unwrap());

    assert_eq!(cluster.get_entries().unwrap(), 0);
    assert_eq!(cluster.get_records_size().unwrap(), 0);
    assert!(cluster.read_record(position.cluster_position, false).unwrap().is_none());
}

#[test]
fn update_shrinks_chain_to_single_chunk() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "shrink");

    let payload = vec![0xAB; 200_000];
    cluster.create_record(&payload, 1, 0x0B, None).unwrap();
    let spanning_size = cluster.get_records_size().unwrap();

    cluster.update_record(0, &[0xFF], 2, 0x0B).unwrap();

    let record = cluster.read_record(0, false).unwrap().unwrap();
    assert_eq!(record.content, vec![0xFF]);
    assert_eq!(record.version, 2);
    assert_eq!(cluster.get_entries().unwrap(), 1);

    // the freed continuation chunks left the byte footprint
    assert!(cluster.get_records_size().unwrap() < spanning_size / 10);
    assert_eq!(cluster.read_debug(0).unwrap().pages.len(), 1);
}

#[test]
fn update_grows_record_into_chain() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "grow");

    let position = cluster.create_record(&[1; 100], 1, 0x0B, None).unwrap();

    let payload = vec![0x77; 180_000];
    cluster
        .update_record(position.cluster_position, &payload, 2, 0x0B)
        .unwrap();

    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, payload);
    assert_eq!(record.version, 2);
    assert_eq!(cluster.get_entries().unwrap(), 1);
    assert!(cluster.read_debug(position.cluster_position).unwrap().pages.len() > 1);
}

#[test]
fn chains_of_interleaved_records_stay_separate() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "interleave");

    let big_a = vec![0xAA; 120_000];
    let big_b = vec![0xBB; 140_000];
    let a = cluster.create_record(&big_a, 1, 0x0B, None).unwrap();
    let small = cluster.create_record(&[0x01; 32], 1, 0x0B, None).unwrap();
    let b = cluster.create_record(&big_b, 1, 0x0B, None).unwrap();

    cluster.delete_record(a.cluster_position).unwrap();

    assert!(cluster.read_record(a.cluster_position, false).unwrap().is_none());
    assert_eq!(
        cluster.read_record(small.cluster_position, false).unwrap().unwrap().content,
        vec![0x01; 32]
    );
    assert_eq!(
        cluster.read_record(b.cluster_position, false).unwrap().unwrap().content,
        big_b
    );
}

#[test]
fn spanning_recycle_rebuilds_the_chain() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "spanrecycle");

    let position = cluster.create_record(&[3; 50], 1, 0x0B, None).unwrap();
    cluster.delete_record(position.cluster_position).unwrap();

    let payload = vec![0xCD; 170_000];
    cluster
        .recycle_record(position.cluster_position, &payload, 9, 0x0B)
        .unwrap();

    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, payload);
    assert_eq!(record.version, 9);
    assert!(cluster.read_debug(position.cluster_position).unwrap().pages.len() > 1);
}
