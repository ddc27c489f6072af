//! End-to-end CRUD over a real on-disk storage directory.

use std::sync::Arc;

use clusterdb::cluster::{ClusterAttribute, PaginatedCluster, RecordStatus};
use clusterdb::config::SLOT_SIZE;
use clusterdb::{LocalStorage, RecordNotFoundError};
use tempfile::tempdir;

fn open_cluster(dir: &std::path::Path, name: &str) -> (Arc<LocalStorage>, PaginatedCluster) {
    let storage = LocalStorage::open(dir).unwrap();
    let cluster = PaginatedCluster::configure(&storage, 0, name).unwrap();
    cluster.create(0).unwrap();
    (storage, cluster)
}

#[test]
fn small_record_roundtrip() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "small");

    let position = cluster
        .create_record(&[0x01, 0x02, 0x03], 1, 0x0B, None)
        .unwrap();

    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![0x01, 0x02, 0x03]);
    assert_eq!(record.version, 1);
    assert_eq!(record.record_type, 0x0B);

    assert_eq!(cluster.get_entries().unwrap(), 1);
    // one chunk: 3 payload bytes + 14 framing bytes + one slot entry
    assert_eq!(cluster.get_records_size().unwrap(), (3 + 14 + SLOT_SIZE) as i64);
}

#[test]
fn empty_payload_roundtrip() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "empty");

    let position = cluster.create_record(&[], 1, 0x0B, None).unwrap();
    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();

    assert!(record.content.is_empty());
    assert_eq!(record.version, 1);
}

#[test]
fn read_of_unknown_position_returns_none() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "unknown");

    assert!(cluster.read_record(0, false).unwrap().is_none());
    assert!(cluster.read_record(42, false).unwrap().is_none());
    assert!(cluster.read_record(-1, false).unwrap().is_none());
}

#[test]
fn delete_then_read_returns_none() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "del");

    let position = cluster.create_record(&[7; 100], 1, 0x0B, None).unwrap();
    assert!(cluster.delete_record(position.cluster_position).unwrap());

    assert!(cluster.read_record(position.cluster_position, false).unwrap().is_none());
    assert_eq!(cluster.get_entries().unwrap(), 0);
    assert_eq!(cluster.get_records_size().unwrap(), 0);
    assert!(!cluster.delete_record(position.cluster_position).unwrap());
    assert_eq!(
        cluster.get_record_status(position.cluster_position).unwrap(),
        RecordStatus::Removed
    );
}

#[test]
fn deleted_positions_are_never_reassigned() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "mono");

    let first = cluster.create_record(&[1], 1, 0x0B, None).unwrap();
    cluster.delete_record(first.cluster_position).unwrap();

    let second = cluster.create_record(&[2], 1, 0x0B, None).unwrap();
    assert!(second.cluster_position > first.cluster_position);
}

#[test]
fn allocate_then_create_at_allocated_position() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "alloc");

    let allocated = cluster.allocate_position(0x0B).unwrap();
    assert_eq!(
        cluster.get_record_status(allocated.cluster_position).unwrap(),
        RecordStatus::Allocated
    );
    assert!(cluster.read_record(allocated.cluster_position, false).unwrap().is_none());

    let created = cluster
        .create_record(&[0x42; 16], 3, 0x0B, Some(&allocated))
        .unwrap();

    // the reserved position was reused, no fresh one allocated
    assert_eq!(created.cluster_position, allocated.cluster_position);
    assert_eq!(
        cluster.get_record_status(allocated.cluster_position).unwrap(),
        RecordStatus::Present
    );
    assert_eq!(cluster.get_next_position().unwrap(), allocated.cluster_position + 1);
}

#[test]
fn allocated_positions_increase_strictly() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "inc");

    let mut previous = -1;
    for _ in 0..100 {
        let position = cluster.allocate_position(0).unwrap().cluster_position;
        assert!(position > previous);
        previous = position;
    }
}

#[test]
fn update_in_place_bumps_version_and_content() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "upd");

    let position = cluster.create_record(&[1; 50], 1, 0x0B, None).unwrap();
    cluster
        .update_record(position.cluster_position, &[2; 50], 2, 0x0B)
        .unwrap();

    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![2; 50]);
    assert_eq!(record.version, 2);
    assert_eq!(cluster.get_entries().unwrap(), 1);
}

#[test]
fn update_with_different_size_keeps_identity() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "resize");

    let position = cluster.create_record(&[1; 50], 1, 0x0B, None).unwrap();
    cluster
        .update_record(position.cluster_position, &[9; 3000], 2, 0x0B)
        .unwrap();

    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![9; 3000]);
    assert_eq!(cluster.get_entries().unwrap(), 1);

    cluster
        .update_record(position.cluster_position, &[4; 2], 3, 0x0B)
        .unwrap();
    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![4; 2]);
    assert_eq!(record.version, 3);
}

#[test]
fn update_of_missing_position_is_a_noop() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "ghost");

    cluster.update_record(17, &[1], 1, 0x0B).unwrap();
    assert!(cluster.read_record(17, false).unwrap().is_none());
    assert_eq!(cluster.get_entries().unwrap(), 0);
}

#[test]
fn hide_removes_the_record_but_keeps_its_bytes() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "hide");

    let position = cluster.create_record(&[5; 1000], 1, 0x0B, None).unwrap();
    let records_size = cluster.get_records_size().unwrap();
    let entries = cluster.get_entries().unwrap();

    assert!(cluster.hide_record(position.cluster_position).unwrap());

    assert_eq!(cluster.get_entries().unwrap(), entries - 1);
    // the chunks were not freed: the byte footprint is untouched
    assert_eq!(cluster.get_records_size().unwrap(), records_size);
    assert!(cluster.read_record(position.cluster_position, false).unwrap().is_none());

    assert!(!cluster.hide_record(position.cluster_position).unwrap());
}

#[test]
fn delete_then_recycle_resurrects_the_position() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "recycle");

    let position = cluster.create_record(&[1; 10], 1, 0x0B, None).unwrap();
    cluster.delete_record(position.cluster_position).unwrap();

    cluster
        .recycle_record(position.cluster_position, &[0x42], 5, 0x0B)
        .unwrap();

    assert_eq!(
        cluster.get_record_status(position.cluster_position).unwrap(),
        RecordStatus::Present
    );
    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![0x42]);
    assert_eq!(record.version, 5);
}

#[test]
fn recycle_of_a_live_record_is_refused() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "norecycle");

    let position = cluster.create_record(&[1], 1, 0x0B, None).unwrap();
    let result = cluster.recycle_record(position.cluster_position, &[2], 2, 0x0B);

    assert!(result.is_err());
    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![1]);
}

#[test]
fn read_if_version_is_not_latest_variants() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "versions");

    let position = cluster.create_record(&[8; 20], 4, 0x0B, None).unwrap();

    // caller is current
    assert!(cluster
        .read_record_if_version_is_not_latest(position.cluster_position, 4)
        .unwrap()
        .is_none());

    // caller lags: full record comes back
    let record = cluster
        .read_record_if_version_is_not_latest(position.cluster_position, 3)
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 4);

    // absent record: dedicated not-found error
    let err = cluster
        .read_record_if_version_is_not_latest(999, 1)
        .unwrap_err();
    assert!(err.downcast_ref::<RecordNotFoundError>().is_some());
}

#[test]
fn get_physical_position_reports_type_and_version() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "phys");

    let position = cluster.create_record(&[3; 30], 7, 0x21, None).unwrap();

    let physical = cluster
        .get_physical_position(position.cluster_position)
        .unwrap()
        .unwrap();
    assert_eq!(physical.record_type, 0x21);
    assert_eq!(physical.record_version, 7);
    assert_eq!(physical.cluster_position, position.cluster_position);

    assert!(cluster.get_physical_position(12345).unwrap().is_none());
}

#[test]
fn range_navigation_and_iterator() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "ranges");

    let mut positions = Vec::new();
    for i in 0..6u8 {
        positions.push(
            cluster
                .create_record(&[i; 8], 1, 0x0B, None)
                .unwrap()
                .cluster_position,
        );
    }
    cluster.delete_record(positions[2]).unwrap();

    assert_eq!(cluster.get_first_position().unwrap(), positions[0]);
    assert_eq!(cluster.get_last_position().unwrap(), positions[5]);
    assert_eq!(
        cluster.higher_positions(positions[1]).unwrap(),
        vec![positions[3], positions[4], positions[5]]
    );
    assert_eq!(
        cluster.floor_positions(positions[2]).unwrap(),
        vec![positions[0], positions[1]]
    );

    let walked: Vec<i64> = cluster
        .absolute_iterator()
        .map(|entry| entry.unwrap().cluster_position)
        .collect();
    assert_eq!(
        walked,
        vec![positions[0], positions[1], positions[3], positions[4], positions[5]]
    );
}

#[test]
fn truncate_resets_counters_and_positions() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "trunc");

    for i in 0..10u8 {
        cluster.create_record(&[i; 64], 1, 0x0B, None).unwrap();
    }
    cluster.truncate().unwrap();

    assert_eq!(cluster.get_entries().unwrap(), 0);
    assert_eq!(cluster.get_records_size().unwrap(), 0);
    assert_eq!(cluster.get_first_position().unwrap(), -1);

    let position = cluster.create_record(&[1], 1, 0x0B, None).unwrap();
    assert_eq!(position.cluster_position, 0);
}

#[test]
fn rename_moves_both_files() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "before");

    let position = cluster.create_record(&[9; 40], 1, 0x0B, None).unwrap();
    cluster.set(ClusterAttribute::Name, "after").unwrap();

    assert_eq!(cluster.get_name(), "after");
    assert!(dir.path().join("after.pcl").exists());
    assert!(dir.path().join("after.cpm").exists());
    assert!(!dir.path().join("before.pcl").exists());

    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, vec![9; 40]);
}

#[test]
fn grow_factor_attributes_are_validated_and_echoed() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "factors");

    cluster.set(ClusterAttribute::RecordGrowFactor, "1.5").unwrap();
    cluster
        .set(ClusterAttribute::RecordOverflowGrowFactor, "2.0")
        .unwrap();

    assert_eq!(cluster.record_grow_factor(), 1.5);
    assert_eq!(cluster.record_overflow_grow_factor(), 2.0);

    assert!(cluster.set(ClusterAttribute::RecordGrowFactor, "0.4").is_err());
    assert!(cluster.set(ClusterAttribute::RecordGrowFactor, "nan?").is_err());
}

#[test]
fn encryption_can_only_change_while_empty() {
    let dir = tempdir().unwrap();
    let (_storage, cluster) = open_cluster(dir.path(), "enc");

    // empty cluster: allowed
    cluster.set(ClusterAttribute::Encryption, "nothing").unwrap();

    cluster.create_record(&[1], 1, 0x0B, None).unwrap();
    let err = cluster.set(ClusterAttribute::Encryption, "nothing").unwrap_err();
    assert!(err.to_string().contains("not empty"));
}

#[test]
fn compressed_cluster_roundtrip() {
    let dir = tempdir().unwrap();
    let storage = LocalStorage::open(dir.path()).unwrap();

    let mut config = clusterdb::ClusterConfig::new(0, "packed");
    config.compression = "snappy".to_string();
    let cluster = PaginatedCluster::configure_with_config(&storage, config).unwrap();
    cluster.create(0).unwrap();

    let payload: Vec<u8> = std::iter::repeat(b"abcdefgh".as_slice())
        .take(4096)
        .flatten()
        .copied()
        .collect();
    let position = cluster.create_record(&payload, 1, 0x0B, None).unwrap();

    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, payload);

    // highly repetitive payload compresses below one page
    assert!(cluster.get_records_size().unwrap() < payload.len() as i64);
}

#[test]
fn encrypted_cluster_roundtrip() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let dir = tempdir().unwrap();
    let storage = LocalStorage::open(dir.path()).unwrap();

    let mut config = clusterdb::ClusterConfig::new(0, "sealed");
    config.encryption = "aes-gcm".to_string();
    config.encryption_key = Some(BASE64.encode([7u8; 32]));
    let cluster = PaginatedCluster::configure_with_config(&storage, config).unwrap();
    cluster.create(0).unwrap();

    let position = cluster.create_record(b"top secret", 1, 0x0B, None).unwrap();
    let record = cluster.read_record(position.cluster_position, false).unwrap().unwrap();
    assert_eq!(record.content, b"top secret");
}

#[test]
fn session_statistics_bracket_crud_calls() {
    use clusterdb::stats::{ClusterOperationKind, SessionStoragePerformanceStatistic};

    let dir = tempdir().unwrap();
    let (storage, cluster) = open_cluster(dir.path(), "stats");

    let stats = Arc::new(SessionStoragePerformanceStatistic::new());
    storage.set_session_statistics(Some(Arc::clone(&stats)));

    let position = cluster.create_record(&[1; 10], 1, 0x0B, None).unwrap();
    cluster.read_record(position.cluster_position, false).unwrap();
    cluster
        .update_record(position.cluster_position, &[2; 10], 2, 0x0B)
        .unwrap();
    cluster.delete_record(position.cluster_position).unwrap();

    assert_eq!(stats.invocations(ClusterOperationKind::RecordCreation), 1);
    assert_eq!(stats.invocations(ClusterOperationKind::RecordRead), 1);
    assert_eq!(stats.invocations(ClusterOperationKind::RecordUpdate), 1);
    assert_eq!(stats.invocations(ClusterOperationKind::RecordDeletion), 1);
}

#[test]
fn exists_and_delete_lifecycle() {
    let dir = tempdir().unwrap();
    let storage = LocalStorage::open(dir.path()).unwrap();
    let cluster = PaginatedCluster::configure(&storage, 0, "life").unwrap();

    assert!(!cluster.exists());
    cluster.create(0).unwrap();
    assert!(cluster.exists());
    assert!(dir.path().join("life.pcl").exists());
    assert!(dir.path().join("life.cpm").exists());

    cluster.delete().unwrap();
    assert!(!cluster.exists());
    assert!(!dir.path().join("life.pcl").exists());
    assert!(!dir.path().join("life.cpm").exists());
}
