//! End-to-end scenarios for the store: write/read/delete, rollover,
//! recovery, compaction, corruption detection, and concurrent writers.

use needlestore_storage::catalog::CatalogOptions;
use needlestore_storage::compaction::CompactorConfig;
use needlestore_storage::store::{Store, StoreConfig, StoreError};
use needlestore_storage::volume::volume_file_name;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;

fn sqlite_config(dir: &TempDir, max_volume_size: u64) -> StoreConfig {
    StoreConfig {
        data_dir: dir.path().to_path_buf(),
        max_volume_size,
        read_only: false,
        catalog: CatalogOptions::Sqlite {
            path: dir.path().join("catalog.db"),
        },
    }
}

fn memory_config(dir: &TempDir, max_volume_size: u64) -> StoreConfig {
    StoreConfig {
        data_dir: dir.path().to_path_buf(),
        max_volume_size,
        read_only: false,
        catalog: CatalogOptions::Memory,
    }
}

#[test]
fn test_basic_write_read_delete() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(sqlite_config(&dir, 4096)).unwrap();

    let id = store.write(b"hello", "a.txt", "text/plain").unwrap();
    assert_eq!(id, 1);

    assert_eq!(store.read(1).unwrap(), b"hello");

    let meta = store.get_metadata(1).unwrap();
    assert_eq!(meta.md5, "5d41402abc4b2a76b9719d911017c592");
    assert_eq!(meta.file_name, "a.txt");
    assert_eq!(meta.mime_type, "text/plain");
    assert!(meta.cookie > 0);
    assert_eq!(meta.cookie as i64, meta.create_time);

    store.delete(1).unwrap();
    assert!(matches!(store.read(1), Err(StoreError::NeedleNotFound(1))));
}

#[test]
fn test_rollover_across_volumes() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(memory_config(&dir, 64)).unwrap();

    // Each 20-byte payload encodes to 49 bytes: two never fit in 64.
    for i in 0..3u64 {
        let id = store.write(&[i as u8; 20], "", "").unwrap();
        assert_eq!(id, i + 1);
    }

    let status = store.status();
    assert_eq!(status.volume_count, 3);
    assert_eq!(status.active_volume, 3);

    for vol_id in 1..=3u32 {
        let len = std::fs::metadata(dir.path().join(volume_file_name(vol_id)))
            .unwrap()
            .len();
        assert_eq!(len, 49, "volume {} should hold exactly one needle", vol_id);
        assert!(len <= 64, "no volume may exceed max_volume_size");
    }

    // Every payload still round-trips from its volume.
    for i in 0..3u64 {
        assert_eq!(store.read(i + 1).unwrap(), [i as u8; 20]);
    }
}

#[test]
fn test_recovery_after_restart() {
    let dir = TempDir::new().unwrap();

    {
        let store = Store::open(sqlite_config(&dir, 4096)).unwrap();
        let id = store.write(b"hello", "a.txt", "text/plain").unwrap();
        assert_eq!(id, 1);
        store.close().unwrap();
    }

    let store = Store::open(sqlite_config(&dir, 4096)).unwrap();
    assert_eq!(store.read(1).unwrap(), b"hello");

    let id = store.write(b"x", "", "").unwrap();
    assert_eq!(id, 2, "id counter must resume past catalog ids");
}

#[test]
fn test_recovery_restores_tombstones() {
    let dir = TempDir::new().unwrap();

    {
        let store = Store::open(sqlite_config(&dir, 1 << 20)).unwrap();
        store.write(b"keep", "keep.txt", "").unwrap();
        store.write(b"drop", "drop.txt", "").unwrap();
        store.delete(2).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(sqlite_config(&dir, 1 << 20)).unwrap();
    assert_eq!(store.read(1).unwrap(), b"keep");
    assert!(matches!(store.read(2), Err(StoreError::NeedleNotFound(2))));

    let status = store.status();
    assert_eq!(status.total_files, 2);
    assert_eq!(status.deleted_files, 1);
}

#[test]
fn test_recovery_keeps_rollover_state() {
    let dir = TempDir::new().unwrap();

    {
        let store = Store::open(sqlite_config(&dir, 64)).unwrap();
        store.write(&[1u8; 20], "", "").unwrap();
        store.write(&[2u8; 20], "", "").unwrap();
        store.close().unwrap();
    }

    let store = Store::open(sqlite_config(&dir, 64)).unwrap();
    let status = store.status();
    assert_eq!(status.volume_count, 2);
    assert_eq!(status.active_volume, 2, "largest active volume wins");

    // New writes land in volume 2 until it fills, then roll to 3.
    store.write(&[3u8; 20], "", "").unwrap();
    assert_eq!(store.status().active_volume, 3);
    assert_eq!(store.read(3).unwrap(), [3u8; 20]);
}

#[test]
fn test_compaction_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(sqlite_config(&dir, 1 << 20)).unwrap();

    let payload = [0xA5u8; 100];
    for i in 0..10u64 {
        assert_eq!(store.write(&payload, &format!("f{}", i), "").unwrap(), i + 1);
    }
    for id in 1..=4u64 {
        store.delete(id).unwrap();
    }

    let volume_path = dir.path().join(volume_file_name(1));
    assert_eq!(std::fs::metadata(&volume_path).unwrap().len(), 10 * 129);

    store.run_compaction(&CompactorConfig {
        enabled: true,
        interval: Duration::from_secs(1),
        deleted_threshold: 0.3,
        min_volume_size: 0,
    });

    assert_eq!(
        std::fs::metadata(&volume_path).unwrap().len(),
        6 * 129,
        "rewritten volume holds only the six live needles"
    );

    for id in 5..=10u64 {
        assert_eq!(store.read(id).unwrap(), payload, "live id {} must survive", id);
    }
    for id in 1..=4u64 {
        assert!(
            matches!(store.read(id), Err(StoreError::NeedleNotFound(_))),
            "deleted id {} must stay deleted",
            id
        );
    }
}

#[test]
fn test_crc_detection_on_disk_corruption() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(memory_config(&dir, 4096)).unwrap();

    let id = store.write(b"abcd", "c.bin", "").unwrap();
    assert_eq!(id, 1);

    // Flip the first data byte (file offset 25) behind the store's back.
    let path = dir.path().join(volume_file_name(1));
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(b"X", 25).unwrap();

    match store.read(1) {
        Err(StoreError::Volume(e)) => {
            assert!(
                e.to_string().contains("CRC mismatch"),
                "expected a CRC failure, got: {}",
                e
            );
        }
        other => panic!("expected CRC failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_concurrent_writers() {
    const WRITERS: usize = 8;
    const PER_WRITER: usize = 1000;

    let dir = TempDir::new().unwrap();
    // Small volumes force plenty of rollovers under contention.
    let store = Arc::new(Store::open(memory_config(&dir, 64 * 1024)).unwrap());

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            let mut ids = Vec::with_capacity(PER_WRITER);
            for i in 0..PER_WRITER {
                let payload = format!("writer {} payload {:04}", w, i);
                let id = store
                    .write(payload.as_bytes(), &format!("w{}/{}", w, i), "")
                    .unwrap();
                ids.push((id, payload));
            }
            ids
        }));
    }

    let mut all: Vec<(u64, String)> = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    assert_eq!(all.len(), WRITERS * PER_WRITER);

    // All ids unique.
    let mut ids: Vec<u64> = all.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), WRITERS * PER_WRITER, "ids must be unique");

    // Every payload round-trips.
    for (id, payload) in &all {
        assert_eq!(store.read(*id).unwrap(), payload.as_bytes());
    }

    // No two needles share an offset within a volume, and the sum of
    // volume file sizes equals the sum of encoded needle sizes.
    let metas = store.list_all().unwrap();
    assert_eq!(metas.len(), WRITERS * PER_WRITER);
    let mut positions: Vec<(u32, u64)> = metas.iter().map(|m| (m.volume_id, m.offset)).collect();
    positions.sort_unstable();
    let before = positions.len();
    positions.dedup();
    assert_eq!(positions.len(), before, "needle offsets must not collide");

    let encoded_total: u64 = metas.iter().map(|m| 29 + m.size as u64).sum();
    let mut file_total = 0u64;
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("volume_") && name.ends_with(".dat") {
            file_total += entry.metadata().unwrap().len();
        }
    }
    assert_eq!(file_total, encoded_total);
}

#[test]
fn test_delete_racing_compaction_keeps_tombstone() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(memory_config(&dir, 1 << 20)).unwrap());

    let payload = [0x3Cu8; 80];
    for i in 0..8u64 {
        assert_eq!(store.write(&payload, &format!("race-{}", i), "").unwrap(), i + 1);
    }

    // Zero threshold: every pass rewrites the volume, so the swap window
    // keeps reopening while deletes are in flight.
    let config = CompactorConfig {
        enabled: true,
        interval: Duration::from_secs(1),
        deleted_threshold: 0.0,
        min_volume_size: 0,
    };

    let compactor = {
        let store = store.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                store.run_compaction(&config);
            }
        })
    };
    let deleter = {
        let store = store.clone();
        std::thread::spawn(move || {
            let mut deleted_once = false;
            for _ in 0..500 {
                match store.delete(3) {
                    Ok(()) => deleted_once = true,
                    // A rewrite already excised the tombstoned entry.
                    Err(StoreError::NeedleNotFound(_)) => {}
                    Err(e) => panic!("racing delete failed: {}", e),
                }
            }
            assert!(deleted_once, "the delete must land at least once");
        })
    };

    compactor.join().unwrap();
    deleter.join().unwrap();

    // The tombstone must hold through every rewrite that raced it: a
    // deleted id that reappears here means a rewrite resurrected it.
    assert!(matches!(store.read(3), Err(StoreError::NeedleNotFound(3))));
    for id in [1, 2, 4, 5, 6, 7, 8] {
        assert_eq!(store.read(id).unwrap(), payload, "live id {} must survive", id);
    }

    // One more sweep with everything settled keeps the id deleted.
    store.run_compaction(&config);
    assert!(matches!(store.read(3), Err(StoreError::NeedleNotFound(3))));
    assert_eq!(store.status().deleted_files, 1);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(memory_config(&dir, 1 << 20)).unwrap());

    // Seed some data readers can hammer.
    for i in 0..50u64 {
        store.write(format!("seed {}", i).as_bytes(), "", "").unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            for round in 0..200u64 {
                let id = 1 + (round % 50);
                assert_eq!(
                    store.read(id).unwrap(),
                    format!("seed {}", id - 1).as_bytes()
                );
            }
        }));
    }
    for _ in 0..2 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..200 {
                store.write(format!("more {}", i).as_bytes(), "", "").unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.status().total_files, 50 + 400);
}
