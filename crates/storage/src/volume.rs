//! An append-only volume file and its in-memory needle index.
//!
//! A volume is a raw concatenation of encoded needles with no header or
//! index block; the `id -> NeedleInfo` map lives in memory and is rebuilt
//! either from the catalog (normal recovery) or by scanning the file
//! (`load_index`, after compaction).

use crate::needle::{Needle, NeedleError, NeedleInfo, NEEDLE_FOOTER_SIZE, NEEDLE_HEADER_SIZE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("needle {0} not found")]
    NeedleNotFound(u64),
    #[error("volume {0} is full")]
    VolumeFull(u32),
    #[error("volume {0} is retired")]
    VolumeRetired(u32),
    #[error(transparent)]
    Needle(#[from] NeedleError),
    #[error("volume I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Format a volume's canonical file name.
pub fn volume_file_name(id: u32) -> String {
    format!("volume_{:05}.dat", id)
}

/// State behind the volume's reader-writer lock: the file handle, the
/// append position, the active flag, and the needle index.
struct VolumeInner {
    file: File,
    current_size: u64,
    active: bool,
    /// Set while a compacted replacement is being swapped in: appends
    /// and tombstones must bounce so they land in the replacement
    /// instead of the retired file's index.
    retired: bool,
    index: HashMap<u64, NeedleInfo>,
}

/// One append-only container file plus its in-memory position index.
///
/// All methods take `&self`; reads proceed concurrently (positional I/O,
/// no shared seek pointer) while appends and tombstones take the write
/// lock.
pub struct Volume {
    id: u32,
    path: PathBuf,
    max_size: u64,
    inner: RwLock<VolumeInner>,
}

impl Volume {
    /// Open or create `volume_{id:05}.dat` under `dir`. The file is not
    /// scanned; `current_size` starts at the file length and `active` at
    /// true, both of which recovery may overwrite from the catalog.
    pub fn open(id: u32, dir: &Path, max_size: u64) -> Result<Self, VolumeError> {
        let path = dir.join(volume_file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            id,
            path,
            max_size,
            inner: RwLock::new(VolumeInner {
                file,
                current_size,
                active: true,
                retired: false,
                index: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn current_size(&self) -> u64 {
        self.inner.read().current_size
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().active
    }

    /// Mark the volume as no longer accepting appends.
    pub fn deactivate(&self) {
        self.inner.write().active = false;
    }

    /// Append a needle at the current tail. Fails with `VolumeFull` (and
    /// deactivates the volume) before any I/O when it would not fit. The
    /// index entry is inserted only after the bytes are on the file, so a
    /// failed write leaves the index unchanged.
    pub fn write_needle(&self, needle: &Needle) -> Result<u64, VolumeError> {
        let mut inner = self.inner.write();

        if inner.retired {
            return Err(VolumeError::VolumeRetired(self.id));
        }
        if inner.current_size + needle.encoded_size() > self.max_size {
            inner.active = false;
            return Err(VolumeError::VolumeFull(self.id));
        }

        let offset = inner.current_size;
        let encoded = needle.to_bytes()?;
        inner.file.write_all_at(&encoded, offset)?;

        inner.index.insert(
            needle.id,
            NeedleInfo {
                offset,
                size: needle.data_size(),
                flags: needle.flags,
                volume_id: self.id,
            },
        );
        inner.current_size += needle.encoded_size();
        Ok(offset)
    }

    /// Read and verify a needle. Missing or tombstoned entries fail with
    /// `NeedleNotFound`; a corrupted record surfaces as `CrcMismatch`.
    pub fn read_needle(&self, id: u64) -> Result<Needle, VolumeError> {
        let inner = self.inner.read();

        let info = match inner.index.get(&id) {
            Some(info) if !info.is_deleted() => *info,
            _ => return Err(VolumeError::NeedleNotFound(id)),
        };

        let encoded_len = NEEDLE_HEADER_SIZE + info.size as usize + NEEDLE_FOOTER_SIZE;
        let mut buf = vec![0u8; encoded_len];
        inner.file.read_exact_at(&mut buf, info.offset)?;
        drop(inner);

        let needle = Needle::decode(&mut buf.as_slice())?;
        if needle.id != id {
            return Err(VolumeError::Needle(NeedleError::Invalid(format!(
                "record at offset {} holds id {}, expected {}",
                info.offset, needle.id, id
            ))));
        }
        Ok(needle)
    }

    /// Tombstone a needle in memory. The on-disk record is not touched;
    /// durability of the tombstone comes from the catalog. A retired
    /// volume rejects the tombstone so it cannot vanish into an index
    /// that is about to be discarded.
    pub fn delete_needle(&self, id: u64) -> Result<(), VolumeError> {
        let mut inner = self.inner.write();
        if inner.retired {
            return Err(VolumeError::VolumeRetired(self.id));
        }
        match inner.index.get_mut(&id) {
            Some(info) => {
                info.mark_deleted();
                Ok(())
            }
            None => Err(VolumeError::NeedleNotFound(id)),
        }
    }

    /// Rebuild the index by scanning the file from offset 0. Stops at the
    /// first decode error and treats the prefix decoded so far as
    /// authoritative: `current_size` becomes the end of that prefix and
    /// the physical file is left intact. Returns the number of needles
    /// indexed.
    pub fn load_index(&self) -> Result<usize, VolumeError> {
        let mut inner = self.inner.write();
        inner.index.clear();

        let mut file = &inner.file;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut offset = 0u64;
        let mut entries = Vec::new();
        loop {
            let needle = match Needle::decode(&mut reader) {
                Ok(n) => n,
                Err(_) => break,
            };
            entries.push((
                needle.id,
                NeedleInfo {
                    offset,
                    size: needle.data_size(),
                    flags: needle.flags,
                    volume_id: self.id,
                },
            ));
            offset += needle.encoded_size();
        }
        drop(reader);

        let count = entries.len();
        for (id, info) in entries {
            inner.index.insert(id, info);
        }
        inner.current_size = offset;
        Ok(count)
    }

    /// Insert an index entry recovered from the catalog.
    pub fn restore_entry(&self, id: u64, info: NeedleInfo) {
        self.inner.write().index.insert(id, info);
    }

    /// Overwrite size and active flag with the catalog's values. Used
    /// during recovery, where the catalog row (not the file length) is
    /// authoritative for the append position.
    pub fn restore_state(&self, current_size: u64, active: bool) {
        let mut inner = self.inner.write();
        inner.current_size = current_size;
        inner.active = active;
    }

    /// Whether the index holds any entry (live or tombstoned) for `id`.
    pub fn contains(&self, id: u64) -> bool {
        self.inner.read().index.contains_key(&id)
    }

    /// Retire the volume and sample `(current_size, deleted_count)` in a
    /// single lock acquisition. Appends and tombstones bounce from the
    /// moment the flag is set, and nothing can interleave between the
    /// retirement and the sample, so the returned pair is exactly the
    /// state a compacted rewrite must be validated against.
    pub(crate) fn retire_and_snapshot(&self) -> (u64, usize) {
        let mut inner = self.inner.write();
        inner.retired = true;
        let deleted = inner.index.values().filter(|i| i.is_deleted()).count();
        (inner.current_size, deleted)
    }

    /// Toggle mutation rejection; used to roll back an aborted swap.
    pub(crate) fn set_retired(&self, retired: bool) {
        self.inner.write().retired = retired;
    }

    /// Total and tombstoned needle counts.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        let total = inner.index.len();
        let deleted = inner.index.values().filter(|i| i.is_deleted()).count();
        (total, deleted)
    }

    /// Snapshot of all live (non-tombstoned) needle ids.
    pub fn live_ids(&self) -> Vec<u64> {
        let inner = self.inner.read();
        inner
            .index
            .iter()
            .filter(|(_, info)| !info.is_deleted())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sum of payload sizes for tombstoned needles.
    pub fn wasted_bytes(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .index
            .values()
            .filter(|i| i.is_deleted())
            .map(|i| i.size as u64)
            .sum()
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<(), VolumeError> {
        self.inner.read().file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("current_size", &inner.current_size)
            .field("max_size", &self.max_size)
            .field("active", &inner.active)
            .field("needles", &inner.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_needle(id: u64, data: &[u8]) -> Needle {
        Needle::new(id, 1_700_000_000, 1_700_000_000, data.to_vec())
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();

        let offset = vol.write_needle(&make_needle(1, b"hello")).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(vol.current_size(), 29 + 5);

        let needle = vol.read_needle(1).unwrap();
        assert_eq!(needle.data, b"hello");
        assert_eq!(needle.id, 1);
    }

    #[test]
    fn test_sequential_offsets() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();

        let o1 = vol.write_needle(&make_needle(1, b"aaaa")).unwrap();
        let o2 = vol.write_needle(&make_needle(2, b"bb")).unwrap();
        let o3 = vol.write_needle(&make_needle(3, b"cccccc")).unwrap();

        assert_eq!(o1, 0);
        assert_eq!(o2, 33);
        assert_eq!(o3, 33 + 31);
        assert_eq!(vol.current_size(), 33 + 31 + 35);
    }

    #[test]
    fn test_read_missing_needle() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
        assert!(matches!(
            vol.read_needle(99),
            Err(VolumeError::NeedleNotFound(99))
        ));
    }

    #[test]
    fn test_delete_hides_needle() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();

        vol.write_needle(&make_needle(1, b"data")).unwrap();
        vol.delete_needle(1).unwrap();

        // The tombstoned entry stays in the index until compaction.
        assert!(vol.contains(1));

        // The bytes are still on disk, but the read path refuses.
        assert!(matches!(
            vol.read_needle(1),
            Err(VolumeError::NeedleNotFound(1))
        ));
        let (total, deleted) = vol.counts();
        assert_eq!((total, deleted), (1, 1));
    }

    #[test]
    fn test_delete_missing_needle() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
        assert!(matches!(
            vol.delete_needle(5),
            Err(VolumeError::NeedleNotFound(5))
        ));
    }

    #[test]
    fn test_volume_full_deactivates_without_io() {
        let dir = TempDir::new().unwrap();
        // Room for exactly one 20-byte payload (encoded 49), not two.
        let vol = Volume::open(1, dir.path(), 64).unwrap();

        vol.write_needle(&make_needle(1, &[0u8; 20])).unwrap();
        assert!(vol.is_active());

        let err = vol.write_needle(&make_needle(2, &[0u8; 20])).unwrap_err();
        assert!(matches!(err, VolumeError::VolumeFull(1)));
        assert!(!vol.is_active());

        // The rejected write must not have touched the file.
        assert_eq!(vol.current_size(), 49);
        assert_eq!(std::fs::metadata(vol.path()).unwrap().len(), 49);
    }

    #[test]
    fn test_load_index_rebuilds() {
        let dir = TempDir::new().unwrap();
        {
            let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
            vol.write_needle(&make_needle(1, b"one")).unwrap();
            vol.write_needle(&make_needle(2, b"two")).unwrap();
            vol.write_needle(&make_needle(3, b"three")).unwrap();
        }

        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
        let count = vol.load_index().unwrap();
        assert_eq!(count, 3);
        assert_eq!(vol.current_size(), 32 + 32 + 34);
        assert_eq!(vol.read_needle(2).unwrap().data, b"two");
    }

    #[test]
    fn test_load_index_stops_at_corruption() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
            vol.write_needle(&make_needle(1, b"first")).unwrap();
            vol.write_needle(&make_needle(2, b"second")).unwrap();
            vol.write_needle(&make_needle(3, b"third")).unwrap();
            path = vol.path().to_path_buf();
        }

        // Corrupt the payload of the second needle (header 25 + 5 data + 4 crc = 34).
        let second_data_offset = 34 + NEEDLE_HEADER_SIZE as u64;
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(b"X", second_data_offset).unwrap();

        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
        let count = vol.load_index().unwrap();
        assert_eq!(count, 1, "scan should stop at the corrupt second needle");
        assert_eq!(vol.current_size(), 34);
        assert_eq!(vol.read_needle(1).unwrap().data, b"first");
        assert!(vol.read_needle(3).is_err());
    }

    #[test]
    fn test_read_detects_bit_flip() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
        vol.write_needle(&make_needle(1, b"abcd")).unwrap();

        // Flip the first data byte (offset 25) out from under the volume.
        let file = OpenOptions::new().write(true).open(vol.path()).unwrap();
        file.write_all_at(b"x", NEEDLE_HEADER_SIZE as u64).unwrap();

        match vol.read_needle(1) {
            Err(VolumeError::Needle(NeedleError::CrcMismatch { .. })) => {}
            other => panic!("expected CrcMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_state_overrides_file_length() {
        let dir = TempDir::new().unwrap();
        {
            let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
            vol.write_needle(&make_needle(1, b"full record")).unwrap();
            // Simulate a partial trailing write after the indexed record.
            let file = OpenOptions::new().write(true).open(vol.path()).unwrap();
            file.write_all_at(b"partial garbage", vol.current_size())
                .unwrap();
        }

        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
        // Recovery restores the catalog size, ignoring the garbage tail.
        vol.restore_state(40, false);
        assert_eq!(vol.current_size(), 40);
        assert!(!vol.is_active());

        // The next append overwrites the garbage.
        vol.restore_state(40, true);
        let offset = vol.write_needle(&make_needle(2, b"next")).unwrap();
        assert_eq!(offset, 40);
        assert_eq!(vol.read_needle(2).unwrap().data, b"next");
    }

    #[test]
    fn test_retired_volume_bounces_mutations() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::open(1, dir.path(), 1 << 20).unwrap();
        vol.write_needle(&make_needle(1, b"data")).unwrap();

        let (size, deleted) = vol.retire_and_snapshot();
        assert_eq!(size, 33);
        assert_eq!(deleted, 0);

        assert!(matches!(
            vol.write_needle(&make_needle(2, b"x")),
            Err(VolumeError::VolumeRetired(1))
        ));
        assert!(matches!(
            vol.delete_needle(1),
            Err(VolumeError::VolumeRetired(1))
        ));
        // Reads keep working against the retired file.
        assert_eq!(vol.read_needle(1).unwrap().data, b"data");

        // Rolling back an aborted swap restores mutations.
        vol.set_retired(false);
        vol.delete_needle(1).unwrap();
        let (_, deleted) = vol.retire_and_snapshot();
        assert_eq!(deleted, 1, "snapshot must see the rolled-back delete");
    }

    #[test]
    fn test_concurrent_reads_and_writes() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let vol = Arc::new(Volume::open(1, dir.path(), 8 << 20).unwrap());
        vol.write_needle(&make_needle(0, b"seed")).unwrap();

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let vol = vol.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    let id = 1 + t * 100 + i;
                    vol.write_needle(&make_needle(id, format!("v{}", id).as_bytes()))
                        .unwrap();
                    // Interleave reads of an already-present needle.
                    assert_eq!(vol.read_needle(0).unwrap().data, b"seed");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let (total, deleted) = vol.counts();
        assert_eq!(total, 401);
        assert_eq!(deleted, 0);
        for id in 1..=400u64 {
            assert_eq!(vol.read_needle(id).unwrap().data, format!("v{}", id).as_bytes());
        }
    }
}
