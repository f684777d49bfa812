//! The store: orchestrates volumes and the catalog.
//!
//! Owns every volume and the catalog, allocates ids from an atomic
//! counter, picks the active volume, rolls over on `VolumeFull`, and
//! exposes the top-level read/write/delete/query operations. All
//! methods take `&self`; shared state sits behind a reader-writer lock
//! so request handlers can call in concurrently.

use crate::catalog::{Catalog, CatalogError, CatalogOptions, FileMetadata, VolumeInfo};
use crate::needle::{Needle, NeedleInfo, FLAG_DELETED};
use crate::volume::{volume_file_name, Volume, VolumeError};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("needle {0} not found")]
    NeedleNotFound(u64),
    #[error("store is read-only")]
    ReadOnly,
    #[error("volume {0} not found")]
    VolumeNotFound(u32),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for "no such object" outcomes, as opposed to real failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NeedleNotFound(_))
    }
}

/// Everything the store needs to open: where volumes live, how big they
/// may grow, and which catalog engine backs the metadata.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub max_volume_size: u64,
    pub read_only: bool,
    pub catalog: CatalogOptions,
}

/// Aggregate store state for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub total_files: u64,
    pub deleted_files: u64,
    pub active_files: u64,
    pub total_size: u64,
    pub volume_count: u64,
    pub active_volume: u32,
    pub next_id: u64,
}

/// State behind the store lock: the volume table and the id of the one
/// volume currently accepting appends.
struct VolumeSet {
    volumes: HashMap<u32, Arc<Volume>>,
    active_id: u32,
}

pub struct Store {
    data_dir: PathBuf,
    max_volume_size: u64,
    read_only: bool,
    catalog: Catalog,
    set: RwLock<VolumeSet>,
    /// Sole source of id uniqueness; allocation never takes the store lock.
    next_id: AtomicU64,
}

impl Store {
    /// Open the store: connect the catalog, rebuild volumes and their
    /// in-memory indexes from catalog rows, and make sure exactly one
    /// volume is accepting appends.
    ///
    /// Recovery does not scan volume files. `current_size` and the index
    /// contents come from the catalog, so a partial trailing record left
    /// by a crash is simply overwritten by the next append.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let catalog = Catalog::open(&config.catalog)?;

        let store = Self {
            data_dir: config.data_dir,
            max_volume_size: config.max_volume_size,
            read_only: config.read_only,
            catalog,
            set: RwLock::new(VolumeSet {
                volumes: HashMap::new(),
                active_id: 0,
            }),
            next_id: AtomicU64::new(1),
        };

        store.recover()?;

        let needs_volume = {
            let set = store.set.read();
            set.volumes.is_empty() || !set.volumes.contains_key(&set.active_id)
        };
        if needs_volume {
            store.create_volume()?;
        }

        Ok(store)
    }

    fn recover(&self) -> Result<(), StoreError> {
        let infos = self.catalog.load_all_volumes()?;
        {
            let mut set = self.set.write();
            for info in &infos {
                let vol = match Volume::open(info.id, &self.data_dir, self.max_volume_size) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("failed to open volume {}: {}, skipping", info.id, e);
                        continue;
                    }
                };
                // The catalog row, not the file length, is authoritative
                // for the append position after a crash.
                vol.restore_state(info.current_size, info.active);
                set.volumes.insert(info.id, Arc::new(vol));
                if info.active && info.id > set.active_id {
                    set.active_id = info.id;
                }
            }
        }

        let metas = self.catalog.load_all_including_deleted()?;
        let set = self.set.read();
        let mut next_id = 1u64;
        let mut live = 0usize;
        for meta in &metas {
            if let Some(vol) = set.volumes.get(&meta.volume_id) {
                let mut flags = meta.flags;
                if meta.deleted {
                    flags |= FLAG_DELETED;
                }
                vol.restore_entry(
                    meta.id,
                    NeedleInfo {
                        offset: meta.offset,
                        size: meta.size,
                        flags,
                        volume_id: meta.volume_id,
                    },
                );
                if !meta.deleted {
                    live += 1;
                }
            }
            if meta.id >= next_id {
                next_id = meta.id + 1;
            }
        }
        self.next_id.store(next_id, Ordering::SeqCst);

        tracing::info!(
            "recovered {} volume(s), {} file(s) ({} live, {} deleted) from catalog",
            set.volumes.len(),
            metas.len(),
            live,
            metas.len() - live
        );
        Ok(())
    }

    /// Create a fresh volume, persist its row, and make it active. Called
    /// at startup and on rollover.
    fn create_volume(&self) -> Result<Arc<Volume>, StoreError> {
        let mut set = self.set.write();

        // Another writer may have rolled over while we waited for the lock.
        if let Some(vol) = set.volumes.get(&set.active_id) {
            if vol.is_active() {
                return Ok(vol.clone());
            }
        }

        let new_id = set
            .volumes
            .keys()
            .max()
            .copied()
            .unwrap_or(0)
            .max(set.active_id)
            + 1;
        let vol = Volume::open(new_id, &self.data_dir, self.max_volume_size)?;

        let now = now_unix();
        self.catalog.save_volume(&VolumeInfo {
            id: new_id,
            file_path: vol.path().to_string_lossy().into_owned(),
            max_size: self.max_volume_size,
            current_size: 0,
            active: true,
            create_time: now,
            update_time: now,
        })?;

        let vol = Arc::new(vol);
        set.volumes.insert(new_id, vol.clone());
        set.active_id = new_id;

        needlestore_metrics::metrics().volumes_created.inc();
        tracing::info!("created volume {}", new_id);
        Ok(vol)
    }

    /// Store a payload. Returns the allocated id.
    ///
    /// The id counter is bumped unconditionally, so a failed write still
    /// burns an id: ids are monotonic but may be sparse.
    pub fn write(&self, data: &[u8], file_name: &str, mime_type: &str) -> Result<u64, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _timer = needlestore_metrics::start_op_timer("write");

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let md5 = hex::encode(Md5::digest(data));
        let now = now_unix();
        let needle = Needle::new(id, now as u32, now, data.to_vec());

        let (mut vol, mut vol_id) = {
            let set = self.set.read();
            let vol = set
                .volumes
                .get(&set.active_id)
                .cloned()
                .ok_or(StoreError::VolumeNotFound(set.active_id))?;
            (vol, set.active_id)
        };

        let offset = match vol.write_needle(&needle) {
            Ok(offset) => offset,
            Err(VolumeError::VolumeFull(_)) => {
                if let Err(e) = self.catalog.set_volume_inactive(vol_id) {
                    tracing::warn!("failed to mark volume {} inactive in catalog: {}", vol_id, e);
                }
                vol = self.create_volume()?;
                vol_id = vol.id();
                // Retry exactly once on the fresh volume.
                vol.write_needle(&needle)?
            }
            Err(VolumeError::VolumeRetired(_)) => {
                // Mid-compaction swap: `create_volume` blocks on the store
                // lock until the replacement is published, then hands back
                // the current active volume for the single retry.
                vol = self.create_volume()?;
                vol_id = vol.id();
                vol.write_needle(&needle)?
            }
            Err(e) => return Err(e.into()),
        };

        let meta = FileMetadata {
            id,
            volume_id: vol_id,
            offset,
            size: needle.data_size(),
            cookie: needle.cookie,
            flags: needle.flags,
            deleted: false,
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            md5,
            create_time: now,
            update_time: now,
        };
        // A failed catalog save leaves the needle readable through the
        // in-memory index until restart; the orphan is reclaimed by a
        // later compaction. Not worth failing the write over.
        if let Err(e) = self.catalog.save_file(&meta) {
            tracing::warn!("failed to save metadata for needle {}: {}", id, e);
        }
        if let Err(e) = self.catalog.update_volume_size(vol_id, vol.current_size()) {
            tracing::warn!("failed to update size of volume {}: {}", vol_id, e);
        }

        let m = needlestore_metrics::metrics();
        m.writes_total.inc();
        m.bytes_written_total.inc_by(data.len() as u64);
        Ok(id)
    }

    /// Fetch a payload by id.
    ///
    /// Volume count stays in the tens, so a linear scan over volumes is
    /// fine; each probe is a single hash lookup.
    pub fn read(&self, id: u64) -> Result<Vec<u8>, StoreError> {
        let _timer = needlestore_metrics::start_op_timer("read");

        for vol in self.volumes_snapshot() {
            match vol.read_needle(id) {
                Ok(needle) => {
                    let m = needlestore_metrics::metrics();
                    m.reads_total.inc();
                    m.bytes_read_total.inc_by(needle.data.len() as u64);
                    return Ok(needle.data);
                }
                Err(VolumeError::NeedleNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::NeedleNotFound(id))
    }

    /// Fetch payload and catalog row together. The catalog decides
    /// existence; a row without readable bytes surfaces the read error.
    pub fn read_with_metadata(&self, id: u64) -> Result<(Vec<u8>, FileMetadata), StoreError> {
        let meta = self
            .catalog
            .get_file(id)?
            .ok_or(StoreError::NeedleNotFound(id))?;
        let data = self.read(id)?;
        Ok((data, meta))
    }

    pub fn get_metadata(&self, id: u64) -> Result<FileMetadata, StoreError> {
        self.catalog
            .get_file(id)?
            .ok_or(StoreError::NeedleNotFound(id))
    }

    /// Tombstone an object. The in-memory tombstone and the catalog row
    /// are updated in that order and not atomically; recovery re-reads
    /// tombstones from the catalog, so success is only reported when both
    /// updates land.
    ///
    /// A retired volume (mid-compaction swap) rejects tombstones; the
    /// retry's snapshot blocks on the store lock until the replacement is
    /// published, so the tombstone lands in the volume that survives. A
    /// volume that never leaves the retired state means a failed swap
    /// already left the store broken, so the retries are bounded.
    pub fn delete(&self, id: u64) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _timer = needlestore_metrics::start_op_timer("delete");

        let mut stuck = 0u32;
        for _ in 0..8 {
            let mut saw_retired = None;
            for vol in self.volumes_snapshot() {
                match vol.delete_needle(id) {
                    Ok(()) => {
                        self.catalog.delete_file(id)?;
                        needlestore_metrics::metrics().deletes_total.inc();
                        return Ok(());
                    }
                    Err(VolumeError::NeedleNotFound(_)) => continue,
                    Err(VolumeError::VolumeRetired(vid)) => saw_retired = Some(vid),
                    Err(e) => return Err(e.into()),
                }
            }
            match saw_retired {
                Some(vid) => stuck = vid,
                None => return Err(StoreError::NeedleNotFound(id)),
            }
        }
        Err(StoreError::Volume(VolumeError::VolumeRetired(stuck)))
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<FileMetadata>, StoreError> {
        Ok(self.catalog.find_by_name(name)?)
    }

    pub fn list_by_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<FileMetadata>, StoreError> {
        Ok(self.catalog.list_by_prefix(prefix, limit)?)
    }

    pub fn list_all(&self) -> Result<Vec<FileMetadata>, StoreError> {
        Ok(self.catalog.load_all_files()?)
    }

    /// Store-wide counters. Prefers the catalog's aggregates and falls
    /// back to the in-memory indexes when the catalog query fails.
    pub fn status(&self) -> StoreStatus {
        let (active_volume, volume_count) = {
            let set = self.set.read();
            (set.active_id, set.volumes.len() as u64)
        };
        let next_id = self.next_id.load(Ordering::SeqCst);

        match self.catalog.stats() {
            Ok(stats) => StoreStatus {
                total_files: stats.total_files,
                deleted_files: stats.deleted_files,
                active_files: stats.active_files,
                total_size: stats.total_size,
                volume_count: stats.volume_count,
                active_volume,
                next_id,
            },
            Err(e) => {
                tracing::warn!("catalog stats failed: {}, using in-memory counters", e);
                let mut total_files = 0u64;
                let mut deleted_files = 0u64;
                let mut total_size = 0u64;
                for vol in self.volumes_snapshot() {
                    let (total, deleted) = vol.counts();
                    total_files += total as u64;
                    deleted_files += deleted as u64;
                    total_size += vol.current_size();
                }
                StoreStatus {
                    total_files,
                    deleted_files,
                    active_files: total_files - deleted_files,
                    total_size,
                    volume_count,
                    active_volume,
                    next_id,
                }
            }
        }
    }

    /// Flush every volume to stable storage. Failures are logged per
    /// volume; the sweep continues.
    pub fn sync_all(&self) {
        for vol in self.volumes_snapshot() {
            if let Err(e) = vol.sync() {
                tracing::warn!("failed to sync volume {}: {}", vol.id(), e);
            }
        }
    }

    /// Sync and release all volumes. In-flight operations holding volume
    /// references finish against the old handles.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut set = self.set.write();
        for vol in set.volumes.values() {
            if let Err(e) = vol.sync() {
                tracing::warn!("failed to sync volume {} on close: {}", vol.id(), e);
            }
        }
        set.volumes.clear();
        tracing::info!("store closed");
        Ok(())
    }

    // --- crate-internal access for the compactor ---

    pub(crate) fn volumes_snapshot(&self) -> Vec<Arc<Volume>> {
        self.set.read().volumes.values().cloned().collect()
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn max_volume_size(&self) -> u64 {
        self.max_volume_size
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Commit a rewritten volume: under the store write lock, verify the
    /// source saw no writes or deletes since `expected_size` and
    /// `expected_deleted` were sampled, rename the temp file over the
    /// canonical path (POSIX-atomic, no pre-unlink), reopen it under the
    /// original id, rebuild its index by scanning, and swap it into the
    /// volume table. Returns the rewritten volume's size, or `None` when
    /// the source changed and nothing was touched.
    pub(crate) fn commit_compacted_volume(
        &self,
        old: &Arc<Volume>,
        temp_path: &Path,
        expected_size: u64,
        expected_deleted: usize,
    ) -> Result<Option<u64>, StoreError> {
        let mut set = self.set.write();

        // Retire the source and sample its state in one lock acquisition:
        // a writer or deleter that grabbed the volume before this store
        // lock was taken either landed before the sample (and shows up in
        // the mismatch check) or bounces off the retired flag and retries
        // against the replacement. No mutation can fall between the
        // retirement and the sample.
        let (current_size, deleted) = old.retire_and_snapshot();
        if current_size != expected_size || deleted != expected_deleted {
            old.set_retired(false);
            return Ok(None);
        }

        let canonical = self.data_dir.join(volume_file_name(old.id()));
        if let Err(e) = std::fs::rename(temp_path, &canonical) {
            old.set_retired(false);
            return Err(e.into());
        }

        // Past the rename the old file is gone from the namespace; the
        // source stays retired even on error so no append can reach the
        // orphaned inode.
        let new_vol = Volume::open(old.id(), &self.data_dir, self.max_volume_size)?;
        new_vol.load_index()?;
        let new_size = new_vol.current_size();
        set.volumes.insert(old.id(), Arc::new(new_vol));
        Ok(Some(new_size))
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Spawn the periodic volume sync task.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_sync_task(store: Arc<Store>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            store.sync_all();
            tracing::debug!("volume sync sweep complete");
        }
    })
}
