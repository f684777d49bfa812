//! Background compaction: rewriting volumes to reclaim tombstoned space.
//!
//! A sweep walks every volume, and any volume whose tombstone ratio
//! crosses the configured threshold is rewritten: live needles are copied
//! into a temporary volume, the temp file is renamed over the canonical
//! path (POSIX-atomic, no pre-unlink), and the fresh volume is swapped
//! into the store's table under the original id.

use crate::store::{Store, StoreError};
use crate::volume::Volume;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Duration;

/// Temp volumes live at `source id + this offset`; volume ids are
/// allocated sequentially from 1, so collisions do not occur in practice.
const TEMP_VOLUME_ID_OFFSET: u32 = 10_000;

/// Configuration for the background compaction task.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Whether the periodic task runs at all.
    pub enabled: bool,
    /// Time between sweeps.
    pub interval: Duration,
    /// Tombstone ratio (0..1) above which a volume is rewritten.
    pub deleted_threshold: f64,
    /// Volumes smaller than this are never considered.
    pub min_volume_size: u64,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            deleted_threshold: 0.3,
            min_volume_size: 10 * 1024 * 1024,
        }
    }
}

/// Waste counters across all volumes, from the in-memory indexes.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionStats {
    pub total_files: u64,
    pub deleted_files: u64,
    pub total_size: u64,
    pub wasted_size: u64,
    pub wasted_ratio: f64,
}

impl Store {
    /// One compaction sweep. Volumes failing mid-compaction are logged
    /// and the sweep moves on.
    pub fn run_compaction(&self, config: &CompactorConfig) {
        let candidates: Vec<Arc<Volume>> = self
            .volumes_snapshot()
            .into_iter()
            .filter(|v| v.current_size() >= config.min_volume_size)
            .collect();

        for vol in candidates {
            match self.compact_volume(&vol, config) {
                Ok(true) => needlestore_metrics::metrics().compactions_total.inc(),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("failed to compact volume {}: {}", vol.id(), e);
                }
            }
        }
    }

    /// Rewrite one volume if its tombstone ratio crosses the threshold.
    /// Returns whether a rewrite happened.
    ///
    /// Per-needle read or write failures during the copy are logged and
    /// the needle is dropped from the rewritten volume. The swap is
    /// guarded: if the source took any write or delete while the copy
    /// ran, the rewrite is discarded and retried on a later sweep.
    fn compact_volume(
        &self,
        vol: &Arc<Volume>,
        config: &CompactorConfig,
    ) -> Result<bool, StoreError> {
        let (total, deleted) = vol.counts();
        if total == 0 {
            return Ok(false);
        }
        let deleted_ratio = deleted as f64 / total as f64;
        if deleted_ratio < config.deleted_threshold {
            return Ok(false);
        }

        let source_size = vol.current_size();
        tracing::info!(
            "compacting volume {}: {}/{} needles deleted ({:.1}%)",
            vol.id(),
            deleted,
            total,
            deleted_ratio * 100.0
        );

        let temp_id = vol.id() + TEMP_VOLUME_ID_OFFSET;
        let temp = Volume::open(temp_id, self.data_dir(), self.max_volume_size())?;

        let mut copied = 0usize;
        for id in vol.live_ids() {
            let needle = match vol.read_needle(id) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("skipping unreadable needle {} in volume {}: {}", id, vol.id(), e);
                    continue;
                }
            };
            if let Err(e) = temp.write_needle(&needle) {
                tracing::warn!("skipping needle {} during rewrite of volume {}: {}", id, vol.id(), e);
                continue;
            }
            copied += 1;
        }
        temp.sync()?;

        let temp_path = temp.path().to_path_buf();
        // Release the temp handle before the rename; readers of the old
        // volume keep their file descriptor to the replaced inode.
        drop(temp);

        let new_size = match self.commit_compacted_volume(vol, &temp_path, source_size, deleted) {
            Ok(Some(size)) => size,
            Ok(None) => {
                // The source took writes or deletes while we copied; the
                // canonical file was not touched. Discard and retry later.
                tracing::info!(
                    "volume {} changed during compaction, discarding rewrite",
                    vol.id()
                );
                let _ = std::fs::remove_file(&temp_path);
                return Ok(false);
            }
            Err(e) => {
                // No pre-unlink happened, so the source volume is whole
                // either way.
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        if let Err(e) = self.catalog().update_volume_size(vol.id(), new_size) {
            tracing::warn!("failed to update size of volume {}: {}", vol.id(), e);
        }

        let reclaimed = source_size.saturating_sub(new_size);
        needlestore_metrics::metrics()
            .compaction_reclaimed_bytes
            .inc_by(reclaimed);
        tracing::info!(
            "compaction of volume {} complete: {} needle(s) copied, {} byte(s) reclaimed",
            vol.id(),
            copied,
            reclaimed
        );
        Ok(true)
    }

    /// Waste counters from the in-memory indexes (payload bytes only).
    pub fn compaction_stats(&self) -> CompactionStats {
        let mut total_files = 0u64;
        let mut deleted_files = 0u64;
        let mut total_size = 0u64;
        let mut wasted_size = 0u64;

        for vol in self.volumes_snapshot() {
            let (total, deleted) = vol.counts();
            total_files += total as u64;
            deleted_files += deleted as u64;
            wasted_size += vol.wasted_bytes();
            total_size += vol.current_size();
        }

        let wasted_ratio = if total_size > 0 {
            wasted_size as f64 / total_size as f64
        } else {
            0.0
        };
        CompactionStats {
            total_files,
            deleted_files,
            total_size,
            wasted_size,
            wasted_ratio,
        }
    }
}

/// Spawn the periodic compaction task.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_compaction_task(
    store: Arc<Store>,
    config: CompactorConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("compaction disabled");
            return;
        }
        tracing::info!("compaction task started, interval {:?}", config.interval);
        let mut tick = tokio::time::interval(config.interval);
        // The first tick completes immediately; skip it so a sweep does
        // not race store startup.
        tick.tick().await;
        loop {
            tick.tick().await;
            store.run_compaction(&config);
        }
    })
}
