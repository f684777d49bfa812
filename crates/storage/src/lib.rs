//! Storage engine for needlestore: append-only volumes + metadata catalog.
//!
//! Small objects ("needles") are packed into large append-only volume
//! files; a durable catalog maps ids to on-disk positions and carries
//! per-object attributes. Tombstoned space is reclaimed by background
//! compaction while the store keeps serving.

pub mod catalog;
pub mod chunk;
pub mod compaction;
pub mod needle;
pub mod store;
pub mod volume;

pub use catalog::{Catalog, CatalogOptions, CatalogStats, FileMetadata, VolumeInfo};
pub use chunk::ChunkManager;
pub use compaction::{spawn_compaction_task, CompactorConfig};
pub use needle::{Needle, NeedleInfo};
pub use store::{spawn_sync_task, Store, StoreConfig, StoreError, StoreStatus};
pub use volume::Volume;
