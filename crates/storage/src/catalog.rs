//! Durable metadata catalog: per-object and per-volume rows.
//!
//! The catalog is the source of truth across restarts: recovery rebuilds
//! every volume's in-memory index from `file_metadata` rows rather than
//! scanning volume files. The engine set is closed — an embedded SQLite
//! file for durable deployments and an in-process map for tests and
//! ephemeral runs — and is dispatched as a sum type.

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-object catalog row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub id: u64,
    pub volume_id: u32,
    pub offset: u64,
    pub size: u32,
    pub cookie: u32,
    pub flags: u8,
    pub deleted: bool,
    pub file_name: String,
    pub mime_type: String,
    pub md5: String,
    pub create_time: i64,
    pub update_time: i64,
}

/// Per-volume catalog row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeInfo {
    pub id: u32,
    pub file_path: String,
    pub max_size: u64,
    pub current_size: u64,
    pub active: bool,
    pub create_time: i64,
    pub update_time: i64,
}

/// Aggregate counters over the catalog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStats {
    pub total_files: u64,
    pub deleted_files: u64,
    pub active_files: u64,
    pub total_size: u64,
    pub volume_count: u64,
}

/// Engine selection plus connection parameters.
#[derive(Debug, Clone)]
pub enum CatalogOptions {
    Sqlite { path: PathBuf },
    Memory,
}

/// The metadata store, dispatching over the closed engine set.
pub enum Catalog {
    Sqlite(SqliteCatalog),
    Memory(MemoryCatalog),
}

impl Catalog {
    /// Open the selected engine and auto-migrate its schema.
    pub fn open(options: &CatalogOptions) -> Result<Self, CatalogError> {
        match options {
            CatalogOptions::Sqlite { path } => {
                tracing::info!("opening sqlite catalog at {:?}", path);
                Ok(Self::Sqlite(SqliteCatalog::open(path)?))
            }
            CatalogOptions::Memory => {
                tracing::info!("opening in-memory catalog");
                Ok(Self::Memory(MemoryCatalog::new()))
            }
        }
    }

    pub fn save_file(&self, meta: &FileMetadata) -> Result<(), CatalogError> {
        match self {
            Self::Sqlite(c) => c.save_file(meta),
            Self::Memory(c) => c.save_file(meta),
        }
    }

    /// Fetch a row by id, skipping deleted rows.
    pub fn get_file(&self, id: u64) -> Result<Option<FileMetadata>, CatalogError> {
        match self {
            Self::Sqlite(c) => c.get_file(id),
            Self::Memory(c) => c.get_file(id),
        }
    }

    /// Logically delete: `deleted = true`, `flags |= 1`. The row is kept so
    /// ids are never reused and tombstones survive restarts.
    pub fn delete_file(&self, id: u64) -> Result<(), CatalogError> {
        match self {
            Self::Sqlite(c) => c.delete_file(id),
            Self::Memory(c) => c.delete_file(id),
        }
    }

    pub fn load_all_files(&self) -> Result<Vec<FileMetadata>, CatalogError> {
        match self {
            Self::Sqlite(c) => c.load_files(false),
            Self::Memory(c) => c.load_files(false),
        }
    }

    pub fn load_all_including_deleted(&self) -> Result<Vec<FileMetadata>, CatalogError> {
        match self {
            Self::Sqlite(c) => c.load_files(true),
            Self::Memory(c) => c.load_files(true),
        }
    }

    /// Most recent non-deleted row with an exact filename match.
    pub fn find_by_name(&self, name: &str) -> Result<Option<FileMetadata>, CatalogError> {
        match self {
            Self::Sqlite(c) => c.find_by_name(name),
            Self::Memory(c) => c.find_by_name(name),
        }
    }

    /// Non-deleted rows whose filename starts with `prefix`, at most
    /// `limit` (0 = unbounded), in id order.
    pub fn list_by_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<FileMetadata>, CatalogError> {
        match self {
            Self::Sqlite(c) => c.list_by_prefix(prefix, limit),
            Self::Memory(c) => c.list_by_prefix(prefix, limit),
        }
    }

    pub fn save_volume(&self, info: &VolumeInfo) -> Result<(), CatalogError> {
        match self {
            Self::Sqlite(c) => c.save_volume(info),
            Self::Memory(c) => c.save_volume(info),
        }
    }

    pub fn update_volume_size(&self, id: u32, size: u64) -> Result<(), CatalogError> {
        match self {
            Self::Sqlite(c) => c.update_volume_size(id, size),
            Self::Memory(c) => c.update_volume_size(id, size),
        }
    }

    pub fn set_volume_inactive(&self, id: u32) -> Result<(), CatalogError> {
        match self {
            Self::Sqlite(c) => c.set_volume_inactive(id),
            Self::Memory(c) => c.set_volume_inactive(id),
        }
    }

    pub fn load_all_volumes(&self) -> Result<Vec<VolumeInfo>, CatalogError> {
        match self {
            Self::Sqlite(c) => c.load_all_volumes(),
            Self::Memory(c) => c.load_all_volumes(),
        }
    }

    pub fn stats(&self) -> Result<CatalogStats, CatalogError> {
        match self {
            Self::Sqlite(c) => c.stats(),
            Self::Memory(c) => c.stats(),
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// SQLite engine
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    id          INTEGER PRIMARY KEY,
    volume_id   INTEGER NOT NULL,
    offset      INTEGER NOT NULL,
    size        INTEGER NOT NULL,
    cookie      INTEGER NOT NULL,
    flags       INTEGER NOT NULL DEFAULT 0,
    deleted     INTEGER NOT NULL DEFAULT 0,
    file_name   TEXT    NOT NULL DEFAULT '',
    mime_type   TEXT    NOT NULL DEFAULT '',
    md5         TEXT    NOT NULL DEFAULT '',
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_metadata_volume  ON file_metadata(volume_id);
CREATE INDEX IF NOT EXISTS idx_file_metadata_deleted ON file_metadata(deleted);
CREATE INDEX IF NOT EXISTS idx_file_metadata_name    ON file_metadata(file_name);
CREATE INDEX IF NOT EXISTS idx_file_metadata_md5     ON file_metadata(md5);

CREATE TABLE IF NOT EXISTS volume_info (
    id           INTEGER PRIMARY KEY,
    file_path    TEXT    NOT NULL,
    max_size     INTEGER NOT NULL,
    current_size INTEGER NOT NULL DEFAULT 0,
    active       INTEGER NOT NULL DEFAULT 1,
    create_time  INTEGER NOT NULL,
    update_time  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_volume_info_active ON volume_info(active);
"#;

const FILE_COLUMNS: &str = "id, volume_id, offset, size, cookie, flags, deleted, \
     file_name, mime_type, md5, create_time, update_time";

/// SQLite-backed catalog. A single connection in WAL mode behind a mutex;
/// every operation is one short statement, so contention stays low.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileMetadata> {
        Ok(FileMetadata {
            id: row.get::<_, i64>(0)? as u64,
            volume_id: row.get::<_, i64>(1)? as u32,
            offset: row.get::<_, i64>(2)? as u64,
            size: row.get::<_, i64>(3)? as u32,
            cookie: row.get::<_, i64>(4)? as u32,
            flags: row.get::<_, i64>(5)? as u8,
            deleted: row.get(6)?,
            file_name: row.get(7)?,
            mime_type: row.get(8)?,
            md5: row.get(9)?,
            create_time: row.get(10)?,
            update_time: row.get(11)?,
        })
    }

    fn save_file(&self, meta: &FileMetadata) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO file_metadata \
             (id, volume_id, offset, size, cookie, flags, deleted, \
              file_name, mime_type, md5, create_time, update_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                meta.id as i64,
                meta.volume_id as i64,
                meta.offset as i64,
                meta.size as i64,
                meta.cookie as i64,
                meta.flags as i64,
                meta.deleted,
                meta.file_name,
                meta.mime_type,
                meta.md5,
                meta.create_time,
                now_unix(),
            ],
        )?;
        Ok(())
    }

    fn get_file(&self, id: u64) -> Result<Option<FileMetadata>, CatalogError> {
        let conn = self.conn.lock();
        let meta = conn
            .query_row(
                &format!(
                    "SELECT {} FROM file_metadata WHERE id = ?1 AND deleted = 0",
                    FILE_COLUMNS
                ),
                params![id as i64],
                Self::row_to_file,
            )
            .optional()?;
        Ok(meta)
    }

    fn delete_file(&self, id: u64) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE file_metadata SET deleted = 1, flags = flags | 1, update_time = ?2 \
             WHERE id = ?1",
            params![id as i64, now_unix()],
        )?;
        Ok(())
    }

    fn load_files(&self, include_deleted: bool) -> Result<Vec<FileMetadata>, CatalogError> {
        let conn = self.conn.lock();
        let sql = if include_deleted {
            format!("SELECT {} FROM file_metadata ORDER BY id", FILE_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM file_metadata WHERE deleted = 0 ORDER BY id",
                FILE_COLUMNS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn find_by_name(&self, name: &str) -> Result<Option<FileMetadata>, CatalogError> {
        let conn = self.conn.lock();
        let meta = conn
            .query_row(
                &format!(
                    "SELECT {} FROM file_metadata \
                     WHERE file_name = ?1 AND deleted = 0 ORDER BY id DESC LIMIT 1",
                    FILE_COLUMNS
                ),
                params![name],
                Self::row_to_file,
            )
            .optional()?;
        Ok(meta)
    }

    fn list_by_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<FileMetadata>, CatalogError> {
        let conn = self.conn.lock();
        let pattern = format!("{}%", prefix);
        let sql = if limit > 0 {
            format!(
                "SELECT {} FROM file_metadata \
                 WHERE file_name LIKE ?1 AND deleted = 0 ORDER BY id LIMIT {}",
                FILE_COLUMNS, limit
            )
        } else {
            format!(
                "SELECT {} FROM file_metadata \
                 WHERE file_name LIKE ?1 AND deleted = 0 ORDER BY id",
                FILE_COLUMNS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![pattern], Self::row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn save_volume(&self, info: &VolumeInfo) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO volume_info \
             (id, file_path, max_size, current_size, active, create_time, update_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                info.id as i64,
                info.file_path,
                info.max_size as i64,
                info.current_size as i64,
                info.active,
                info.create_time,
                now_unix(),
            ],
        )?;
        Ok(())
    }

    fn update_volume_size(&self, id: u32, size: u64) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE volume_info SET current_size = ?2, update_time = ?3 WHERE id = ?1",
            params![id as i64, size as i64, now_unix()],
        )?;
        Ok(())
    }

    fn set_volume_inactive(&self, id: u32) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE volume_info SET active = 0, update_time = ?2 WHERE id = ?1",
            params![id as i64, now_unix()],
        )?;
        Ok(())
    }

    fn load_all_volumes(&self) -> Result<Vec<VolumeInfo>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, file_path, max_size, current_size, active, create_time, update_time \
             FROM volume_info ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(VolumeInfo {
                    id: row.get::<_, i64>(0)? as u32,
                    file_path: row.get(1)?,
                    max_size: row.get::<_, i64>(2)? as u64,
                    current_size: row.get::<_, i64>(3)? as u64,
                    active: row.get(4)?,
                    create_time: row.get(5)?,
                    update_time: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn stats(&self) -> Result<CatalogStats, CatalogError> {
        let conn = self.conn.lock();
        let total_files: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |r| r.get(0))?;
        let deleted_files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM file_metadata WHERE deleted = 1",
            [],
            |r| r.get(0),
        )?;
        let total_size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM file_metadata",
            [],
            |r| r.get(0),
        )?;
        let volume_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM volume_info", [], |r| r.get(0))?;

        Ok(CatalogStats {
            total_files: total_files as u64,
            deleted_files: deleted_files as u64,
            active_files: (total_files - deleted_files) as u64,
            total_size: total_size as u64,
            volume_count: volume_count as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Memory engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    files: BTreeMap<u64, FileMetadata>,
    volumes: BTreeMap<u32, VolumeInfo>,
}

/// Map-backed catalog with the same semantics as the SQLite engine.
/// Nothing survives a restart; recovery sees an empty store.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<MemoryInner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_file(&self, meta: &FileMetadata) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        let mut meta = meta.clone();
        meta.update_time = now_unix();
        inner.files.insert(meta.id, meta);
        Ok(())
    }

    fn get_file(&self, id: u64) -> Result<Option<FileMetadata>, CatalogError> {
        let inner = self.inner.read();
        Ok(inner.files.get(&id).filter(|m| !m.deleted).cloned())
    }

    fn delete_file(&self, id: u64) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        if let Some(meta) = inner.files.get_mut(&id) {
            meta.deleted = true;
            meta.flags |= 1;
            meta.update_time = now_unix();
        }
        Ok(())
    }

    fn load_files(&self, include_deleted: bool) -> Result<Vec<FileMetadata>, CatalogError> {
        let inner = self.inner.read();
        Ok(inner
            .files
            .values()
            .filter(|m| include_deleted || !m.deleted)
            .cloned()
            .collect())
    }

    fn find_by_name(&self, name: &str) -> Result<Option<FileMetadata>, CatalogError> {
        let inner = self.inner.read();
        Ok(inner
            .files
            .values()
            .rev()
            .find(|m| !m.deleted && m.file_name == name)
            .cloned())
    }

    fn list_by_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<FileMetadata>, CatalogError> {
        let inner = self.inner.read();
        let iter = inner
            .files
            .values()
            .filter(|m| !m.deleted && m.file_name.starts_with(prefix))
            .cloned();
        Ok(if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        })
    }

    fn save_volume(&self, info: &VolumeInfo) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        let mut info = info.clone();
        info.update_time = now_unix();
        inner.volumes.insert(info.id, info);
        Ok(())
    }

    fn update_volume_size(&self, id: u32, size: u64) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        if let Some(info) = inner.volumes.get_mut(&id) {
            info.current_size = size;
            info.update_time = now_unix();
        }
        Ok(())
    }

    fn set_volume_inactive(&self, id: u32) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        if let Some(info) = inner.volumes.get_mut(&id) {
            info.active = false;
            info.update_time = now_unix();
        }
        Ok(())
    }

    fn load_all_volumes(&self) -> Result<Vec<VolumeInfo>, CatalogError> {
        let inner = self.inner.read();
        Ok(inner.volumes.values().cloned().collect())
    }

    fn stats(&self) -> Result<CatalogStats, CatalogError> {
        let inner = self.inner.read();
        let total_files = inner.files.len() as u64;
        let deleted_files = inner.files.values().filter(|m| m.deleted).count() as u64;
        let total_size: u64 = inner.files.values().map(|m| m.size as u64).sum();
        Ok(CatalogStats {
            total_files,
            deleted_files,
            active_files: total_files - deleted_files,
            total_size,
            volume_count: inner.volumes.len() as u64,
        })
    }
}
