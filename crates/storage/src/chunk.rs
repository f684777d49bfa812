//! Chunked upload staging.
//!
//! Large uploads arrive as numbered chunks which are staged as files
//! under a per-upload temp directory. Once every chunk is present, the
//! assembler merges them into a single buffer which the caller hands to
//! `Store::write`. The staging area is independent of the store: losing
//! it only aborts in-flight uploads.

use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("upload {0} not found")]
    UploadNotFound(String),
    #[error("chunk index {index} out of range (upload has {total} chunks)")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("upload incomplete: {have}/{want} chunks")]
    Incomplete { have: usize, want: usize },
    #[error("chunk I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One in-flight chunked upload.
struct ChunkUpload {
    file_name: String,
    total_chunks: usize,
    total_size: u64,
    dir: PathBuf,
    received: RwLock<HashSet<usize>>,
}

/// Summary row for listing in-flight uploads.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkUploadStatus {
    pub upload_id: String,
    pub file_name: String,
    pub total_chunks: usize,
    pub uploaded: usize,
    pub total_size: u64,
}

/// Tracks all in-flight chunked uploads and their staging directories.
pub struct ChunkManager {
    uploads: RwLock<HashMap<String, Arc<ChunkUpload>>>,
    temp_dir: PathBuf,
}

impl ChunkManager {
    /// Create the manager and its staging root.
    pub fn new(temp_dir: PathBuf) -> Result<Self, ChunkError> {
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            uploads: RwLock::new(HashMap::new()),
            temp_dir,
        })
    }

    /// Register a new upload and return its id (a digest of name, size
    /// and chunk count, so retried inits land on the same session).
    pub fn init_upload(
        &self,
        file_name: &str,
        total_chunks: usize,
        total_size: u64,
    ) -> Result<String, ChunkError> {
        let upload_id = hex::encode(Md5::digest(
            format!("{}-{}-{}", file_name, total_size, total_chunks).as_bytes(),
        ));
        let dir = self.temp_dir.join(&upload_id);
        std::fs::create_dir_all(&dir)?;

        let upload = Arc::new(ChunkUpload {
            file_name: file_name.to_string(),
            total_chunks,
            total_size,
            dir,
            received: RwLock::new(HashSet::new()),
        });
        self.uploads.write().insert(upload_id.clone(), upload);
        tracing::debug!(
            "chunked upload {} started: {} chunk(s), {} byte(s)",
            upload_id,
            total_chunks,
            total_size
        );
        Ok(upload_id)
    }

    fn get(&self, upload_id: &str) -> Result<Arc<ChunkUpload>, ChunkError> {
        self.uploads
            .read()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| ChunkError::UploadNotFound(upload_id.to_string()))
    }

    /// Stage one chunk. Re-sending an already-staged chunk is a no-op.
    pub fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        data: &[u8],
    ) -> Result<(), ChunkError> {
        let upload = self.get(upload_id)?;
        if index >= upload.total_chunks {
            return Err(ChunkError::IndexOutOfRange {
                index,
                total: upload.total_chunks,
            });
        }

        let mut received = upload.received.write();
        if received.contains(&index) {
            return Ok(());
        }
        std::fs::write(upload.dir.join(format!("chunk_{}", index)), data)?;
        received.insert(index);
        Ok(())
    }

    /// `(staged, total)` chunk counts.
    pub fn progress(&self, upload_id: &str) -> Result<(usize, usize), ChunkError> {
        let upload = self.get(upload_id)?;
        let staged = upload.received.read().len();
        Ok((staged, upload.total_chunks))
    }

    pub fn is_complete(&self, upload_id: &str) -> bool {
        match self.get(upload_id) {
            Ok(upload) => upload.received.read().len() == upload.total_chunks,
            Err(_) => false,
        }
    }

    /// Concatenate all chunks in order into one buffer. Fails while any
    /// chunk is still missing. Returns the buffer and the file name given
    /// at init.
    pub fn merge(&self, upload_id: &str) -> Result<(Vec<u8>, String), ChunkError> {
        let upload = self.get(upload_id)?;
        let received = upload.received.read();
        if received.len() != upload.total_chunks {
            return Err(ChunkError::Incomplete {
                have: received.len(),
                want: upload.total_chunks,
            });
        }
        drop(received);

        let mut merged = Vec::with_capacity(upload.total_size as usize);
        for index in 0..upload.total_chunks {
            let chunk = std::fs::read(upload.dir.join(format!("chunk_{}", index)))?;
            merged.extend_from_slice(&chunk);
        }
        Ok((merged, upload.file_name.clone()))
    }

    /// Drop the upload and its staging directory. Unknown ids are fine.
    pub fn cleanup(&self, upload_id: &str) -> Result<(), ChunkError> {
        let upload = match self.uploads.write().remove(upload_id) {
            Some(u) => u,
            None => return Ok(()),
        };
        std::fs::remove_dir_all(&upload.dir)?;
        Ok(())
    }

    /// Summaries of every in-flight upload.
    pub fn list_uploads(&self) -> Vec<ChunkUploadStatus> {
        self.uploads
            .read()
            .iter()
            .map(|(id, upload)| ChunkUploadStatus {
                upload_id: id.clone(),
                file_name: upload.file_name.clone(),
                total_chunks: upload.total_chunks,
                uploaded: upload.received.read().len(),
                total_size: upload.total_size,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ChunkManager {
        ChunkManager::new(dir.path().join("chunks")).unwrap()
    }

    #[test]
    fn test_full_upload_cycle() {
        let dir = TempDir::new().unwrap();
        let cm = manager(&dir);

        let id = cm.init_upload("big.bin", 3, 9).unwrap();
        assert!(!cm.is_complete(&id));

        cm.upload_chunk(&id, 0, b"aaa").unwrap();
        cm.upload_chunk(&id, 2, b"ccc").unwrap();
        assert_eq!(cm.progress(&id).unwrap(), (2, 3));

        cm.upload_chunk(&id, 1, b"bbb").unwrap();
        assert!(cm.is_complete(&id));

        let (data, name) = cm.merge(&id).unwrap();
        assert_eq!(data, b"aaabbbccc");
        assert_eq!(name, "big.bin");

        cm.cleanup(&id).unwrap();
        assert!(matches!(
            cm.progress(&id),
            Err(ChunkError::UploadNotFound(_))
        ));
    }

    #[test]
    fn test_merge_incomplete_fails() {
        let dir = TempDir::new().unwrap();
        let cm = manager(&dir);

        let id = cm.init_upload("x.bin", 2, 4).unwrap();
        cm.upload_chunk(&id, 0, b"ab").unwrap();

        match cm.merge(&id) {
            Err(ChunkError::Incomplete { have, want }) => {
                assert_eq!((have, want), (1, 2));
            }
            other => panic!("expected Incomplete, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cm = manager(&dir);

        let id = cm.init_upload("x.bin", 1, 2).unwrap();
        cm.upload_chunk(&id, 0, b"ok").unwrap();
        // The retry carries different bytes; the first staged copy wins.
        cm.upload_chunk(&id, 0, b"!!").unwrap();

        let (data, _) = cm.merge(&id).unwrap();
        assert_eq!(data, b"ok");
    }

    #[test]
    fn test_rejects_out_of_range_index() {
        let dir = TempDir::new().unwrap();
        let cm = manager(&dir);

        let id = cm.init_upload("x.bin", 2, 4).unwrap();
        assert!(matches!(
            cm.upload_chunk(&id, 2, b"zz"),
            Err(ChunkError::IndexOutOfRange { index: 2, total: 2 })
        ));
    }

    #[test]
    fn test_unknown_upload() {
        let dir = TempDir::new().unwrap();
        let cm = manager(&dir);
        assert!(matches!(
            cm.upload_chunk("nope", 0, b""),
            Err(ChunkError::UploadNotFound(_))
        ));
        assert!(!cm.is_complete("nope"));
        // Cleanup of an unknown id is not an error.
        cm.cleanup("nope").unwrap();
    }

    #[test]
    fn test_list_uploads() {
        let dir = TempDir::new().unwrap();
        let cm = manager(&dir);

        let a = cm.init_upload("a.bin", 2, 10).unwrap();
        let _b = cm.init_upload("b.bin", 1, 5).unwrap();
        cm.upload_chunk(&a, 0, b"12345").unwrap();

        let mut uploads = cm.list_uploads();
        uploads.sort_by(|x, y| x.file_name.cmp(&y.file_name));
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].file_name, "a.bin");
        assert_eq!(uploads[0].uploaded, 1);
        assert_eq!(uploads[1].uploaded, 0);
    }

    #[test]
    fn test_same_parameters_same_session() {
        let dir = TempDir::new().unwrap();
        let cm = manager(&dir);

        let first = cm.init_upload("same.bin", 4, 100).unwrap();
        let second = cm.init_upload("same.bin", 4, 100).unwrap();
        assert_eq!(first, second, "identical init parameters produce the same id");
    }
}
