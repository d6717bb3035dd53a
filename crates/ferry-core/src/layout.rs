//! On-disk working tree: `<root>/request_<id>/chunk_<n>/...` plus the chunk archives.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use parking_lot::Mutex;

use crate::model::RequestId;

pub const ARCHIVE_EXTENSION: &str = "tar.zst";
/// Suffix of a download that has not finished yet.
pub const PARTIAL_SUFFIX: &str = ".ferry-partial";

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Hands out per-request workspaces that share one cleanup lock per request.
#[derive(Clone, Debug)]
pub struct StorageLayout {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<RequestId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn workspace(&self, request: RequestId) -> RequestWorkspace {
        let lock = Arc::clone(self.locks.lock().entry(request).or_default());
        RequestWorkspace {
            dir: self.root.join(format!("request_{request}")),
            lock,
        }
    }

    /// Forget the lock of a request that is no longer running.
    pub fn release(&self, request: RequestId) {
        self.locks.lock().remove(&request);
    }
}

#[derive(Clone, Debug)]
pub struct RequestWorkspace {
    dir: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl RequestWorkspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_dir(&self, index: u32) -> PathBuf {
        self.dir.join(format!("chunk_{index}"))
    }

    pub fn archive_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("chunk_{index}.{ARCHIVE_EXTENSION}"))
    }

    /// Create the chunk directory, serialized against cleanup of the same request.
    pub async fn prepare_chunk(&self, index: u32) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let dir = self.chunk_dir(index);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create chunk directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Remove a chunk's downloaded files, its archive and any leftover parts.
    pub async fn cleanup_chunk(&self, index: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        remove_dir_if_present(&self.chunk_dir(index)).await?;

        let archive = self.archive_path(index);
        remove_file_if_present(&archive).await?;
        let prefix = format!(
            "{}.part",
            archive
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
        );
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("list {}", self.dir.display()));
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                remove_file_if_present(&entry.path()).await?;
            }
        }
        Ok(())
    }

    /// Remove the whole request directory.
    pub async fn cleanup_all(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        remove_dir_if_present(&self.dir).await
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_follow_request_and_chunk_scheme() {
        let layout = StorageLayout::new("/data");
        let ws = layout.workspace(12);
        assert_eq!(ws.dir(), Path::new("/data/request_12"));
        assert_eq!(ws.chunk_dir(3), Path::new("/data/request_12/chunk_3"));
        assert_eq!(
            ws.archive_path(3),
            Path::new("/data/request_12/chunk_3.tar.zst")
        );
        assert_eq!(
            partial_path(Path::new("/a/b.txt")),
            Path::new("/a/b.txt.ferry-partial")
        );
        assert!(is_partial(Path::new("/a/b.txt.ferry-partial")));
        assert!(!is_partial(Path::new("/a/b.txt")));
    }

    #[tokio::test]
    async fn cleanup_chunk_leaves_neighbours() {
        let tmp = tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());
        let ws = layout.workspace(1);

        for index in 0..2 {
            let dir = ws.prepare_chunk(index).await.unwrap();
            std::fs::write(dir.join("file.bin"), b"data").unwrap();
            std::fs::write(ws.archive_path(index), b"archive").unwrap();
        }
        let part = ws.dir().join("chunk_0.tar.zst.part000");
        std::fs::write(&part, b"p").unwrap();

        ws.cleanup_chunk(0).await.unwrap();
        assert!(!ws.chunk_dir(0).exists());
        assert!(!ws.archive_path(0).exists());
        assert!(!part.exists());
        assert!(ws.chunk_dir(1).join("file.bin").exists());
        assert!(ws.archive_path(1).exists());

        ws.cleanup_all().await.unwrap();
        assert!(!ws.dir().exists());
        // cleaning twice is fine
        ws.cleanup_all().await.unwrap();
    }
}
