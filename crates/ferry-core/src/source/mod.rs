//! Source side of the pipeline: folder lookup and per-file download.
//!
//! [`SourceProvider`] is the blocking seam to the remote storage service.
//! [`SourceRetrieval`] wraps a provider with error classification, quota backoff,
//! path sanitizing and progress reporting, and runs provider calls on the worker pool.

mod link;
mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::archive::sanitize_rel_path;
use crate::errors::{TransferError, TransferResult};
use crate::layout::partial_path;
use crate::retry::RetryPolicy;
use crate::worker::WorkerPool;

pub use link::{FolderLink, LinkShape};
pub use local::LocalSourceProvider;

/// One file of a remote folder. `path` is relative to the folder root, `/` separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub handle: String,
    pub name: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub name: String,
    pub handle: String,
    pub files: Vec<RemoteFile>,
    pub total_size: u64,
}

impl RemoteFolder {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// JSON description of the tree kept on the request for reference.
    pub fn structure(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "handle": self.handle,
            "total_size": self.total_size,
            "files": self.files,
        })
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

/// Blocking access to the remote storage service.
pub trait SourceProvider: Send + Sync {
    fn login(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn logout(&self) {}

    fn folder_listing(&self, link: &FolderLink) -> Result<RemoteFolder, ProviderError>;

    /// Write `file` to `target`, calling `progress(bytes_so_far, total)` as data arrives.
    /// Implementations poll `cancel` between blocks.
    fn fetch_file(
        &self,
        file: &RemoteFile,
        target: &Path,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &CancellationToken,
    ) -> Result<u64, ProviderError>;
}

/// Map provider failures onto the pipeline's error set.
///
/// Any message mentioning a quota, bandwidth or limit is treated as quota exhaustion.
pub fn classify_provider_error(err: ProviderError, path: Option<&str>) -> TransferError {
    match err {
        ProviderError::Cancelled => TransferError::Cancelled,
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if ["quota", "bandwidth", "limit"]
                .iter()
                .any(|needle| lower.contains(needle))
            {
                TransferError::QuotaExceeded(message)
            } else {
                TransferError::retrieval(message, path.map(str::to_string))
            }
        }
    }
}

/// Byte progress of one in-flight download.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Clone)]
pub struct SourceRetrieval {
    provider: Arc<dyn SourceProvider>,
    pool: WorkerPool,
    policy: RetryPolicy,
}

impl SourceRetrieval {
    pub fn new(provider: Arc<dyn SourceProvider>, pool: WorkerPool, policy: RetryPolicy) -> Self {
        Self {
            provider,
            pool,
            policy,
        }
    }

    pub async fn login(&self) -> TransferResult<()> {
        let provider = Arc::clone(&self.provider);
        self.pool
            .run("source login", move || provider.login())
            .await?
            .map_err(|err| classify_provider_error(err, None))
    }

    pub async fn logout(&self) {
        let provider = Arc::clone(&self.provider);
        if let Err(err) = self.pool.run("source logout", move || provider.logout()).await {
            log::warn!("source logout failed: {err}");
        }
    }

    /// Resolve a link to its folder name and recursive file list.
    pub async fn folder_info(&self, link: &str) -> TransferResult<(FolderLink, RemoteFolder)> {
        let parsed = FolderLink::parse(link)?;
        let provider = Arc::clone(&self.provider);
        let lookup = parsed.clone();
        let folder = self
            .pool
            .run("folder lookup", move || provider.folder_listing(&lookup))
            .await?
            .map_err(|err| classify_provider_error(err, None))?;
        log::info!(
            "folder '{}' ({}): {} file(s), {} bytes",
            folder.name,
            parsed.folder_id,
            folder.file_count(),
            folder.total_size
        );
        Ok((parsed, folder))
    }

    /// Download `file` into `dest_dir/<file.path>`, retrying quota failures with backoff.
    pub async fn download_file(
        &self,
        file: &RemoteFile,
        dest_dir: &Path,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> TransferResult<PathBuf> {
        let rel = sanitize_rel_path(Path::new(&file.path)).map_err(|err| {
            TransferError::retrieval(format!("{err}"), Some(file.path.clone()))
        })?;
        let target = dest_dir.join(rel);

        self.policy
            .run(&format!("download {}", file.path), cancel, |_| {
                self.fetch_once(file.clone(), target.clone(), Arc::clone(&progress), cancel.clone())
            })
            .await?;
        Ok(target)
    }

    async fn fetch_once(
        &self,
        file: RemoteFile,
        target: PathBuf,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> TransferResult<()> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let provider = Arc::clone(&self.provider);
        let path = file.path.clone();
        let result = self
            .pool
            .run("download", move || -> Result<(), ProviderError> {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let partial = partial_path(&target);
                let mut report = |done: u64, total: u64| progress(done, total);
                match provider.fetch_file(&file, &partial, &mut report, &cancel) {
                    Ok(_) => {
                        std::fs::rename(&partial, &target)?;
                        Ok(())
                    }
                    Err(err) => {
                        let _ = std::fs::remove_file(&partial);
                        Err(err)
                    }
                }
            })
            .await?;
        result.map_err(|err| classify_provider_error(err, Some(&path)))
    }
}
