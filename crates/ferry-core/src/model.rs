//! Persisted records of the progress store and the typed patches that mutate them.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RequestId = u64;
pub type FileId = u64;

/// Identity of the user that submitted a request.
pub type OwnerId = i64;
/// Endpoint on the sink that receives a request's artifacts.
pub type DestinationId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Analyzing,
    Downloading,
    Uploading,
    Completed,
    Paused,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Analyzing => "analyzing",
            RequestStatus::Downloading => "downloading",
            RequestStatus::Uploading => "uploading",
            RequestStatus::Completed => "completed",
            RequestStatus::Paused => "paused",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// States a crashed process leaves behind that should restart on boot.
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            RequestStatus::Pending
                | RequestStatus::Analyzing
                | RequestStatus::Downloading
                | RequestStatus::Uploading
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Zipped,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: RequestId,
    pub owner: OwnerId,
    pub destination: DestinationId,
    pub link: String,
    pub name: String,
    pub total_files: u64,
    pub total_size: u64,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub status: RequestStatus,
    pub downloaded_bytes: u64,
    pub error: Option<String>,
    /// Snapshot of the remote tree at submission time. Never used for planning.
    pub structure: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    pub request_id: RequestId,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub downloaded_bytes: u64,
    pub chunk: Option<u32>,
    pub status: FileStatus,
    pub source_handle: String,
    pub local_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileEntry {
    pub fn is_completed(&self) -> bool {
        self.status == FileStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u64,
    pub request_id: RequestId,
    pub index: u32,
    pub status: ChunkStatus,
    pub archive_path: Option<PathBuf>,
    pub delivery: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create a request row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub owner: OwnerId,
    pub destination: DestinationId,
    pub link: String,
    pub name: String,
    pub total_files: u64,
    pub total_size: u64,
    pub structure: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFile {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub source_handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorUpdate {
    Set(String),
    Clear,
}

/// Whole-field update of a request. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chunk: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorUpdate>,
}

impl RequestPatch {
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_current_chunk(mut self, chunk: u32) -> Self {
        self.current_chunk = Some(chunk);
        self
    }

    pub fn with_total_chunks(mut self, chunks: u32) -> Self {
        self.total_chunks = Some(chunks);
        self
    }

    pub fn with_downloaded_bytes(mut self, bytes: u64) -> Self {
        self.downloaded_bytes = Some(bytes);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(ErrorUpdate::Set(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(ErrorUpdate::Clear);
        self
    }

    pub(crate) fn apply(&self, request: &mut TransferRequest, at: DateTime<Utc>) {
        if let Some(status) = self.status {
            request.status = status;
        }
        if let Some(chunk) = self.current_chunk {
            request.current_chunk = chunk;
        }
        if let Some(chunks) = self.total_chunks {
            request.total_chunks = chunks;
        }
        if let Some(files) = self.total_files {
            request.total_files = files;
        }
        if let Some(size) = self.total_size {
            request.total_size = size;
        }
        if let Some(bytes) = self.downloaded_bytes {
            request.downloaded_bytes = bytes;
        }
        match &self.error {
            Some(ErrorUpdate::Set(message)) => request.error = Some(message.clone()),
            Some(ErrorUpdate::Clear) => request.error = None,
            None => {}
        }
        request.updated_at = at;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl FilePatch {
    /// Patch that records a finished download at `local_path`.
    pub fn completed(size: u64, local_path: PathBuf) -> Self {
        Self {
            status: Some(FileStatus::Completed),
            downloaded_bytes: Some(size),
            local_path: Some(local_path),
        }
    }

    pub(crate) fn apply(&self, file: &mut FileEntry, at: DateTime<Utc>) {
        if let Some(status) = self.status {
            file.status = status;
        }
        if let Some(bytes) = self.downloaded_bytes {
            file.downloaded_bytes = bytes.min(file.size);
        }
        if let Some(path) = &self.local_path {
            file.local_path = Some(path.clone());
        }
        file.updated_at = at;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChunkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryStatus>,
}

impl ChunkPatch {
    pub fn zipped(archive_path: PathBuf) -> Self {
        Self {
            status: Some(ChunkStatus::Zipped),
            archive_path: Some(archive_path),
            delivery: None,
        }
    }

    pub fn delivered() -> Self {
        Self {
            status: Some(ChunkStatus::Completed),
            archive_path: None,
            delivery: Some(DeliveryStatus::Delivered),
        }
    }

    pub fn delivery_failed() -> Self {
        Self {
            status: None,
            archive_path: None,
            delivery: Some(DeliveryStatus::Failed),
        }
    }

    pub(crate) fn apply(&self, chunk: &mut ChunkRecord, at: DateTime<Utc>) {
        if let Some(status) = self.status {
            chunk.status = status;
        }
        if let Some(path) = &self.archive_path {
            chunk.archive_path = Some(path.clone());
        }
        if let Some(delivery) = self.delivery {
            chunk.delivery = delivery;
        }
        chunk.updated_at = at;
    }
}

/// Live aggregation over a request's file and chunk rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub total_files: u64,
    pub completed_files: u64,
    pub total_size: u64,
    pub downloaded_bytes: u64,
    pub total_chunks: u64,
    pub completed_chunks: u64,
}

impl TransferStats {
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.downloaded_bytes as f64 / self.total_size as f64 * 100.0
    }
}
