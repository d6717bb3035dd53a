use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::model::{
    ChunkRecord, ChunkStatus, DeliveryStatus, FileEntry, FileId, FileStatus, RequestId,
    TransferRequest, TransferStats,
};

use super::journal::Mutation;

/// Full contents of the store, as written to the snapshot file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub(crate) last_seq: u64,
    pub(crate) next_request_id: u64,
    pub(crate) next_file_id: u64,
    pub(crate) next_chunk_id: u64,
    pub(crate) requests: Vec<TransferRequest>,
    pub(crate) files: Vec<FileEntry>,
    pub(crate) chunks: Vec<ChunkRecord>,
}

/// In-memory relations plus the indexes used by queries.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) next_request_id: u64,
    pub(crate) next_file_id: u64,
    pub(crate) next_chunk_id: u64,
    requests: BTreeMap<RequestId, TransferRequest>,
    files: BTreeMap<FileId, FileEntry>,
    chunks: BTreeMap<(RequestId, u32), ChunkRecord>,
    files_by_request: HashMap<RequestId, Vec<FileId>>,
}

impl Tables {
    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tables = Tables {
            next_request_id: snapshot.next_request_id.max(1),
            next_file_id: snapshot.next_file_id.max(1),
            next_chunk_id: snapshot.next_chunk_id.max(1),
            ..Tables::default()
        };
        for request in snapshot.requests {
            tables.requests.insert(request.id, request);
        }
        for file in snapshot.files {
            tables.insert_file(file);
        }
        for chunk in snapshot.chunks {
            tables.chunks.insert((chunk.request_id, chunk.index), chunk);
        }
        tables
    }

    pub(crate) fn to_snapshot(&self, last_seq: u64) -> Snapshot {
        Snapshot {
            last_seq,
            next_request_id: self.next_request_id,
            next_file_id: self.next_file_id,
            next_chunk_id: self.next_chunk_id,
            requests: self.requests.values().cloned().collect(),
            files: self.files.values().cloned().collect(),
            chunks: self.chunks.values().cloned().collect(),
        }
    }

    fn insert_file(&mut self, file: FileEntry) {
        let (id, request_id) = (file.id, file.request_id);
        if self.files.insert(id, file).is_none() {
            self.files_by_request.entry(request_id).or_default().push(id);
        }
    }

    /// Reject a mutation before it reaches the journal.
    pub(crate) fn check(&self, mutation: &Mutation) -> Result<(), StoreError> {
        match mutation {
            Mutation::CreateRequest(_) => Ok(()),
            Mutation::PatchRequest { id, .. } => self.require_request(*id),
            Mutation::AddFiles { request_id, .. } | Mutation::PurgeDetails { request_id } => {
                self.require_request(*request_id)
            }
            Mutation::PatchFile { id, .. } => {
                if self.files.contains_key(id) {
                    Ok(())
                } else {
                    Err(StoreError::not_found("file", id))
                }
            }
            Mutation::AssignChunk {
                request_id,
                file_ids,
                ..
            } => {
                self.require_request(*request_id)?;
                for id in file_ids {
                    match self.files.get(id) {
                        Some(file) if file.request_id == *request_id => {}
                        _ => return Err(StoreError::not_found("file", id)),
                    }
                }
                Ok(())
            }
            Mutation::PatchChunk {
                request_id, index, ..
            } => {
                if self.chunks.contains_key(&(*request_id, *index)) {
                    Ok(())
                } else {
                    Err(StoreError::not_found(
                        "chunk",
                        format!("{request_id}/{index}"),
                    ))
                }
            }
        }
    }

    fn require_request(&self, id: RequestId) -> Result<(), StoreError> {
        if self.requests.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::not_found("request", id))
        }
    }

    /// Apply a mutation. Rows that no longer exist are ignored so replay never fails.
    pub(crate) fn apply(&mut self, mutation: &Mutation, at: DateTime<Utc>) {
        match mutation {
            Mutation::CreateRequest(request) => {
                self.next_request_id = self.next_request_id.max(request.id + 1);
                self.requests.insert(request.id, request.clone());
            }
            Mutation::PatchRequest { id, patch } => {
                if let Some(request) = self.requests.get_mut(id) {
                    patch.apply(request, at);
                }
            }
            Mutation::AddFiles { files, .. } => {
                for file in files {
                    self.next_file_id = self.next_file_id.max(file.id + 1);
                    self.insert_file(file.clone());
                }
            }
            Mutation::PatchFile { id, patch } => {
                if let Some(file) = self.files.get_mut(id) {
                    patch.apply(file, at);
                }
            }
            Mutation::AssignChunk {
                request_id,
                index,
                chunk_id,
                file_ids,
            } => {
                for id in file_ids {
                    if let Some(file) = self.files.get_mut(id) {
                        file.chunk = Some(*index);
                        file.updated_at = at;
                    }
                }
                self.next_chunk_id = self.next_chunk_id.max(chunk_id + 1);
                self.chunks
                    .entry((*request_id, *index))
                    .or_insert_with(|| ChunkRecord {
                        id: *chunk_id,
                        request_id: *request_id,
                        index: *index,
                        status: ChunkStatus::Pending,
                        archive_path: None,
                        delivery: DeliveryStatus::Pending,
                        created_at: at,
                        updated_at: at,
                    });
            }
            Mutation::PatchChunk {
                request_id,
                index,
                patch,
            } => {
                if let Some(chunk) = self.chunks.get_mut(&(*request_id, *index)) {
                    patch.apply(chunk, at);
                }
            }
            Mutation::PurgeDetails { request_id } => {
                if let Some(ids) = self.files_by_request.remove(request_id) {
                    for id in ids {
                        self.files.remove(&id);
                    }
                }
                self.chunks.retain(|(owner, _), _| owner != request_id);
            }
        }
    }

    /// True when every file already sits in `index` and the chunk row exists.
    pub(crate) fn assignment_is_current(
        &self,
        request_id: RequestId,
        index: u32,
        file_ids: &[FileId],
    ) -> bool {
        self.chunks.contains_key(&(request_id, index))
            && file_ids.iter().all(|id| {
                self.files
                    .get(id)
                    .map(|file| file.chunk == Some(index))
                    .unwrap_or(false)
            })
    }

    pub(crate) fn chunk_id_for(&self, request_id: RequestId, index: u32) -> u64 {
        self.chunks
            .get(&(request_id, index))
            .map(|chunk| chunk.id)
            .unwrap_or(self.next_chunk_id)
    }

    pub(crate) fn request(&self, id: RequestId) -> Option<&TransferRequest> {
        self.requests.get(&id)
    }

    pub(crate) fn requests(&self) -> impl Iterator<Item = &TransferRequest> {
        self.requests.values()
    }

    pub(crate) fn file(&self, id: FileId) -> Option<&FileEntry> {
        self.files.get(&id)
    }

    pub(crate) fn chunk(&self, request_id: RequestId, index: u32) -> Option<&ChunkRecord> {
        self.chunks.get(&(request_id, index))
    }

    pub(crate) fn chunks(&self, request_id: RequestId) -> Vec<ChunkRecord> {
        self.chunks
            .range((request_id, 0)..=(request_id, u32::MAX))
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }

    pub(crate) fn files_of(&self, request_id: RequestId) -> Vec<FileEntry> {
        let mut files: Vec<FileEntry> = self
            .files_by_request
            .get(&request_id)
            .map(|ids| ids.iter().filter_map(|id| self.files.get(id)).cloned().collect())
            .unwrap_or_default();
        files.sort_by_key(|file| file.id);
        files
    }

    pub(crate) fn stats(&self, request_id: RequestId) -> TransferStats {
        let mut stats = TransferStats::default();
        if let Some(ids) = self.files_by_request.get(&request_id) {
            for file in ids.iter().filter_map(|id| self.files.get(id)) {
                stats.total_files += 1;
                stats.total_size += file.size;
                stats.downloaded_bytes += file.downloaded_bytes.min(file.size);
                if file.status == FileStatus::Completed {
                    stats.completed_files += 1;
                }
            }
        }
        for (_, chunk) in self
            .chunks
            .range((request_id, 0)..=(request_id, u32::MAX))
        {
            stats.total_chunks += 1;
            if chunk.status == ChunkStatus::Completed {
                stats.completed_chunks += 1;
            }
        }
        stats
    }
}
