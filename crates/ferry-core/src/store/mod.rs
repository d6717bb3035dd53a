//! Durable progress store: requests, per-file status and per-chunk status.
//!
//! All reads and writes go through one lock. Each write is validated, appended to the
//! journal and only then applied in memory, so a failed write leaves no trace. The
//! blocking file work runs on tokio's blocking pool.

mod journal;
mod tables;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::errors::StoreError;
use crate::model::{
    ChunkPatch, ChunkRecord, FileEntry, FileId, FilePatch, FileStatus, NewFile, NewRequest,
    OwnerId, RequestId, RequestPatch, RequestStatus, TransferRequest, TransferStats,
};

use journal::{Journal, JournalEntry, Mutation};
use tables::Tables;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Journal size that triggers a snapshot rewrite.
    pub compact_after_bytes: u64,
    /// fsync every journal append.
    pub sync_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compact_after_bytes: 4 * 1024 * 1024,
            sync_writes: true,
        }
    }
}

struct StoreInner {
    tables: Tables,
    journal: Journal,
    seq: u64,
    options: StoreOptions,
}

impl StoreInner {
    fn commit(&mut self, mutation: Mutation, at: chrono::DateTime<Utc>) -> Result<(), StoreError> {
        self.tables.check(&mutation)?;
        let entry = JournalEntry {
            seq: self.seq + 1,
            at,
            mutation,
        };
        self.journal.append(&entry)?;
        self.seq = entry.seq;
        self.tables.apply(&entry.mutation, entry.at);

        if self.journal.len() >= self.options.compact_after_bytes {
            // the write above is already durable; a failed compaction only delays the rewrite
            if let Err(err) = self.journal.compact(&self.tables, self.seq) {
                log::warn!("progress journal compaction failed: {err}");
            }
        }
        Ok(())
    }

    fn request(&self, id: RequestId) -> Result<TransferRequest, StoreError> {
        self.tables
            .request(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("request", id))
    }

    fn chunk(&self, request_id: RequestId, index: u32) -> Result<ChunkRecord, StoreError> {
        self.tables
            .chunk(request_id, index)
            .cloned()
            .ok_or_else(|| StoreError::not_found("chunk", format!("{request_id}/{index}")))
    }
}

/// Cloneable handle to the progress store.
#[derive(Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    inner: Arc<Mutex<StoreInner>>,
}

impl ProgressStore {
    /// Open (or create) the store in `dir`, replaying any journal left by a previous run.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let recovered = Journal::open(&dir, options.sync_writes)?;
        if recovered.replayed > 0 {
            log::info!(
                "progress store {}: replayed {} journal record(s)",
                dir.display(),
                recovered.replayed
            );
        }
        Ok(Self {
            dir,
            inner: Arc::new(Mutex::new(StoreInner {
                tables: recovered.tables,
                journal: recovered.journal,
                seq: recovered.last_seq,
                options,
            })),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn with_inner<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock();
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Worker(err.to_string()))?
    }

    pub async fn create_request(&self, new: NewRequest) -> Result<TransferRequest, StoreError> {
        self.with_inner(move |inner| {
            let now = Utc::now();
            let request = TransferRequest {
                id: inner.tables.next_request_id,
                owner: new.owner,
                destination: new.destination,
                link: new.link,
                name: new.name,
                total_files: new.total_files,
                total_size: new.total_size,
                current_chunk: 0,
                total_chunks: 0,
                status: RequestStatus::Pending,
                downloaded_bytes: 0,
                error: None,
                structure: new.structure,
                created_at: now,
                updated_at: now,
            };
            inner.commit(Mutation::CreateRequest(request.clone()), now)?;
            Ok(request)
        })
        .await
    }

    pub async fn request(&self, id: RequestId) -> Result<Option<TransferRequest>, StoreError> {
        self.with_inner(move |inner| Ok(inner.tables.request(id).cloned()))
            .await
    }

    /// Requests that are neither completed nor failed, oldest first.
    pub async fn active_requests(
        &self,
        owner: Option<OwnerId>,
    ) -> Result<Vec<TransferRequest>, StoreError> {
        self.with_inner(move |inner| {
            Ok(inner
                .tables
                .requests()
                .filter(|req| !req.status.is_terminal())
                .filter(|req| owner.map(|o| req.owner == o).unwrap_or(true))
                .cloned()
                .collect())
        })
        .await
    }

    pub async fn requests_for_owner(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<TransferRequest>, StoreError> {
        self.with_inner(move |inner| {
            Ok(inner
                .tables
                .requests()
                .filter(|req| req.owner == owner)
                .cloned()
                .collect())
        })
        .await
    }

    pub async fn update_request(
        &self,
        id: RequestId,
        patch: RequestPatch,
    ) -> Result<TransferRequest, StoreError> {
        self.with_inner(move |inner| {
            inner.commit(Mutation::PatchRequest { id, patch }, Utc::now())?;
            inner.request(id)
        })
        .await
    }

    /// Bulk insert of a request's files in enumeration order.
    pub async fn add_files(
        &self,
        request_id: RequestId,
        files: Vec<NewFile>,
    ) -> Result<Vec<FileEntry>, StoreError> {
        self.with_inner(move |inner| {
            let now = Utc::now();
            let first = inner.tables.next_file_id;
            let entries: Vec<FileEntry> = files
                .into_iter()
                .enumerate()
                .map(|(offset, file)| FileEntry {
                    id: first + offset as u64,
                    request_id,
                    path: file.path,
                    name: file.name,
                    size: file.size,
                    downloaded_bytes: 0,
                    chunk: None,
                    status: FileStatus::Pending,
                    source_handle: file.source_handle,
                    local_path: None,
                    created_at: now,
                    updated_at: now,
                })
                .collect();
            inner.commit(
                Mutation::AddFiles {
                    request_id,
                    files: entries.clone(),
                },
                now,
            )?;
            Ok(entries)
        })
        .await
    }

    pub async fn update_file(&self, id: FileId, patch: FilePatch) -> Result<FileEntry, StoreError> {
        self.with_inner(move |inner| {
            inner.commit(Mutation::PatchFile { id, patch }, Utc::now())?;
            inner
                .tables
                .file(id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("file", id))
        })
        .await
    }

    /// All files of a request in insertion order.
    pub async fn files(&self, request_id: RequestId) -> Result<Vec<FileEntry>, StoreError> {
        self.with_inner(move |inner| Ok(inner.tables.files_of(request_id)))
            .await
    }

    pub async fn pending_files(
        &self,
        request_id: RequestId,
        chunk: Option<u32>,
    ) -> Result<Vec<FileEntry>, StoreError> {
        self.with_inner(move |inner| {
            Ok(inner
                .tables
                .files_of(request_id)
                .into_iter()
                .filter(|file| !file.is_completed())
                .filter(|file| chunk.is_none() || file.chunk == chunk)
                .collect())
        })
        .await
    }

    /// Files of one chunk in planned order: largest first, ties by id.
    pub async fn chunk_files(
        &self,
        request_id: RequestId,
        index: u32,
    ) -> Result<Vec<FileEntry>, StoreError> {
        self.with_inner(move |inner| {
            let mut files: Vec<FileEntry> = inner
                .tables
                .files_of(request_id)
                .into_iter()
                .filter(|file| file.chunk == Some(index))
                .collect();
            files.sort_by(|a, b| b.size.cmp(&a.size).then(a.id.cmp(&b.id)));
            Ok(files)
        })
        .await
    }

    /// Put `file_ids` into chunk `index`, creating the chunk row on first use.
    ///
    /// Re-assigning the same files to the same chunk writes nothing.
    pub async fn assign_chunk(
        &self,
        request_id: RequestId,
        file_ids: Vec<FileId>,
        index: u32,
    ) -> Result<ChunkRecord, StoreError> {
        self.with_inner(move |inner| {
            if !inner
                .tables
                .assignment_is_current(request_id, index, &file_ids)
            {
                let chunk_id = inner.tables.chunk_id_for(request_id, index);
                inner.commit(
                    Mutation::AssignChunk {
                        request_id,
                        index,
                        chunk_id,
                        file_ids,
                    },
                    Utc::now(),
                )?;
            }
            inner.chunk(request_id, index)
        })
        .await
    }

    pub async fn update_chunk(
        &self,
        request_id: RequestId,
        index: u32,
        patch: ChunkPatch,
    ) -> Result<ChunkRecord, StoreError> {
        self.with_inner(move |inner| {
            inner.commit(
                Mutation::PatchChunk {
                    request_id,
                    index,
                    patch,
                },
                Utc::now(),
            )?;
            inner.chunk(request_id, index)
        })
        .await
    }

    pub async fn chunk(
        &self,
        request_id: RequestId,
        index: u32,
    ) -> Result<Option<ChunkRecord>, StoreError> {
        self.with_inner(move |inner| Ok(inner.tables.chunk(request_id, index).cloned()))
            .await
    }

    pub async fn chunks(&self, request_id: RequestId) -> Result<Vec<ChunkRecord>, StoreError> {
        self.with_inner(move |inner| Ok(inner.tables.chunks(request_id)))
            .await
    }

    /// Aggregate counters computed from the rows on every call.
    pub async fn stats(&self, request_id: RequestId) -> Result<TransferStats, StoreError> {
        self.with_inner(move |inner| {
            if inner.tables.request(request_id).is_none() {
                return Err(StoreError::not_found("request", request_id));
            }
            Ok(inner.tables.stats(request_id))
        })
        .await
    }

    /// Drop the file and chunk rows of a finished request. The request row stays.
    pub async fn purge_details(&self, request_id: RequestId) -> Result<(), StoreError> {
        self.with_inner(move |inner| {
            inner.commit(Mutation::PurgeDetails { request_id }, Utc::now())
        })
        .await
    }

    pub async fn compact(&self) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            let seq = inner.seq;
            inner.journal.compact(&inner.tables, seq)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkStatus, DeliveryStatus};
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn new_request(owner: OwnerId) -> NewRequest {
        NewRequest {
            owner,
            destination: owner * 10,
            link: "https://mega.nz/folder/abc#key".into(),
            name: "Holiday".into(),
            total_files: 3,
            total_size: 600,
            structure: serde_json::json!({"name": "Holiday"}),
        }
    }

    fn new_files() -> Vec<NewFile> {
        [("a.jpg", 100), ("b/c.jpg", 200), ("b/d.mov", 300)]
            .iter()
            .map(|(path, size)| NewFile {
                path: path.to_string(),
                name: path.rsplit('/').next().unwrap().to_string(),
                size: *size,
                source_handle: format!("h-{path}"),
            })
            .collect()
    }

    fn options() -> StoreOptions {
        StoreOptions {
            compact_after_bytes: u64::MAX,
            sync_writes: false,
        }
    }

    #[tokio::test]
    async fn create_update_and_stats() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::open(dir.path(), options()).unwrap();

        let request = store.create_request(new_request(7)).await.unwrap();
        assert_eq!(request.id, 1);
        assert_eq!(request.status, RequestStatus::Pending);

        let files = store.add_files(request.id, new_files()).await.unwrap();
        assert_eq!(files.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        store
            .update_file(files[1].id, FilePatch::completed(200, "/tmp/c.jpg".into()))
            .await
            .unwrap();
        let stats = store.stats(request.id).await.unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.completed_files, 1);
        assert_eq!(stats.total_size, 600);
        assert_eq!(stats.downloaded_bytes, 200);

        let updated = store
            .update_request(
                request.id,
                RequestPatch::status(RequestStatus::Paused).with_error("quota"),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RequestStatus::Paused);
        assert_eq!(updated.error.as_deref(), Some("quota"));
        assert!(updated.updated_at >= request.updated_at);
        assert_eq!(updated.current_chunk, 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::open(dir.path(), options()).unwrap();
        let err = store
            .update_request(42, RequestPatch::status(RequestStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "request", .. }));
        assert!(store.stats(42).await.is_err());
        assert!(store.update_file(9, FilePatch::default()).await.is_err());
        assert!(store
            .update_chunk(1, 0, ChunkPatch::delivered())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn assign_chunk_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::open(dir.path(), options()).unwrap();
        let request = store.create_request(new_request(1)).await.unwrap();
        let files = store.add_files(request.id, new_files()).await.unwrap();
        let ids: Vec<FileId> = files.iter().map(|f| f.id).collect();

        let first = store.assign_chunk(request.id, ids.clone(), 0).await.unwrap();
        let journal = dir.path().join(journal::JOURNAL_FILE);
        let len_after_first = fs::metadata(&journal).unwrap().len();

        let second = store.assign_chunk(request.id, ids, 0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::metadata(&journal).unwrap().len(), len_after_first);
        assert_eq!(store.chunks(request.id).await.unwrap().len(), 1);
        assert_eq!(first.status, ChunkStatus::Pending);
        assert_eq!(first.delivery, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn chunk_files_follow_planned_order() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::open(dir.path(), options()).unwrap();
        let request = store.create_request(new_request(1)).await.unwrap();
        let files = store.add_files(request.id, new_files()).await.unwrap();
        store
            .assign_chunk(request.id, vec![files[0].id, files[2].id], 0)
            .await
            .unwrap();
        store
            .assign_chunk(request.id, vec![files[1].id], 1)
            .await
            .unwrap();

        let chunk0 = store.chunk_files(request.id, 0).await.unwrap();
        assert_eq!(
            chunk0.iter().map(|f| f.size).collect::<Vec<_>>(),
            vec![300, 100]
        );
        let pending = store.pending_files(request.id, Some(1)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "b/c.jpg");
    }

    #[tokio::test]
    async fn reopen_replays_journal() {
        let dir = tempdir().unwrap();
        let request_id;
        {
            let store = ProgressStore::open(dir.path(), options()).unwrap();
            let request = store.create_request(new_request(3)).await.unwrap();
            request_id = request.id;
            let files = store.add_files(request.id, new_files()).await.unwrap();
            store
                .assign_chunk(request.id, files.iter().map(|f| f.id).collect(), 0)
                .await
                .unwrap();
            store
                .update_file(files[0].id, FilePatch::completed(100, "/x/a.jpg".into()))
                .await
                .unwrap();
            store
                .update_chunk(request.id, 0, ChunkPatch::zipped("/x/chunk_0.tar.zst".into()))
                .await
                .unwrap();
            store
                .update_request(
                    request.id,
                    RequestPatch::status(RequestStatus::Downloading)
                        .with_total_chunks(1)
                        .with_downloaded_bytes(100),
                )
                .await
                .unwrap();
        }

        let store = ProgressStore::open(dir.path(), options()).unwrap();
        let request = store.request(request_id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Downloading);
        assert_eq!(request.total_chunks, 1);
        assert_eq!(request.downloaded_bytes, 100);
        let chunk = store.chunk(request_id, 0).await.unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Zipped);
        assert_eq!(store.stats(request_id).await.unwrap().completed_files, 1);

        // new ids continue after the replayed ones
        let next = store.create_request(new_request(3)).await.unwrap();
        assert_eq!(next.id, request_id + 1);
    }

    #[tokio::test]
    async fn torn_trailing_record_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let store = ProgressStore::open(dir.path(), options()).unwrap();
            store.create_request(new_request(5)).await.unwrap();
        }
        let journal = dir.path().join(journal::JOURNAL_FILE);
        let mut file = fs::OpenOptions::new().append(true).open(&journal).unwrap();
        file.write_all(br#"{"seq":2,"at":"2024-01-01T00:00:00Z","mutation":{"op":"patch_"#)
            .unwrap();
        drop(file);

        let store = ProgressStore::open(dir.path(), options()).unwrap();
        let request = store.request(1).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);

        // appends after recovery land on a clean line
        store
            .update_request(1, RequestPatch::status(RequestStatus::Analyzing))
            .await
            .unwrap();
        drop(store);
        let store = ProgressStore::open(dir.path(), options()).unwrap();
        assert_eq!(
            store.request(1).await.unwrap().unwrap().status,
            RequestStatus::Analyzing
        );
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let dir = tempdir().unwrap();
        let tight = StoreOptions {
            compact_after_bytes: 256,
            sync_writes: false,
        };
        {
            let store = ProgressStore::open(dir.path(), tight).unwrap();
            let request = store.create_request(new_request(2)).await.unwrap();
            let files = store.add_files(request.id, new_files()).await.unwrap();
            for file in &files {
                store
                    .update_file(file.id, FilePatch::completed(file.size, "/done".into()))
                    .await
                    .unwrap();
            }
        }
        assert!(dir.path().join(journal::SNAPSHOT_FILE).exists());

        let store = ProgressStore::open(dir.path(), tight).unwrap();
        let stats = store.stats(1).await.unwrap();
        assert_eq!(stats.completed_files, 3);
        assert_eq!(stats.downloaded_bytes, 600);
        store.compact().await.unwrap();
        let journal = dir.path().join(journal::JOURNAL_FILE);
        assert_eq!(fs::metadata(journal).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn active_requests_filter_by_owner_and_state() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::open(dir.path(), options()).unwrap();
        let a = store.create_request(new_request(1)).await.unwrap();
        let b = store.create_request(new_request(2)).await.unwrap();
        let c = store.create_request(new_request(1)).await.unwrap();
        store
            .update_request(c.id, RequestPatch::status(RequestStatus::Completed))
            .await
            .unwrap();

        let all: Vec<RequestId> = store
            .active_requests(None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(all, vec![a.id, b.id]);
        let mine = store.active_requests(Some(1)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, a.id);
        assert_eq!(store.requests_for_owner(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_keeps_request_row() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::open(dir.path(), options()).unwrap();
        let request = store.create_request(new_request(1)).await.unwrap();
        let files = store.add_files(request.id, new_files()).await.unwrap();
        store
            .assign_chunk(request.id, files.iter().map(|f| f.id).collect(), 0)
            .await
            .unwrap();
        store.purge_details(request.id).await.unwrap();

        assert!(store.request(request.id).await.unwrap().is_some());
        assert!(store.files(request.id).await.unwrap().is_empty());
        assert!(store.chunks(request.id).await.unwrap().is_empty());
        assert_eq!(store.stats(request.id).await.unwrap().total_files, 0);
    }
}
