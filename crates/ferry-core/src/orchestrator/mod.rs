//! Drives a request through planning, download, archive and delivery.
//!
//! The state machine:
//!
//! ```text
//! PENDING -> ANALYZING -> DOWNLOADING <-> UPLOADING -> COMPLETED
//!                              |              |
//!                              +-> PAUSED     +-> FAILED
//! ```
//!
//! Every transition is written to the [`ProgressStore`] before the next step
//! starts, so a restarted process picks up at the persisted chunk cursor.

mod manager;
mod summary;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use eyre::{Context as _, Result};
use tokio_util::sync::CancellationToken;

use crate::archive::build_archive;
use crate::chunk_plan::{plan_chunks, PlanFile};
use crate::config::PipelineConfig;
use crate::errors::{StoreError, TransferError, TransferResult};
use crate::format::chunk_caption;
use crate::layout::{RequestWorkspace, StorageLayout};
use crate::model::{
    ChunkPatch, ChunkStatus, DeliveryStatus, DestinationId, FileEntry, FilePatch, NewFile,
    NewRequest, OwnerId, RequestId, RequestPatch, RequestStatus, TransferRequest,
};
use crate::progress::{ProgressEvent, ProgressSender};
use crate::retry::RetryPolicy;
use crate::sink::{SinkDelivery, SinkTransport};
use crate::source::{ProgressFn, RemoteFile, SourceProvider, SourceRetrieval};
use crate::store::{ProgressStore, StoreOptions};
use crate::worker::WorkerPool;

pub use manager::TransferManager;
pub use summary::TransferSummary;

/// Everything a run needs, built once and shared.
pub struct Context {
    pub store: ProgressStore,
    pub source: SourceRetrieval,
    pub sink: SinkDelivery,
    pub pool: WorkerPool,
    pub progress: ProgressSender,
    pub layout: StorageLayout,
    pub config: PipelineConfig,
}

impl Context {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn SourceProvider>,
        transport: Arc<dyn SinkTransport>,
        progress: ProgressSender,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_root).with_context(|| {
            format!(
                "failed to create storage root {}",
                config.storage_root.display()
            )
        })?;
        let store = ProgressStore::open(
            &config.state_dir,
            StoreOptions {
                compact_after_bytes: config.compact_after_bytes,
                sync_writes: config.sync_writes,
            },
        )
        .with_context(|| format!("failed to open progress store in {}", config.state_dir.display()))?;

        let pool = WorkerPool::new(config.max_concurrent);
        let source = SourceRetrieval::new(
            provider,
            pool.clone(),
            RetryPolicy::quota(
                config.retry_attempts,
                config.retry_delay,
                config.retry_max_delay,
            ),
        );
        let sink = SinkDelivery::new(transport, config.sink_limit, config.part_size(), pool.clone());
        let layout = StorageLayout::new(&config.storage_root);

        Ok(Self {
            store,
            source,
            sink,
            pool,
            progress,
            layout,
            config,
        })
    }
}

/// Cancellation handles for one run.
///
/// `cancel` stops this request; `shutdown` is the process-wide token. A run
/// interrupted by shutdown keeps its persisted status so it resumes on restart.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub shutdown: CancellationToken,
}

impl RunControl {
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            cancel: shutdown.child_token(),
            shutdown: shutdown.clone(),
        }
    }
}

/// Per-chunk progress kept while a run is in flight.
struct RunState {
    request: TransferRequest,
    workspace: RequestWorkspace,
    downloaded: u64,
    summary: TransferSummary,
}

#[derive(Clone)]
pub struct TransferOrchestrator {
    ctx: Arc<Context>,
}

impl TransferOrchestrator {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Look up `link`, then persist a new PENDING request and its file list.
    ///
    /// Nothing is written when the lookup fails or the folder is empty.
    pub async fn submit(
        &self,
        owner: OwnerId,
        destination: DestinationId,
        link: &str,
    ) -> TransferResult<TransferRequest> {
        let (parsed, folder) = self.ctx.source.folder_info(link).await?;
        if folder.files.is_empty() {
            return Err(TransferError::validation(format!(
                "folder '{}' is empty",
                folder.name
            )));
        }

        let request = self
            .ctx
            .store
            .create_request(NewRequest {
                owner,
                destination,
                link: parsed.canonical(),
                name: folder.name.clone(),
                total_files: folder.files.len() as u64,
                total_size: folder.total_size,
                structure: folder.structure(),
            })
            .await?;
        let files = folder
            .files
            .into_iter()
            .map(|file| NewFile {
                path: file.path,
                name: file.name,
                size: file.size,
                source_handle: file.handle,
            })
            .collect();
        self.ctx.store.add_files(request.id, files).await?;
        log::info!(
            "request #{} created for '{}' ({} file(s), {} bytes)",
            request.id,
            request.name,
            request.total_files,
            request.total_size
        );
        Ok(request)
    }

    /// Run request `id` until it completes, pauses, fails or is interrupted.
    ///
    /// Completion and quota pauses come back as `Ok`. Failures are recorded on
    /// the request before they are returned. A run stopped by shutdown returns
    /// [`TransferError::Cancelled`] and leaves the request resumable.
    pub async fn run(&self, id: RequestId, control: &RunControl) -> TransferResult<TransferSummary> {
        let started = Instant::now();
        let request = self
            .ctx
            .store
            .request(id)
            .await?
            .ok_or_else(|| StoreError::not_found("request", id))?;
        let mut state = RunState {
            downloaded: request.downloaded_bytes,
            workspace: self.ctx.layout.workspace(id),
            summary: TransferSummary::new(id),
            request,
        };

        let result = self.drive(&mut state, &control.cancel).await;
        let destination = state.request.destination;
        state.summary.duration = started.elapsed();
        let outcome = match result {
            Ok(()) => {
                state.summary.status = RequestStatus::Completed;
                Ok(state.summary)
            }
            Err(err) if err.is_cancelled() && control.shutdown.is_cancelled() => {
                log::info!("request #{id} interrupted by shutdown; it resumes on restart");
                Err(err)
            }
            Err(err) if err.is_quota() => {
                let reason = err.to_string();
                log::warn!("request #{id} paused: {reason}");
                self.record(
                    id,
                    RequestPatch::status(RequestStatus::Paused).with_error(reason.clone()),
                )
                .await;
                self.ctx.progress.send(ProgressEvent::QuotaPaused {
                    request_id: id,
                    destination,
                    reason,
                });
                self.ctx.progress.send(ProgressEvent::Finished {
                    request_id: id,
                    destination,
                    status: RequestStatus::Paused,
                    error: None,
                });
                state.summary.status = RequestStatus::Paused;
                Ok(state.summary)
            }
            Err(err) => {
                let reason = err.to_string();
                if err.is_cancelled() {
                    log::info!("request #{id} cancelled");
                } else {
                    log::error!("request #{id} failed: {reason}");
                }
                self.record(
                    id,
                    RequestPatch::status(RequestStatus::Failed).with_error(reason.clone()),
                )
                .await;
                self.ctx.progress.send(ProgressEvent::Finished {
                    request_id: id,
                    destination,
                    status: RequestStatus::Failed,
                    error: Some(reason),
                });
                Err(err)
            }
        };
        self.ctx.layout.release(id);
        outcome
    }

    async fn record(&self, id: RequestId, patch: RequestPatch) {
        if let Err(err) = self.ctx.store.update_request(id, patch).await {
            log::error!("failed to record outcome of request #{id}: {err}");
        }
    }

    async fn drive(&self, state: &mut RunState, cancel: &CancellationToken) -> TransferResult<()> {
        check(cancel)?;
        let id = state.request.id;
        let files = self.ctx.store.files(id).await?;
        if matches!(
            state.request.status,
            RequestStatus::Pending | RequestStatus::Analyzing
        ) || state.request.total_chunks == 0
            || files.iter().any(|file| file.chunk.is_none())
        {
            state.request = self.plan(&state.request, &files).await?;
        }

        self.ctx.progress.send(ProgressEvent::Started {
            request_id: id,
            destination: state.request.destination,
            name: state.request.name.clone(),
            total_bytes: state.request.total_size,
            downloaded_bytes: state.downloaded,
            total_files: state.request.total_files,
            total_chunks: state.request.total_chunks,
        });

        let total = state.request.total_chunks;
        for index in state.request.current_chunk..total {
            check(cancel)?;
            self.process_chunk(state, index, cancel).await?;
        }

        state.request = self
            .ctx
            .store
            .update_request(
                id,
                RequestPatch::status(RequestStatus::Completed)
                    .with_downloaded_bytes(state.downloaded)
                    .clear_error(),
            )
            .await?;

        let chunks = self.ctx.store.chunks(id).await?;
        let all_delivered = chunks.len() as u32 == total
            && chunks
                .iter()
                .all(|chunk| chunk.delivery == DeliveryStatus::Delivered);
        if all_delivered {
            if let Err(err) = state.workspace.cleanup_all().await {
                log::warn!("request #{id}: failed to remove working directory: {err:#}");
            }
        } else {
            log::warn!(
                "request #{id}: not every chunk was delivered; files kept in {}",
                state.workspace.dir().display()
            );
        }

        self.ctx.progress.send(ProgressEvent::Finished {
            request_id: id,
            destination: state.request.destination,
            status: RequestStatus::Completed,
            error: None,
        });
        Ok(())
    }

    /// Assign every persisted file of the request to a chunk.
    async fn plan(
        &self,
        request: &TransferRequest,
        files: &[FileEntry],
    ) -> TransferResult<TransferRequest> {
        let id = request.id;
        self.ctx
            .store
            .update_request(id, RequestPatch::status(RequestStatus::Analyzing))
            .await?;

        let inputs: Vec<PlanFile> = files
            .iter()
            .map(|file| PlanFile {
                id: file.id,
                size: file.size,
            })
            .collect();
        let plan = plan_chunks(&inputs, self.ctx.config.chunk_budget);
        for oversized in plan.oversized() {
            log::warn!(
                "request #{id}: chunk {} holds a single file of {} bytes, over the {} byte budget",
                oversized.index,
                oversized.total_size,
                plan.budget
            );
        }
        for chunk in &plan.chunks {
            self.ctx
                .store
                .assign_chunk(id, chunk.files.clone(), chunk.index)
                .await?;
        }
        log::info!(
            "request #{id}: {} file(s) planned into {} chunk(s)",
            files.len(),
            plan.len()
        );

        let updated = self
            .ctx
            .store
            .update_request(
                id,
                RequestPatch::status(RequestStatus::Downloading)
                    .with_total_chunks(plan.len() as u32),
            )
            .await?;
        Ok(updated)
    }

    async fn process_chunk(
        &self,
        state: &mut RunState,
        index: u32,
        cancel: &CancellationToken,
    ) -> TransferResult<()> {
        let id = state.request.id;
        let total = state.request.total_chunks;
        let record = self.ctx.store.chunk(id, index).await?;
        if record
            .as_ref()
            .is_some_and(|chunk| chunk.status == ChunkStatus::Completed)
        {
            log::debug!("request #{id}: chunk {index} already delivered");
            return Ok(());
        }

        state.request = self
            .ctx
            .store
            .update_request(
                id,
                RequestPatch::status(RequestStatus::Downloading).with_current_chunk(index),
            )
            .await?;

        let archive = state.workspace.archive_path(index);
        let already_zipped = record
            .as_ref()
            .is_some_and(|chunk| chunk.status == ChunkStatus::Zipped)
            && archive.is_file();

        if !already_zipped {
            let dir = state
                .workspace
                .prepare_chunk(index)
                .await
                .map_err(TransferError::Archive)?;
            let completed = self.download_chunk(state, index, &dir, cancel).await?;
            if completed == 0 {
                let reason = "no files of this chunk could be downloaded".to_string();
                log::warn!("request #{id}: chunk {index}: {reason}");
                self.ctx
                    .store
                    .update_chunk(id, index, ChunkPatch::delivery_failed())
                    .await?;
                self.ctx.progress.send(ProgressEvent::DeliveryFailed {
                    request_id: id,
                    destination: state.request.destination,
                    chunk: index,
                    reason,
                });
                state.summary.chunks_failed += 1;
                return Ok(());
            }

            check(cancel)?;
            let level = self.ctx.config.compression_level;
            let target = archive.clone();
            let built = self
                .ctx
                .pool
                .run("archive", move || {
                    build_archive(&dir, &target, level, |done, total| {
                        log::trace!("archived {done}/{total} bytes");
                    })
                })
                .await?
                .map_err(TransferError::Archive)?;
            self.ctx
                .store
                .update_chunk(id, index, ChunkPatch::zipped(archive.clone()))
                .await?;
            log::info!(
                "request #{id}: chunk {index} archived ({} file(s), {} -> {} bytes)",
                built.files,
                built.input_bytes,
                built.archive_bytes
            );
        }

        let archive_bytes = tokio::fs::metadata(&archive).await?.len();
        self.ctx.progress.send(ProgressEvent::ChunkArchived {
            request_id: id,
            chunk: index,
            archive_bytes,
        });

        check(cancel)?;
        state.request = self
            .ctx
            .store
            .update_request(id, RequestPatch::status(RequestStatus::Uploading))
            .await?;
        let caption = chunk_caption(&state.request.name, index, total, archive_bytes);
        match self
            .ctx
            .sink
            .deliver(state.request.destination, &archive, &caption, cancel)
            .await
        {
            Ok(report) => {
                self.ctx
                    .store
                    .update_chunk(id, index, ChunkPatch::delivered())
                    .await?;
                log::info!(
                    "request #{id}: chunk {}/{total} delivered in {} part(s)",
                    index + 1,
                    report.parts
                );
                if let Err(err) = state.workspace.cleanup_chunk(index).await {
                    log::warn!("request #{id}: failed to clean chunk {index}: {err:#}");
                }
                self.ctx.progress.send(ProgressEvent::ChunkDelivered {
                    request_id: id,
                    chunk: index,
                    total_chunks: total,
                });
                state.summary.chunks_delivered += 1;
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                log::error!("request #{id}: chunk {index} delivery failed: {err}");
                self.ctx
                    .store
                    .update_chunk(id, index, ChunkPatch::delivery_failed())
                    .await?;
                self.ctx.progress.send(ProgressEvent::DeliveryFailed {
                    request_id: id,
                    destination: state.request.destination,
                    chunk: index,
                    reason: err.to_string(),
                });
                state.summary.chunks_failed += 1;
            }
        }
        Ok(())
    }

    /// Fetch the chunk's outstanding files in planned order. Returns how many of
    /// the chunk's files are on disk afterwards.
    async fn download_chunk(
        &self,
        state: &mut RunState,
        index: u32,
        dir: &std::path::Path,
        cancel: &CancellationToken,
    ) -> TransferResult<u64> {
        let id = state.request.id;
        let files = self.ctx.store.chunk_files(id, index).await?;
        let mut present = 0u64;
        for file in files {
            if file.is_completed() {
                present += 1;
                continue;
            }
            check(cancel)?;
            match self.fetch(id, index, &file, dir, cancel).await {
                Ok(path) => {
                    self.ctx
                        .store
                        .update_file(file.id, FilePatch::completed(file.size, path))
                        .await?;
                    state.downloaded = state.downloaded.saturating_add(file.size);
                    state.request = self
                        .ctx
                        .store
                        .update_request(
                            id,
                            RequestPatch::default().with_downloaded_bytes(state.downloaded),
                        )
                        .await?;
                    self.ctx.progress.send(ProgressEvent::FileCompleted {
                        request_id: id,
                        path: file.path.clone(),
                        bytes: file.size,
                    });
                    state.summary.files_completed += 1;
                    state.summary.bytes_downloaded += file.size;
                    present += 1;
                }
                Err(err) if err.is_quota() || err.is_cancelled() => return Err(err),
                Err(err @ (TransferError::Store(_) | TransferError::Worker(_))) => return Err(err),
                Err(err) => {
                    log::warn!("request #{id}: skipping {}: {err}", file.path);
                    self.ctx.progress.send(ProgressEvent::FileSkipped {
                        request_id: id,
                        path: file.path.clone(),
                        reason: err.to_string(),
                    });
                    state.summary.files_failed += 1;
                }
            }
        }
        Ok(present)
    }

    async fn fetch(
        &self,
        id: RequestId,
        index: u32,
        file: &FileEntry,
        dir: &std::path::Path,
        cancel: &CancellationToken,
    ) -> TransferResult<PathBuf> {
        let remote = RemoteFile {
            handle: file.source_handle.clone(),
            name: file.name.clone(),
            path: file.path.clone(),
            size: file.size,
        };
        let sender = self.ctx.progress.clone();
        let path = file.path.clone();
        let progress: ProgressFn = Arc::new(move |bytes, total| {
            sender.file_progress(id, index, &path, bytes, total);
        });
        self.ctx
            .source
            .download_file(&remote, dir, progress, cancel)
            .await
    }
}

fn check(cancel: &CancellationToken) -> TransferResult<()> {
    if cancel.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        Ok(())
    }
}
