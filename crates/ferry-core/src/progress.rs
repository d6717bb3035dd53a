//! Progress events flow from the pipeline into one reporter task, which turns them
//! into user-facing notifications.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::format::{self, ProgressView};
use crate::model::{DestinationId, RequestId, RequestStatus};

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started {
        request_id: RequestId,
        destination: DestinationId,
        name: String,
        total_bytes: u64,
        downloaded_bytes: u64,
        total_files: u64,
        total_chunks: u32,
    },
    FileProgress {
        request_id: RequestId,
        chunk: u32,
        path: String,
        bytes: u64,
        total: u64,
    },
    FileCompleted {
        request_id: RequestId,
        path: String,
        bytes: u64,
    },
    FileSkipped {
        request_id: RequestId,
        path: String,
        reason: String,
    },
    ChunkArchived {
        request_id: RequestId,
        chunk: u32,
        archive_bytes: u64,
    },
    ChunkDelivered {
        request_id: RequestId,
        chunk: u32,
        total_chunks: u32,
    },
    DeliveryFailed {
        request_id: RequestId,
        destination: DestinationId,
        chunk: u32,
        reason: String,
    },
    QuotaPaused {
        request_id: RequestId,
        destination: DestinationId,
        reason: String,
    },
    Finished {
        request_id: RequestId,
        destination: DestinationId,
        status: RequestStatus,
        error: Option<String>,
    },
}

/// Sending half handed to pipeline components. Sends never block and are
/// dropped silently once the reporter is gone.
#[derive(Clone, Debug)]
pub struct ProgressSender {
    sender: UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A sender whose events go nowhere.
    pub fn disconnected() -> Self {
        let (tx, _) = unbounded_channel();
        Self::new(tx)
    }

    pub fn send(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn file_progress(&self, request_id: RequestId, chunk: u32, path: &str, bytes: u64, total: u64) {
        self.send(ProgressEvent::FileProgress {
            request_id,
            chunk,
            path: path.to_string(),
            bytes,
            total,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Progress,
    Info,
    Warning,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub request_id: RequestId,
    pub destination: DestinationId,
    pub kind: NoticeKind,
    pub text: String,
}

/// Where rendered notices end up (chat messages, console, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: Notice);
}

/// Moving average of download speed over the last `window` samples.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    window: usize,
    samples: VecDeque<f64>,
    last: Option<(u64, Instant)>,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

impl SpeedTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
            last: None,
        }
    }

    /// Record the running byte total and return the current average in bytes/second.
    pub fn update(&mut self, total_bytes: u64) -> f64 {
        self.update_at(total_bytes, Instant::now())
    }

    pub fn update_at(&mut self, total_bytes: u64, now: Instant) -> f64 {
        if let Some((last_bytes, last_time)) = self.last {
            let elapsed = now.saturating_duration_since(last_time).as_secs_f64();
            if elapsed > 0.0 {
                let delta = total_bytes.saturating_sub(last_bytes) as f64;
                self.samples.push_back(delta / elapsed);
                while self.samples.len() > self.window {
                    self.samples.pop_front();
                }
            }
        }
        self.last = Some((total_bytes, now));
        self.speed()
    }

    pub fn speed(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.last = None;
    }
}

struct RequestView {
    destination: DestinationId,
    name: String,
    total_bytes: u64,
    completed_bytes: u64,
    total_chunks: u32,
    chunk: u32,
    file: String,
    file_bytes: u64,
    file_total: u64,
    tracker: SpeedTracker,
    last_emit: Option<Instant>,
}

/// Consumes [`ProgressEvent`]s and forwards rendered [`Notice`]s.
pub struct ProgressReporter {
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    requests: HashMap<RequestId, RequestView>,
}

impl ProgressReporter {
    pub fn new(notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            notifier,
            interval,
            requests: HashMap::new(),
        }
    }

    /// Run until every sender is dropped.
    pub fn spawn(self, mut events: UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
        let mut reporter = self;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                reporter.handle(event).await;
            }
            log::debug!("progress reporter stopped");
        })
    }

    async fn emit(&self, request_id: RequestId, kind: NoticeKind, text: String) {
        let Some(view) = self.requests.get(&request_id) else {
            log::debug!("dropping notice for unknown request {request_id}: {text}");
            return;
        };
        self.emit_to(request_id, view.destination, kind, text).await;
    }

    /// Notices that must reach the user even when the run never got as far as `Started`.
    async fn emit_to(
        &self,
        request_id: RequestId,
        destination: DestinationId,
        kind: NoticeKind,
        text: String,
    ) {
        self.notifier
            .notify(Notice {
                request_id,
                destination,
                kind,
                text,
            })
            .await;
    }

    pub async fn handle(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started {
                request_id,
                destination,
                name,
                total_bytes,
                downloaded_bytes,
                total_files,
                total_chunks,
            } => {
                let text = format!(
                    "📁 {name}\nFiles: {total_files}\nSize: {}\nChunks: {total_chunks}",
                    format::format_bytes(total_bytes)
                );
                self.requests.insert(
                    request_id,
                    RequestView {
                        destination,
                        name,
                        total_bytes,
                        completed_bytes: downloaded_bytes,
                        total_chunks,
                        chunk: 0,
                        file: String::new(),
                        file_bytes: 0,
                        file_total: 0,
                        tracker: SpeedTracker::default(),
                        last_emit: None,
                    },
                );
                self.emit(request_id, NoticeKind::Info, text).await;
            }
            ProgressEvent::FileProgress {
                request_id,
                chunk,
                path,
                bytes,
                total,
            } => {
                let interval = self.interval;
                let Some(view) = self.requests.get_mut(&request_id) else {
                    return;
                };
                view.chunk = chunk;
                view.file = path;
                view.file_bytes = bytes;
                view.file_total = total;
                let overall = view.completed_bytes + bytes;
                let speed = view.tracker.update(overall);

                let now = Instant::now();
                let due = view
                    .last_emit
                    .map(|last| now.duration_since(last) >= interval)
                    .unwrap_or(true);
                if !due {
                    return;
                }
                view.last_emit = Some(now);
                let text = format::progress_message(&ProgressView {
                    name: &view.name,
                    current_file: &view.file,
                    file_bytes: view.file_bytes,
                    file_total: view.file_total,
                    chunk: view.chunk,
                    total_chunks: view.total_chunks,
                    overall_bytes: overall,
                    overall_total: view.total_bytes,
                    speed,
                });
                self.emit(request_id, NoticeKind::Progress, text).await;
            }
            ProgressEvent::FileCompleted {
                request_id, bytes, ..
            } => {
                if let Some(view) = self.requests.get_mut(&request_id) {
                    view.completed_bytes += bytes;
                    view.file_bytes = 0;
                    view.file_total = 0;
                }
            }
            ProgressEvent::FileSkipped {
                request_id,
                path,
                reason,
            } => {
                self.emit(
                    request_id,
                    NoticeKind::Warning,
                    format!("⚠️ Skipped {path}: {reason}"),
                )
                .await;
            }
            ProgressEvent::ChunkArchived {
                request_id,
                chunk,
                archive_bytes,
            } => {
                let total = self
                    .requests
                    .get(&request_id)
                    .map(|view| view.total_chunks)
                    .unwrap_or_default();
                self.emit(
                    request_id,
                    NoticeKind::Info,
                    format!(
                        "📤 Uploading chunk {}/{total} ({})",
                        chunk + 1,
                        format::format_bytes(archive_bytes)
                    ),
                )
                .await;
            }
            ProgressEvent::ChunkDelivered {
                request_id,
                chunk,
                total_chunks,
            } => {
                self.emit(
                    request_id,
                    NoticeKind::Info,
                    format!("✅ Chunk {}/{total_chunks} delivered", chunk + 1),
                )
                .await;
            }
            ProgressEvent::DeliveryFailed {
                request_id,
                destination,
                chunk,
                reason,
            } => {
                self.emit_to(
                    request_id,
                    destination,
                    NoticeKind::Warning,
                    format!(
                        "❌ Failed to upload chunk {}: {reason}\nFiles are kept on disk.",
                        chunk + 1
                    ),
                )
                .await;
            }
            ProgressEvent::QuotaPaused {
                request_id,
                destination,
                reason,
            } => {
                self.emit_to(
                    request_id,
                    destination,
                    NoticeKind::Warning,
                    format!(
                        "⏸️ Download paused, source quota exceeded ({reason}).\nSend `resume {request_id}` once the quota resets."
                    ),
                )
                .await;
            }
            ProgressEvent::Finished {
                request_id,
                destination,
                status,
                error,
            } => {
                let name = self
                    .requests
                    .get(&request_id)
                    .map(|view| view.name.clone())
                    .unwrap_or_default();
                let (kind, text) = match (status, error) {
                    (RequestStatus::Completed, _) => (
                        NoticeKind::Completed,
                        format!("✅ Download complete: {name}"),
                    ),
                    (RequestStatus::Paused, _) => {
                        self.requests.remove(&request_id);
                        return;
                    }
                    (_, Some(error)) if error == "cancelled" => (
                        NoticeKind::Failed,
                        format!("🛑 Download #{request_id} cancelled"),
                    ),
                    (_, error) => (
                        NoticeKind::Failed,
                        format!(
                            "❌ Download failed: {}",
                            error.unwrap_or_else(|| "unknown error".to_string())
                        ),
                    ),
                };
                self.emit_to(request_id, destination, kind, text).await;
                self.requests.remove(&request_id);
            }
        }
    }
}
