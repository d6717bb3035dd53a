#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use ferry_core::model::DestinationId;
use ferry_core::progress::{ProgressEvent, ProgressSender};
use ferry_core::sink::SinkTransport;
use ferry_core::source::{FolderLink, ProviderError, RemoteFile, RemoteFolder, SourceProvider};
use ferry_core::{Context, PipelineConfig, TransferError, TransferOrchestrator, TransferResult};

pub const OWNER: i64 = 7;
pub const DESTINATION: i64 = -100;
pub const LINK: &str = "https://mega.nz/folder/share#secret";

/// What a handle does when fetched.
#[derive(Clone, Debug)]
pub enum Fault {
    /// Fail every attempt with this provider message.
    Always(String),
    /// Block until cancelled, signalling `started` first.
    Hang,
}

#[derive(Default)]
pub struct FakeSource {
    pub folders: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
    pub faults: Mutex<HashMap<String, Fault>>,
    pub fetches: Mutex<HashMap<String, u32>>,
    pub started: Arc<Notify>,
}

impl FakeSource {
    /// Folder `share` with four files of 60, 50, 40 and 30 bytes.
    pub fn standard() -> Arc<Self> {
        let source = Self::default();
        source.folders.lock().insert(
            "share".into(),
            vec![
                ("photos/a.jpg".into(), vec![b'a'; 60]),
                ("b.txt".into(), vec![b'b'; 50]),
                ("photos/raw/c.raw".into(), vec![b'c'; 40]),
                ("d.md".into(), vec![b'd'; 30]),
            ],
        );
        source.folders.lock().insert("empty".into(), Vec::new());
        Arc::new(source)
    }

    pub fn fault(&self, path: &str, fault: Fault) {
        self.faults.lock().insert(path.into(), fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn fetch_count(&self, path: &str) -> u32 {
        self.fetches.lock().get(path).copied().unwrap_or(0)
    }
}

impl SourceProvider for FakeSource {
    fn folder_listing(&self, link: &FolderLink) -> Result<RemoteFolder, ProviderError> {
        let folders = self.folders.lock();
        let files = folders
            .get(&link.folder_id)
            .ok_or_else(|| ProviderError::Remote("ENOENT: no such folder".into()))?;
        let files: Vec<RemoteFile> = files
            .iter()
            .map(|(path, bytes)| RemoteFile {
                handle: path.clone(),
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                path: path.clone(),
                size: bytes.len() as u64,
            })
            .collect();
        Ok(RemoteFolder {
            name: link.folder_id.clone(),
            handle: link.folder_id.clone(),
            total_size: files.iter().map(|f| f.size).sum(),
            files,
        })
    }

    fn fetch_file(
        &self,
        file: &RemoteFile,
        target: &Path,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &CancellationToken,
    ) -> Result<u64, ProviderError> {
        *self.fetches.lock().entry(file.handle.clone()).or_default() += 1;
        let fault = self.faults.lock().get(&file.handle).cloned();
        match fault {
            Some(Fault::Always(message)) => return Err(ProviderError::Remote(message)),
            Some(Fault::Hang) => {
                std::fs::write(target, b"partial")?;
                self.started.notify_one();
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Err(ProviderError::Cancelled);
            }
            None => {}
        }
        let bytes = self
            .folders
            .lock()
            .values()
            .flatten()
            .find(|(path, _)| *path == file.handle)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| ProviderError::Remote("ENOENT: node vanished".into()))?;
        std::fs::write(target, &bytes)?;
        progress(bytes.len() as u64, file.size);
        Ok(bytes.len() as u64)
    }
}

#[derive(Clone, Debug)]
pub struct Sent {
    pub destination: DestinationId,
    pub name: String,
    pub caption: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct FakeSink {
    pub answers: Mutex<VecDeque<TransferResult<()>>>,
    pub sent: Mutex<Vec<Sent>>,
}

impl FakeSink {
    pub fn script(&self, answers: Vec<TransferResult<()>>) {
        self.answers.lock().extend(answers);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }
}

pub fn slow_down() -> TransferResult<()> {
    Err(TransferError::RateLimited {
        retry_after: Duration::from_millis(2),
        message: "Too Many Requests: retry after 2ms".into(),
    })
}

#[async_trait]
impl SinkTransport for FakeSink {
    async fn send_document(
        &self,
        destination: DestinationId,
        path: &Path,
        caption: &str,
    ) -> TransferResult<()> {
        let answer = self.answers.lock().pop_front().unwrap_or(Ok(()));
        answer?;
        let bytes = tokio::fs::read(path).await?;
        self.sent.lock().push(Sent {
            destination,
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            caption: caption.to_string(),
            bytes,
        });
        Ok(())
    }
}

/// Unpack a delivered `.tar.zst` into `(path, contents)` pairs.
pub fn unpack(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let decoder = zstd::stream::Decoder::new(bytes).expect("zstd stream");
    let mut archive = tar::Archive::new(decoder);
    let mut out = Vec::new();
    for entry in archive.entries().expect("tar entries") {
        let mut entry = entry.expect("tar entry");
        let path = entry.path().expect("entry path").to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).expect("entry contents");
        out.push((path, contents));
    }
    out
}

pub struct Harness {
    pub dir: TempDir,
    pub source: Arc<FakeSource>,
    pub sink: Arc<FakeSink>,
    pub ctx: Arc<Context>,
    pub orchestrator: TransferOrchestrator,
    pub events: UnboundedReceiver<ProgressEvent>,
}

pub fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        storage_root: root.join("downloads"),
        state_dir: root.join("state"),
        chunk_budget: 100,
        sink_limit: 10 * 1024 * 1024,
        split_margin: 0,
        max_concurrent: 2,
        retry_attempts: 2,
        retry_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(2),
        compression_level: 3,
        progress_interval: Duration::ZERO,
        compact_after_bytes: 4 * 1024 * 1024,
        sync_writes: false,
    }
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        Self::with(dir, FakeSource::standard(), Arc::new(FakeSink::default()))
    }

    /// Build a fresh context over an existing state directory, as a restart would.
    pub fn with(dir: TempDir, source: Arc<FakeSource>, sink: Arc<FakeSink>) -> Self {
        let config = config(dir.path());
        Self::with_config(dir, source, sink, config)
    }

    pub fn with_config(
        dir: TempDir,
        source: Arc<FakeSource>,
        sink: Arc<FakeSink>,
        config: PipelineConfig,
    ) -> Self {
        let (progress, events) = ProgressSender::channel();
        let ctx = Arc::new(
            Context::new(config, source.clone(), sink.clone(), progress).expect("context"),
        );
        let orchestrator = TransferOrchestrator::new(Arc::clone(&ctx));
        Self {
            dir,
            source,
            sink,
            ctx,
            orchestrator,
            events,
        }
    }

    pub fn request_dir(&self, id: u64) -> PathBuf {
        self.dir.path().join("downloads").join(format!("request_{id}"))
    }

    pub fn drain_events(&mut self) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn into_parts(self) -> (TempDir, Arc<FakeSource>, Arc<FakeSink>) {
        (self.dir, self.source, self.sink)
    }
}
