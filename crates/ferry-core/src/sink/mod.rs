//! Delivery of chunk archives to the messaging endpoint.

mod outbox;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::archive::{remove_parts, split_for_sink};
use crate::errors::{TransferError, TransferResult};
use crate::format::part_caption;
use crate::model::DestinationId;
use crate::retry::RetryPolicy;
use crate::worker::WorkerPool;

pub use outbox::OutboxSink;

/// Seam to the messaging provider.
///
/// A slow-down answer is reported as [`TransferError::RateLimited`] carrying the
/// requested wait; any other refusal as [`TransferError::Delivery`].
#[async_trait]
pub trait SinkTransport: Send + Sync {
    async fn send_document(
        &self,
        destination: DestinationId,
        path: &Path,
        caption: &str,
    ) -> TransferResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub parts: usize,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct SinkDelivery {
    transport: Arc<dyn SinkTransport>,
    limit: u64,
    part_size: u64,
    pool: WorkerPool,
    policy: RetryPolicy,
}

impl SinkDelivery {
    pub fn new(transport: Arc<dyn SinkTransport>, limit: u64, part_size: u64, pool: WorkerPool) -> Self {
        Self {
            transport,
            limit,
            part_size: part_size.clamp(1, limit.max(1)),
            pool,
            policy: RetryPolicy::rate_limit(),
        }
    }

    /// Send `artifact`, splitting it first when it exceeds the sink limit.
    ///
    /// Sent parts are removed as they go; on failure the remaining parts are removed
    /// and the original artifact is left alone.
    pub async fn deliver(
        &self,
        destination: DestinationId,
        artifact: &Path,
        caption: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<DeliveryReport> {
        let size = tokio::fs::metadata(artifact).await?.len();
        if size <= self.limit {
            self.send(destination, artifact, caption, cancel).await?;
            return Ok(DeliveryReport { parts: 1, bytes: size });
        }

        let source = artifact.to_path_buf();
        let part_size = self.part_size;
        let parts = self
            .pool
            .run("split artifact", move || split_for_sink(&source, part_size))
            .await?
            .map_err(|err| TransferError::Delivery(format!("{err:#}")))?;
        log::info!(
            "{} exceeds the {} byte sink limit; sending {} part(s)",
            artifact.display(),
            self.limit,
            parts.len()
        );

        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let count = parts.len();
        for (index, part) in parts.iter().enumerate() {
            let text = part_caption(&name, caption, index, count);
            if let Err(err) = self.send(destination, part, &text, cancel).await {
                remove_parts(&parts[index..]);
                return Err(err);
            }
            remove_parts(std::slice::from_ref(part));
        }
        Ok(DeliveryReport { parts: count, bytes: size })
    }

    async fn send(
        &self,
        destination: DestinationId,
        path: &Path,
        caption: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<()> {
        let label = format!("send {}", path.display());
        let result = self
            .policy
            .run(&label, cancel, |_| async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(TransferError::Cancelled),
                    sent = self.transport.send_document(destination, path, caption) => sent,
                }
            })
            .await;
        match result {
            Err(TransferError::RateLimited { message, .. }) => Err(TransferError::Delivery(
                format!("still rate limited after retry: {message}"),
            )),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Scripted {
        answers: Mutex<VecDeque<TransferResult<()>>>,
        sent: Mutex<Vec<(PathBuf, String, Vec<u8>)>>,
    }

    impl Scripted {
        fn with(answers: Vec<TransferResult<()>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                sent: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl SinkTransport for Scripted {
        async fn send_document(
            &self,
            _destination: DestinationId,
            path: &Path,
            caption: &str,
        ) -> TransferResult<()> {
            let answer = self.answers.lock().pop_front().unwrap_or(Ok(()));
            if answer.is_ok() {
                let bytes = std::fs::read(path)?;
                self.sent
                    .lock()
                    .push((path.to_path_buf(), caption.to_string(), bytes));
            }
            answer
        }
    }

    fn stray_parts(artifact: &Path) -> Vec<PathBuf> {
        let (Some(dir), Some(name)) = (artifact.parent(), artifact.file_name()) else {
            return Vec::new();
        };
        let prefix = format!("{}.part", name.to_string_lossy());
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
                    .map(|entry| entry.path())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn slow_down() -> TransferResult<()> {
        Err(TransferError::RateLimited {
            retry_after: Duration::from_millis(5),
            message: "flood wait".into(),
        })
    }

    #[tokio::test]
    async fn small_artifact_is_sent_whole() {
        let tmp = tempdir().unwrap();
        let artifact = tmp.path().join("chunk_0.tar.zst");
        std::fs::write(&artifact, vec![1u8; 100]).unwrap();
        let transport = Scripted::with(vec![]);
        let sink = SinkDelivery::new(transport.clone(), 100, 90, WorkerPool::new(1));

        let report = sink
            .deliver(1, &artifact, "cap", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport { parts: 1, bytes: 100 });
        assert_eq!(transport.sent.lock()[0].1, "cap");
    }

    #[tokio::test]
    async fn large_artifact_is_split_with_part_captions() {
        let tmp = tempdir().unwrap();
        let artifact = tmp.path().join("chunk_0.tar.zst");
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        std::fs::write(&artifact, &data).unwrap();
        let transport = Scripted::with(vec![]);
        let sink = SinkDelivery::new(transport.clone(), 100, 90, WorkerPool::new(1));

        let report = sink
            .deliver(1, &artifact, "cap", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.parts, 3);

        let sent = transport.sent.lock();
        let captions: Vec<&str> = sent.iter().map(|(_, c, _)| c.as_str()).collect();
        assert_eq!(
            captions,
            vec![
                "cap\n\n📁 chunk_0.tar.zst (Part 1/3)",
                "📁 chunk_0.tar.zst (Part 2/3)",
                "📁 chunk_0.tar.zst (Part 3/3)",
            ]
        );
        let joined: Vec<u8> = sent.iter().flat_map(|(_, _, b)| b.clone()).collect();
        assert_eq!(joined, data);
        assert!(stray_parts(&artifact).is_empty());
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn one_slow_down_is_absorbed() {
        let tmp = tempdir().unwrap();
        let artifact = tmp.path().join("a");
        std::fs::write(&artifact, b"abc").unwrap();
        let transport = Scripted::with(vec![slow_down()]);
        let sink = SinkDelivery::new(transport.clone(), 10, 5, WorkerPool::new(1));
        sink.deliver(1, &artifact, "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn second_slow_down_fails_delivery() {
        let tmp = tempdir().unwrap();
        let artifact = tmp.path().join("a");
        std::fs::write(&artifact, b"abc").unwrap();
        let transport = Scripted::with(vec![slow_down(), slow_down()]);
        let sink = SinkDelivery::new(transport.clone(), 10, 5, WorkerPool::new(1));
        let err = sink
            .deliver(1, &artifact, "", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Delivery(_)));
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_part_removes_remaining_parts() {
        let tmp = tempdir().unwrap();
        let artifact = tmp.path().join("big");
        std::fs::write(&artifact, vec![3u8; 30]).unwrap();
        let transport = Scripted::with(vec![
            Ok(()),
            Err(TransferError::Delivery("too large".into())),
        ]);
        let sink = SinkDelivery::new(transport.clone(), 10, 10, WorkerPool::new(1));
        let err = sink
            .deliver(1, &artifact, "", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Delivery(_)));
        assert_eq!(transport.sent.lock().len(), 1);
        assert!(stray_parts(&artifact).is_empty());
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn cancellation_stops_sending() {
        let tmp = tempdir().unwrap();
        let artifact = tmp.path().join("a");
        std::fs::write(&artifact, b"abc").unwrap();
        let sink = SinkDelivery::new(Scripted::with(vec![]), 10, 5, WorkerPool::new(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sink.deliver(1, &artifact, "", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
