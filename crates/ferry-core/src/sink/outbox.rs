use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::SinkTransport;
use crate::errors::{TransferError, TransferResult};
use crate::model::DestinationId;

/// Drops delivered artifacts into `<root>/<destination>/`, each with a
/// `<name>.caption.txt` sidecar.
#[derive(Debug, Clone)]
pub struct OutboxSink {
    root: PathBuf,
    max_bytes: u64,
}

impl OutboxSink {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn destination_dir(&self, destination: DestinationId) -> PathBuf {
        self.root.join(destination.to_string())
    }
}

#[async_trait]
impl SinkTransport for OutboxSink {
    async fn send_document(
        &self,
        destination: DestinationId,
        path: &Path,
        caption: &str,
    ) -> TransferResult<()> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.max_bytes {
            return Err(TransferError::Delivery(format!(
                "{} is {size} bytes, over the {} byte limit",
                path.display(),
                self.max_bytes
            )));
        }
        let name = path
            .file_name()
            .ok_or_else(|| TransferError::Delivery(format!("{} has no file name", path.display())))?;

        let dir = self.destination_dir(destination);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(name);
        tokio::fs::copy(path, &target).await?;

        let mut sidecar = target.into_os_string();
        sidecar.push(".caption.txt");
        tokio::fs::write(&sidecar, caption).await?;
        log::info!(
            "delivered {} ({size} bytes) to outbox {}",
            path.display(),
            dir.display()
        );
        Ok(())
    }
}
