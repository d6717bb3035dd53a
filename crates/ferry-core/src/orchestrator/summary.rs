use std::fmt;
use std::time::Duration;

use crate::format::format_bytes;
use crate::model::{RequestId, RequestStatus};

/// Outcome of one orchestrator run over a request.
#[derive(Clone, Debug)]
pub struct TransferSummary {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub chunks_delivered: u32,
    pub chunks_failed: u32,
    pub files_completed: u64,
    pub files_failed: u64,
    pub bytes_downloaded: u64,
    pub duration: Duration,
}

impl TransferSummary {
    pub(crate) fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            status: RequestStatus::Pending,
            chunks_delivered: 0,
            chunks_failed: 0,
            files_completed: 0,
            files_failed: 0,
            bytes_downloaded: 0,
            duration: Duration::ZERO,
        }
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request #{} {}: {} file(s) fetched ({}), {} skipped, {} chunk(s) delivered, {} failed in {:.1?}",
            self.request_id,
            self.status,
            self.files_completed,
            format_bytes(self.bytes_downloaded),
            self.files_failed,
            self.chunks_delivered,
            self.chunks_failed,
            self.duration
        )
    }
}
