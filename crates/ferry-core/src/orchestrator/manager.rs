use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{RunControl, TransferOrchestrator};
use crate::errors::{StoreError, TransferError, TransferResult};
use crate::model::{DestinationId, OwnerId, RequestId, RequestPatch, RequestStatus, TransferRequest};
use crate::progress::ProgressEvent;

struct ActiveTransfer {
    owner: OwnerId,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Owns the in-flight request tasks.
///
/// At most `max_concurrent` requests run at once; the rest wait for a slot.
#[derive(Clone)]
pub struct TransferManager {
    orchestrator: TransferOrchestrator,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    active: Arc<Mutex<HashMap<RequestId, ActiveTransfer>>>,
}

impl TransferManager {
    pub fn new(orchestrator: TransferOrchestrator) -> Self {
        let limit = orchestrator.context().config.max_concurrent.max(1);
        Self {
            orchestrator,
            slots: Arc::new(Semaphore::new(limit)),
            shutdown: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &TransferOrchestrator {
        &self.orchestrator
    }

    /// Submit a folder link and start transferring it in the background.
    pub async fn start(
        &self,
        owner: OwnerId,
        destination: DestinationId,
        link: &str,
    ) -> TransferResult<TransferRequest> {
        if self.shutdown.is_cancelled() {
            return Err(TransferError::validation("shutting down"));
        }
        let request = self.orchestrator.submit(owner, destination, link).await?;
        self.launch(&request).await;
        Ok(request)
    }

    /// Restart every request a previous process left mid-flight.
    pub async fn resume_interrupted(&self) -> TransferResult<Vec<RequestId>> {
        let requests = self.orchestrator.context().store.active_requests(None).await?;
        let mut resumed = Vec::new();
        for request in requests
            .into_iter()
            .filter(|request| request.status.is_interrupted())
        {
            log::info!(
                "resuming request #{} ({}) from chunk {}",
                request.id,
                request.status,
                request.current_chunk
            );
            if self.launch(&request).await {
                resumed.push(request.id);
            }
        }
        Ok(resumed)
    }

    /// Restart a paused or failed request belonging to `owner`.
    pub async fn resume(&self, owner: OwnerId, id: RequestId) -> TransferResult<TransferRequest> {
        if self.shutdown.is_cancelled() {
            return Err(TransferError::validation("shutting down"));
        }
        let request = self.owned_request(owner, id).await?;
        if request.status == RequestStatus::Completed {
            return Err(TransferError::validation(format!(
                "download #{id} is already complete"
            )));
        }
        if self.active.lock().await.contains_key(&id) {
            return Err(TransferError::validation(format!(
                "download #{id} is already running"
            )));
        }
        self.launch(&request).await;
        Ok(request)
    }

    /// Cancel `id`, or the owner's most recent active request when `id` is `None`.
    pub async fn cancel(&self, owner: OwnerId, id: Option<RequestId>) -> TransferResult<RequestId> {
        {
            let active = self.active.lock().await;
            let target = match id {
                Some(id) => active
                    .get_key_value(&id)
                    .filter(|(_, transfer)| transfer.owner == owner),
                None => active
                    .iter()
                    .filter(|(_, transfer)| transfer.owner == owner)
                    .max_by_key(|(id, _)| **id),
            };
            if let Some((id, transfer)) = target {
                transfer.cancel.cancel();
                log::info!("cancellation requested for request #{id}");
                return Ok(*id);
            }
        }

        // Not running: a paused request can still be cancelled.
        let candidate = match id {
            Some(id) => Some(self.owned_request(owner, id).await?),
            None => self
                .orchestrator
                .context()
                .store
                .active_requests(Some(owner))
                .await?
                .into_iter()
                .max_by_key(|request| request.id),
        };
        match candidate {
            Some(request) if !request.status.is_terminal() => {
                let ctx = self.orchestrator.context();
                ctx.store
                    .update_request(
                        request.id,
                        RequestPatch::status(RequestStatus::Failed)
                            .with_error(TransferError::Cancelled.to_string()),
                    )
                    .await?;
                ctx.progress.send(ProgressEvent::Finished {
                    request_id: request.id,
                    destination: request.destination,
                    status: RequestStatus::Failed,
                    error: Some(TransferError::Cancelled.to_string()),
                });
                Ok(request.id)
            }
            _ => Err(TransferError::validation("no active download to cancel")),
        }
    }

    /// The owner's requests that have not finished.
    pub async fn status(&self, owner: OwnerId) -> TransferResult<Vec<TransferRequest>> {
        Ok(self
            .orchestrator
            .context()
            .store
            .active_requests(Some(owner))
            .await?)
    }

    pub async fn is_running(&self, id: RequestId) -> bool {
        self.active.lock().await.contains_key(&id)
    }

    /// Wait for the task running `id` to finish. Returns immediately if it is not running.
    pub async fn wait(&self, id: RequestId) {
        let handle = self
            .active
            .lock()
            .await
            .get_mut(&id)
            .and_then(|transfer| transfer.handle.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::error!("request #{id} task failed: {err}");
            }
        }
    }

    /// Cancel and await every running request, then close the source session.
    ///
    /// Interrupted requests keep their status and resume on the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .active
            .lock()
            .await
            .values_mut()
            .filter_map(|transfer| transfer.handle.take())
            .collect();
        log::info!("waiting for {} running transfer(s)", handles.len());
        for result in join_all(handles).await {
            if let Err(err) = result {
                log::error!("transfer task failed during shutdown: {err}");
            }
        }
        self.orchestrator.context().source.logout().await;
    }

    async fn owned_request(&self, owner: OwnerId, id: RequestId) -> TransferResult<TransferRequest> {
        match self.orchestrator.context().store.request(id).await? {
            Some(request) if request.owner == owner => Ok(request),
            _ => Err(StoreError::not_found("download", format!("#{id}")).into()),
        }
    }

    /// Spawn the task for `request` unless it is already running.
    async fn launch(&self, request: &TransferRequest) -> bool {
        let mut active = self.active.lock().await;
        if active.contains_key(&request.id) {
            return false;
        }
        let id = request.id;
        let control = RunControl::new(&self.shutdown);
        let cancel = control.cancel.clone();

        let orchestrator = self.orchestrator.clone();
        let slots = Arc::clone(&self.slots);
        let registry = Arc::clone(&self.active);
        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                permit = slots.acquire_owned() => permit.ok(),
                _ = control.cancel.cancelled() => None,
            };
            match orchestrator.run(id, &control).await {
                Ok(summary) => log::info!("{summary}"),
                Err(err) if err.is_cancelled() => {}
                Err(err) => log::debug!("request #{id} ended with error: {err}"),
            }
            drop(permit);
            registry.lock().await.remove(&id);
        });

        active.insert(
            id,
            ActiveTransfer {
                owner: request.owner,
                cancel,
                handle: Some(handle),
            },
        );
        true
    }
}
