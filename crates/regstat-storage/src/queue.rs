use crate::ingest::{ImportRequest, ImportResult};
use crate::storage::{Result, Storage, StorageError};
use regstat_model::ImportControl;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct ImportJob {
    request: ImportRequest,
    control: ImportControl,
    reply: oneshot::Sender<Result<ImportResult>>,
}

/// Async front door to the store's single writer.
///
/// Jobs are queued on a bounded channel and executed one at a time by a
/// single owning task, each on the blocking pool. Dropping every handle
/// closes the channel and lets the writer task finish.
#[derive(Debug, Clone)]
pub struct ImportQueue {
    sender: mpsc::Sender<ImportJob>,
}

impl ImportQueue {
    /// Start the writer task on the current tokio runtime.
    pub fn spawn(storage: Storage, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<ImportJob>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let ImportJob {
                    request,
                    control,
                    reply,
                } = job;
                let storage = storage.clone();
                let label = format!("{} {}", request.data_kind, request.year);
                let outcome = tokio::task::spawn_blocking(move || {
                    storage.import_with_control(&request, &control)
                })
                .await;
                let result = outcome.unwrap_or_else(|err| {
                    Err(StorageError::ImportFailed(format!("import task failed: {err}")))
                });
                if reply.send(result).is_err() {
                    log::debug!("import {label} finished after its caller went away");
                }
            }
            log::debug!("import queue closed");
        });
        (Self { sender }, handle)
    }

    pub async fn submit(&self, request: ImportRequest) -> Result<ImportResult> {
        self.submit_with_control(request, ImportControl::new()).await
    }

    /// Queue an import and wait for its result. `control` can cancel it while
    /// it waits or runs.
    pub async fn submit_with_control(
        &self,
        request: ImportRequest,
        control: ImportControl,
    ) -> Result<ImportResult> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(ImportJob {
                request,
                control,
                reply,
            })
            .await
            .map_err(|_| StorageError::ImportFailed("import queue is closed".to_string()))?;
        response
            .await
            .map_err(|_| StorageError::ImportFailed("import queue dropped the job".to_string()))?
    }
}
