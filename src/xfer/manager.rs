//! Session manager: queues configured handles and runs them concurrently.
//!
//! `submit` does all configuration up front, so a bad option is reported to
//! the caller and never reaches the queue. `run_all` drains the queue onto
//! tokio tasks gated by a semaphore; results are kept in submission order no
//! matter which transfer finishes first.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::error::{TransferCode, XferError};
use super::handle::{CancelHandle, TransferHandle};
use super::types::{
    HandleState, ManagerConfig, ProgressEvent, RunSummary, TransferRequest, TransferResult,
};
use crate::transport::Transport;

/// Receipt for a submitted transfer.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: String,
    /// Position in submission order, starting at 0.
    pub index: usize,
    cancel: CancelHandle,
}

impl Ticket {
    /// Request cancellation, whether the transfer is queued or running.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Owns every submitted handle until it has run and been closed.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    progress_tx: broadcast::Sender<ProgressEvent>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_index: usize,
    queued: Vec<Queued>,
    running: HashMap<String, CancelHandle>,
    results: Vec<(usize, TransferResult)>,
}

struct Queued {
    index: usize,
    handle: TransferHandle,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ManagerConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(256);
        Self {
            transport,
            config,
            progress_tx,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Receive progress events for every transfer run after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Create, configure and queue a handle for `request`.
    ///
    /// Manager defaults are applied first, then the request's options in
    /// order. On error the handle is released and nothing is queued.
    pub async fn submit(&self, request: TransferRequest) -> Result<Ticket, XferError> {
        let mut handle = TransferHandle::open(self.transport.as_ref())?;
        handle.set_label(request.label);
        handle.set_digest(request.digest.or(self.config.digest));
        for (key, value) in self.config.defaults.iter().cloned().chain(request.options) {
            handle.set_option(key, value)?;
        }
        handle.apply_options()?;
        handle.set_progress(self.progress_tx.clone());

        let mut inner = self.inner.lock().await;
        let index = inner.next_index;
        inner.next_index += 1;
        let ticket = Ticket {
            id: handle.id().to_string(),
            index,
            cancel: handle.cancel_handle(),
        };
        debug!(transfer_id = %ticket.id, index, label = ?handle.label(), "Transfer queued");
        inner.queued.push(Queued { index, handle });
        Ok(ticket)
    }

    /// Number of submitted transfers that have not run yet.
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.queued.len()
    }

    /// Cancel a queued or running transfer. Returns `false` if `transfer_id`
    /// is unknown or already finished.
    pub async fn cancel(&self, transfer_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(q) = inner.queued.iter_mut().find(|q| q.handle.id() == transfer_id) {
            q.handle.cancel();
            return true;
        }
        match inner.running.get(transfer_id) {
            Some(cancel) => {
                cancel.cancel();
                info!(transfer_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run every queued transfer, at most `max_concurrent` at a time.
    ///
    /// Each handle is closed as soon as its transfer ends. A transfer that
    /// fails (or whose task panics) is recorded as failed; the others carry on.
    pub async fn run_all(&self) -> RunSummary {
        let batch = {
            let mut inner = self.inner.lock().await;
            let batch = std::mem::take(&mut inner.queued);
            for q in &batch {
                inner
                    .running
                    .insert(q.handle.id().to_string(), q.handle.cancel_handle());
            }
            batch
        };
        if batch.is_empty() {
            return RunSummary::default();
        }
        info!(
            transfers = batch.len(),
            max_concurrent = self.config.concurrency_limit(),
            "Running transfers"
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency_limit()));
        let tasks: Vec<Running> = batch
            .into_iter()
            .map(|q| Running {
                index: q.index,
                id: q.handle.id().to_string(),
                label: q.handle.label().map(str::to_string),
                task: tokio::spawn(run_one(q.handle, Arc::clone(&permits))),
            })
            .collect();

        let mut summary = RunSummary::default();
        for running in tasks {
            let result = match running.task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(transfer_id = %running.id, error = %e, "Transfer task aborted");
                    TransferResult {
                        transfer_id: running.id.clone(),
                        label: running.label,
                        state: HandleState::Failed,
                        bytes_transferred: 0,
                        digest: None,
                        error: Some(XferError::TransferError {
                            code: TransferCode::WriteError,
                            message: format!("transfer task aborted: {e}"),
                        }),
                        elapsed_ms: 0,
                    }
                }
            };
            summary.record(result.state);

            let mut inner = self.inner.lock().await;
            inner.running.remove(&running.id);
            let pos = inner.results.partition_point(|(i, _)| *i < running.index);
            inner.results.insert(pos, (running.index, result));
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Run finished"
        );
        summary
    }

    /// Result of one executed transfer.
    pub async fn result(&self, transfer_id: &str) -> Option<TransferResult> {
        self.inner
            .lock()
            .await
            .results
            .iter()
            .find(|(_, r)| r.transfer_id == transfer_id)
            .map(|(_, r)| r.clone())
    }

    /// One result per executed submission, in submission order.
    pub async fn results(&self) -> Vec<TransferResult> {
        self.inner
            .lock()
            .await
            .results
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }
}

struct Running {
    index: usize,
    id: String,
    label: Option<String>,
    task: JoinHandle<TransferResult>,
}

async fn run_one(mut handle: TransferHandle, permits: Arc<Semaphore>) -> TransferResult {
    // The semaphore is never closed, so acquisition only fails on shutdown.
    let _permit = permits.acquire_owned().await.ok();
    let result = match handle.result() {
        // Cancelled while queued.
        Some(done) => done.clone(),
        None => match handle.start().await {
            Ok(result) => result,
            Err(e) => TransferResult {
                transfer_id: handle.id().to_string(),
                label: handle.label().map(str::to_string),
                state: HandleState::Failed,
                bytes_transferred: 0,
                digest: None,
                error: Some(e),
                elapsed_ms: 0,
            },
        },
    };
    handle.close();
    result
}
