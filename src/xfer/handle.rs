//! Transfer handle: owns one connection and drives it through its lifecycle.
//!
//! ```text
//! Created ──apply_options──▶ Configured ──start──▶ Running ──▶ Completed
//!    │                           │                    ├──────▶ Failed
//!    └──────────cancel───────────┴────────────────────┴──────▶ Cancelled
//! ```
//!
//! Lifecycle methods take `&mut self`, so only the owner can drive a handle.
//! Cancellation of a running handle goes through a [`CancelHandle`], a shared
//! flag plus a wakeup, so a stalled read is interrupted as soon as it is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant as Deadline;
use tracing::{debug, info, warn};

use super::error::{TransferCode, TransportFault, XferError};
use super::hasher::{DigestAlgorithm, Hasher};
use super::options::{OptionKey, OptionSet, OptionValue, UserData, WriteCallback};
use super::types::{HandleState, ProgressEvent, TransferResult};
use crate::transport::{ChunkStream, Connection, Transport};

/// Requests cancellation of a handle from outside its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    wake: Notify,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::Release);
        self.0.wake.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::Acquire)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.0.wake.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// The write callback and user data bound to a handle.
struct CallbackBinding {
    callback: WriteCallback,
    data: Option<UserData>,
}

impl CallbackBinding {
    fn new(callback: WriteCallback, data: Option<UserData>) -> Self {
        Self { callback, data }
    }

    /// Hand one chunk to the callback; returns the bytes it consumed.
    fn invoke(&self, chunk: &[u8]) -> usize {
        (self.callback)(chunk, self.data.as_ref())
    }
}

/// One managed transfer.
pub struct TransferHandle {
    id: String,
    label: Option<String>,
    state: HandleState,
    conn: Option<Box<dyn Connection>>,
    pending: OptionSet,
    applied: OptionSet,
    digest: Option<DigestAlgorithm>,
    cancel: CancelHandle,
    progress: Option<broadcast::Sender<ProgressEvent>>,
    result: Option<TransferResult>,
}

impl TransferHandle {
    /// Allocate a connection from `transport`.
    pub fn open(transport: &dyn Transport) -> Result<Self, XferError> {
        let conn = transport.open().map_err(XferError::AllocationFailed)?;
        let id = uuid::Uuid::new_v4().to_string();
        debug!(transfer_id = %id, "Handle opened");
        Ok(Self {
            id,
            label: None,
            state: HandleState::Created,
            conn: Some(conn),
            pending: OptionSet::new(),
            applied: OptionSet::new(),
            digest: None,
            cancel: CancelHandle::default(),
            progress: None,
            result: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// The result, once the handle reached a terminal state.
    pub fn result(&self) -> Option<&TransferResult> {
        self.result.as_ref()
    }

    /// Compute a digest over the received bytes.
    pub fn set_digest(&mut self, algorithm: Option<DigestAlgorithm>) {
        self.digest = algorithm;
    }

    pub(crate) fn set_progress(&mut self, tx: broadcast::Sender<ProgressEvent>) {
        self.progress = Some(tx);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Record an option value; it reaches the connection on the next
    /// [`apply_options`](Self::apply_options).
    pub fn set_option(&mut self, key: OptionKey, value: OptionValue) -> Result<(), XferError> {
        self.ensure_configurable("set options on")?;
        self.pending.set(key, value)
    }

    /// Push pending options to the connection, in the order they were set.
    pub fn apply_options(&mut self) -> Result<(), XferError> {
        self.ensure_configurable("apply options to")?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(self.invalid("apply options to"));
        };
        while let Some((key, value)) = self.pending.pop_front() {
            if let Err(reason) = conn.setopt(key, &value) {
                warn!(transfer_id = %self.id, option = %key, reason = %reason, "Option rejected");
                return Err(XferError::OptionRejected { key, reason });
            }
            if key.is_secret() {
                debug!(transfer_id = %self.id, option = %key, "Option applied");
            } else {
                debug!(transfer_id = %self.id, option = %key, value = ?value, "Option applied");
            }
            self.applied.set(key, value)?;
        }
        self.state = HandleState::Configured;
        Ok(())
    }

    /// Cancel the handle. Before `start` this ends it immediately with zero
    /// bytes; a terminal handle is left as it is.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if matches!(self.state, HandleState::Created | HandleState::Configured) {
            self.finish(HandleState::Cancelled, 0, None, Some(XferError::Cancelled), Instant::now());
            info!(transfer_id = %self.id, "Transfer cancelled before start");
        }
    }

    /// Run the transfer to completion, failure, or cancellation.
    ///
    /// Errors raised while transferring are reported in the returned result.
    /// `Err` means the handle could not be started at all (already started,
    /// finished, or closed).
    pub async fn start(&mut self) -> Result<TransferResult, XferError> {
        if self.state.is_terminal() || self.state == HandleState::Running || self.conn.is_none() {
            return Err(self.invalid("start"));
        }
        let started = Instant::now();

        if self.cancel.is_cancelled() {
            self.finish(HandleState::Cancelled, 0, None, Some(XferError::Cancelled), started);
            return Ok(self.result_or_cancelled());
        }
        if !self.pending.is_empty() || self.state == HandleState::Created {
            if let Err(e) = self.apply_options() {
                self.finish(HandleState::Failed, 0, None, Some(e), started);
                return Ok(self.result_or_cancelled());
            }
        }

        self.state = HandleState::Running;
        self.emit(ProgressEvent::Started {
            transfer_id: self.id.clone(),
            label: self.label.clone(),
        });
        info!(transfer_id = %self.id, label = ?self.label, "Transfer started");

        let binding = self.binding();
        let limits = Limits {
            deadline: self
                .applied
                .get_int(OptionKey::TimeoutMs)
                .and_then(|ms| u64::try_from(ms).ok())
                .filter(|ms| *ms > 0)
                .map(|ms| Deadline::now() + std::time::Duration::from_millis(ms)),
            max_bytes: self
                .applied
                .get_int(OptionKey::MaxFileSize)
                .and_then(|n| u64::try_from(n).ok())
                .filter(|n| *n > 0),
        };
        let mut hasher = self.digest.map(Hasher::new);

        let outcome = {
            let Some(conn) = self.conn.as_mut() else {
                return Err(self.invalid("start"));
            };
            let chunks = conn.perform();
            drive(
                chunks,
                &self.id,
                binding.as_ref(),
                hasher.as_mut(),
                &self.cancel,
                &limits,
                self.progress.as_ref(),
            )
            .await
        };

        let (state, error, digest) = match outcome.end {
            End::Done => (
                HandleState::Completed,
                None,
                hasher.map(Hasher::finalize_hex),
            ),
            End::Cancelled => (HandleState::Cancelled, Some(XferError::Cancelled), None),
            End::Fault(fault) => (HandleState::Failed, Some(fault.into()), None),
        };
        self.finish(state, outcome.bytes, digest, error, started);

        let result = self.result_or_cancelled();
        match &result.error {
            Some(e) if state == HandleState::Failed => warn!(
                transfer_id = %self.id,
                bytes = result.bytes_transferred,
                error = %e,
                "Transfer failed"
            ),
            _ => info!(
                transfer_id = %self.id,
                state = %state,
                bytes = result.bytes_transferred,
                elapsed_ms = result.elapsed_ms,
                "Transfer finished"
            ),
        }
        Ok(result)
    }

    /// Release the connection. Safe to call any number of times, in any state.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(transfer_id = %self.id, state = %self.state, "Handle closed");
        }
    }

    fn binding(&self) -> Option<CallbackBinding> {
        let callback = match self.applied.get(OptionKey::WriteFunction) {
            Some(OptionValue::Callback(cb)) => Arc::clone(cb),
            _ => return None,
        };
        let data = match self.applied.get(OptionKey::WriteData) {
            Some(OptionValue::Pointer(data)) => Some(Arc::clone(data)),
            _ => None,
        };
        Some(CallbackBinding::new(callback, data))
    }

    fn ensure_configurable(&self, op: &'static str) -> Result<(), XferError> {
        if matches!(self.state, HandleState::Created | HandleState::Configured) && self.conn.is_some() {
            Ok(())
        } else {
            Err(self.invalid(op))
        }
    }

    fn invalid(&self, op: &'static str) -> XferError {
        XferError::InvalidState {
            op,
            state: self.state,
        }
    }

    fn finish(
        &mut self,
        state: HandleState,
        bytes: u64,
        digest: Option<String>,
        error: Option<XferError>,
        started: Instant,
    ) {
        self.state = state;
        let result = TransferResult {
            transfer_id: self.id.clone(),
            label: self.label.clone(),
            state,
            bytes_transferred: bytes,
            digest,
            error,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.emit(ProgressEvent::Finished {
            transfer_id: self.id.clone(),
            state,
            bytes_transferred: bytes,
        });
        self.result = Some(result);
    }

    fn result_or_cancelled(&self) -> TransferResult {
        self.result.clone().unwrap_or_else(|| TransferResult {
            transfer_id: self.id.clone(),
            label: self.label.clone(),
            state: HandleState::Cancelled,
            bytes_transferred: 0,
            digest: None,
            error: Some(XferError::Cancelled),
            elapsed_ms: 0,
        })
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

struct Limits {
    deadline: Option<Deadline>,
    max_bytes: Option<u64>,
}

enum End {
    Done,
    Cancelled,
    Fault(TransportFault),
}

struct Outcome {
    bytes: u64,
    end: End,
}

/// Deliver chunks in receipt order until the stream ends, faults, exceeds a
/// limit, or cancellation is requested. A pending read is abandoned as soon as
/// the cancel handle fires; a chunk that arrives after that is not delivered.
async fn drive(
    mut chunks: ChunkStream<'_>,
    transfer_id: &str,
    binding: Option<&CallbackBinding>,
    mut hasher: Option<&mut Hasher>,
    cancel: &CancelHandle,
    limits: &Limits,
    progress: Option<&broadcast::Sender<ProgressEvent>>,
) -> Outcome {
    let mut bytes = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Outcome { bytes, end: End::Cancelled };
            }
            () = expire(limits.deadline) => {
                return Outcome {
                    bytes,
                    end: End::Fault(TransportFault::new(
                        TransferCode::OperationTimedout,
                        "transfer deadline exceeded",
                    )),
                };
            }
            next = chunks.next() => next,
        };

        let chunk = match next {
            None => return Outcome { bytes, end: End::Done },
            Some(Err(fault)) => return Outcome { bytes, end: End::Fault(fault) },
            Some(Ok(chunk)) => chunk,
        };
        if cancel.is_cancelled() {
            return Outcome { bytes, end: End::Cancelled };
        }

        let len = chunk.len() as u64;
        if let Some(max) = limits.max_bytes {
            if bytes + len > max {
                return Outcome {
                    bytes,
                    end: End::Fault(TransportFault::new(
                        TransferCode::FilesizeExceeded,
                        format!("transfer exceeds {max} bytes"),
                    )),
                };
            }
        }

        if let Some(binding) = binding {
            let consumed = binding.invoke(&chunk);
            if consumed != chunk.len() {
                return Outcome {
                    bytes,
                    end: End::Fault(TransportFault::new(
                        TransferCode::WriteError,
                        format!("callback consumed {consumed} of {} bytes", chunk.len()),
                    )),
                };
            }
        }
        if let Some(h) = hasher.as_deref_mut() {
            h.update(&chunk);
        }
        bytes += len;

        if let Some(tx) = progress {
            let _ = tx.send(ProgressEvent::Chunk {
                transfer_id: transfer_id.to_string(),
                chunk_len: chunk.len(),
                bytes_transferred: bytes,
            });
        }
    }
}

async fn expire(deadline: Option<Deadline>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::transport::scripted::{Script, ScriptedTransport};
    use crate::xfer::hasher;

    fn transport() -> ScriptedTransport {
        ScriptedTransport::new()
            .route("mem://mail/1", Script::chunks(["From: a\r\n", "\r\n", "body"]))
            .route(
                "mem://broken",
                Script::chunks(["partial"]).then_fail(TransferCode::RecvError, "reset"),
            )
            .route(
                "mem://slow",
                Script::chunks(["a", "b", "c", "d"]).delay(Duration::from_millis(20)),
            )
    }

    fn open(t: &ScriptedTransport, url: &str) -> TransferHandle {
        let mut h = TransferHandle::open(t).unwrap();
        h.set_option(OptionKey::Url, url.into()).unwrap();
        h
    }

    #[tokio::test]
    async fn test_lifecycle_completes_with_digest() {
        let t = transport();
        let mut h = open(&t, "mem://mail/1");
        h.set_digest(Some(DigestAlgorithm::Sha256));
        assert_eq!(h.state(), HandleState::Created);
        h.apply_options().unwrap();
        assert_eq!(h.state(), HandleState::Configured);

        let result = h.start().await.unwrap();
        assert_eq!(result.state, HandleState::Completed);
        assert_eq!(result.bytes_transferred, 15);
        assert_eq!(
            result.digest.as_deref(),
            Some(hasher::digest(DigestAlgorithm::Sha256, b"From: a\r\n\r\nbody").as_str())
        );
        assert!(h.start().await.is_err());
    }

    #[tokio::test]
    async fn test_callback_sees_chunks_in_receipt_order() {
        let t = transport();
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let mut h = open(&t, "mem://mail/1");
        h.set_option(
            OptionKey::WriteFunction,
            OptionValue::callback(move |chunk, _| {
                sink.lock().unwrap().push(chunk.to_vec());
                chunk.len()
            }),
        )
        .unwrap();
        h.start().await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![b"From: a\r\n".to_vec(), b"\r\n".to_vec(), b"body".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_user_data_reaches_callback() {
        let t = transport();
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::default();
        let mut h = open(&t, "mem://mail/1");
        h.set_option(OptionKey::WriteData, OptionValue::pointer(Arc::clone(&buffer)))
            .unwrap();
        h.set_option(
            OptionKey::WriteFunction,
            OptionValue::callback(|chunk, data| {
                let Some(buf) = data.and_then(|d| d.downcast_ref::<Mutex<Vec<u8>>>()) else {
                    return 0;
                };
                buf.lock().unwrap().extend_from_slice(chunk);
                chunk.len()
            }),
        )
        .unwrap();
        let result = h.start().await.unwrap();
        assert!(result.is_success());
        assert_eq!(&*buffer.lock().unwrap(), b"From: a\r\n\r\nbody");
    }

    #[tokio::test]
    async fn test_short_write_fails_transfer() {
        let t = transport();
        let mut h = open(&t, "mem://mail/1");
        h.set_option(
            OptionKey::WriteFunction,
            OptionValue::callback(|chunk, _| chunk.len().saturating_sub(1)),
        )
        .unwrap();
        let result = h.start().await.unwrap();
        assert_eq!(result.state, HandleState::Failed);
        assert_eq!(
            result.error.and_then(|e| e.transfer_code()),
            Some(TransferCode::WriteError)
        );
        assert_eq!(result.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let t = transport();
        let mut h = open(&t, "mem://mail/1");
        h.cancel();
        assert_eq!(h.state(), HandleState::Cancelled);
        let result = h.result().unwrap();
        assert_eq!(result.bytes_transferred, 0);
        assert_eq!(result.error, Some(XferError::Cancelled));
        assert!(h.start().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_flag_before_start() {
        let t = transport();
        let mut h = open(&t, "mem://mail/1");
        h.cancel_handle().cancel();
        let result = h.start().await.unwrap();
        assert_eq!(result.state, HandleState::Cancelled);
        assert_eq!(result.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_reports_partial_bytes() {
        let t = transport();
        let mut h = open(&t, "mem://slow");
        let cancel = h.cancel_handle();
        h.set_option(
            OptionKey::WriteFunction,
            OptionValue::callback(move |chunk, _| {
                cancel.cancel();
                chunk.len()
            }),
        )
        .unwrap();
        let result = h.start().await.unwrap();
        assert_eq!(result.state, HandleState::Cancelled);
        // The chunk in flight is delivered before the flag is honoured.
        assert_eq!(result.bytes_transferred, 1);
        assert_eq!(result.digest, None);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_read() {
        let t = ScriptedTransport::new().route(
            "mem://stalled",
            Script::chunks(["a", "b"]).delay(Duration::from_secs(3)),
        );
        let delivered: Arc<Mutex<Vec<u8>>> = Arc::default();
        let sink = Arc::clone(&delivered);
        let mut h = open(&t, "mem://stalled");
        h.set_option(
            OptionKey::WriteFunction,
            OptionValue::callback(move |chunk, _| {
                sink.lock().unwrap().extend_from_slice(chunk);
                chunk.len()
            }),
        )
        .unwrap();

        let cancel = h.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let begun = Instant::now();
        let result = h.start().await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(1), "took {:?}", begun.elapsed());
        assert_eq!(result.state, HandleState::Cancelled);
        assert_eq!(result.bytes_transferred, 0);
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_late_and_early_waiters() {
        let cancel = CancelHandle::default();
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(100), cancel.cancelled())
            .await
            .unwrap();

        let cancel = CancelHandle::default();
        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fault_reports_partial_bytes() {
        let t = transport();
        let mut h = open(&t, "mem://broken");
        let result = h.start().await.unwrap();
        assert_eq!(result.state, HandleState::Failed);
        assert_eq!(result.bytes_transferred, 7);
        assert_eq!(result.status_code(), "RECV_ERROR");
    }

    #[tokio::test]
    async fn test_timeout_and_size_limits() {
        let t = transport();
        let mut h = open(&t, "mem://slow");
        h.set_option(OptionKey::TimeoutMs, 30i64.into()).unwrap();
        let result = h.start().await.unwrap();
        assert_eq!(result.status_code(), "OPERATION_TIMEDOUT");

        let mut h = open(&t, "mem://mail/1");
        h.set_option(OptionKey::MaxFileSize, 10i64.into()).unwrap();
        let result = h.start().await.unwrap();
        assert_eq!(result.status_code(), "FILESIZE_EXCEEDED");
        // Nothing past the limit is delivered.
        assert_eq!(result.bytes_transferred, 9);
    }

    #[test]
    fn test_close_is_idempotent() {
        let t = transport();
        let mut h = open(&t, "mem://mail/1");
        assert_eq!(t.live(), 1);
        for _ in 0..3 {
            h.close();
            assert!(h.is_closed());
            assert_eq!(t.live(), 0);
            assert_eq!(h.state(), HandleState::Created);
        }
        assert!(matches!(
            h.set_option(OptionKey::Verbose, 1i64.into()),
            Err(XferError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_rejected_option_is_recoverable() {
        let t = transport().reject_option(OptionKey::UserAgent);
        let mut h = open(&t, "mem://mail/1");
        h.set_option(OptionKey::UserAgent, "mailxfer".into()).unwrap();
        h.set_option(OptionKey::Verbose, 1i64.into()).unwrap();
        let err = h.apply_options().unwrap_err();
        assert!(matches!(
            err,
            XferError::OptionRejected { key: OptionKey::UserAgent, .. }
        ));
        assert_eq!(h.state(), HandleState::Created);
        // The refused value is dropped; the rest is still pending.
        h.apply_options().unwrap();
        assert_eq!(h.state(), HandleState::Configured);
    }

    #[tokio::test]
    async fn test_rejection_at_start_fails_handle() {
        let t = transport().reject_option(OptionKey::UserAgent);
        let mut h = open(&t, "mem://mail/1");
        h.set_option(OptionKey::UserAgent, "mailxfer".into()).unwrap();
        let result = h.start().await.unwrap();
        assert_eq!(result.state, HandleState::Failed);
        assert_eq!(result.status_code(), "OPTION_REJECTED");
    }

    #[test]
    fn test_wrong_kind_rejected_at_set_time() {
        let t = transport();
        let mut h = open(&t, "mem://mail/1");
        let err = h.set_option(OptionKey::TimeoutMs, "soon".into()).unwrap_err();
        assert_eq!(err.code(), "INVALID_OPTION_KIND");
    }
}
