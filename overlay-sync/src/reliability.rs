//! At-least-once delivery of correlated requests.
//!
//! Every confirmed request gets a correlation id and a timer. A response
//! settles it; a timeout or a lost link moves it to the retry queue with
//! one more retry on its count. Once the count reaches the ceiling the
//! caller gets [`SyncError::RetriesExhausted`].

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{Engine, Event, Link};
use crate::error::SyncError;
use crate::optimistic::Intent;
use crate::protocol::{Envelope, OperationResponse, Request};

/// What a confirmed request resolves to.
pub type Outcome = Result<OperationResponse, SyncError>;

/// Fresh correlation id: millisecond timestamp plus a random suffix.
pub fn correlation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{millis}_{}", &suffix[..12])
}

/// Where a request's result goes once it is settled.
pub(crate) struct Completion {
    pub(crate) reply: Option<oneshot::Sender<Outcome>>,
    pub(crate) intent: Option<Intent>,
}

impl Completion {
    pub(crate) fn new(reply: oneshot::Sender<Outcome>, intent: Option<Intent>) -> Self {
        Self {
            reply: Some(reply),
            intent,
        }
    }
}

pub(crate) struct PendingOperation {
    pub(crate) correlation_id: String,
    pub(crate) request: Request,
    pub(crate) retry_count: u32,
    pub(crate) created_at: Instant,
    pub(crate) timeout: Duration,
    pub(crate) timer: Option<JoinHandle<()>>,
    pub(crate) completion: Completion,
}

impl PendingOperation {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub(crate) struct RetryQueueEntry {
    pub(crate) request: Request,
    pub(crate) retry_count: u32,
    pub(crate) enqueued_at: Instant,
    pub(crate) timeout: Duration,
    pub(crate) completion: Completion,
}

impl RetryQueueEntry {
    pub(crate) fn new(
        request: Request,
        retry_count: u32,
        timeout: Duration,
        completion: Completion,
    ) -> Self {
        Self {
            request,
            retry_count,
            enqueued_at: Instant::now(),
            timeout,
            completion,
        }
    }

    fn exhausted(&self) -> SyncError {
        SyncError::RetriesExhausted {
            action: self.request.action(),
            attempts: self.retry_count,
        }
    }
}

/// Requests sent and not yet settled, by correlation id.
#[derive(Default)]
pub(crate) struct PendingOperations {
    ops: HashMap<String, PendingOperation>,
}

impl PendingOperations {
    pub(crate) fn contains(&self, correlation_id: &str) -> bool {
        self.ops.contains_key(correlation_id)
    }

    pub(crate) fn insert(&mut self, op: PendingOperation) {
        self.ops.insert(op.correlation_id.clone(), op);
    }

    /// Remove an operation and stop its timer.
    pub(crate) fn take(&mut self, correlation_id: &str) -> Option<PendingOperation> {
        let mut op = self.ops.remove(correlation_id)?;
        op.cancel_timer();
        Some(op)
    }

    /// Remove everything, oldest first, with timers stopped.
    pub(crate) fn drain(&mut self) -> Vec<PendingOperation> {
        let mut ops: Vec<_> = self.ops.drain().map(|(_, op)| op).collect();
        ops.sort_by_key(|op| op.created_at);
        for op in &mut ops {
            op.cancel_timer();
        }
        ops
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}

/// FIFO of requests waiting for an open link.
#[derive(Default)]
pub(crate) struct RetryQueue {
    entries: VecDeque<RetryQueueEntry>,
}

impl RetryQueue {
    pub(crate) fn push(&mut self, entry: RetryQueueEntry) {
        self.entries.push_back(entry);
    }

    pub(crate) fn drain(&mut self) -> Vec<RetryQueueEntry> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Requeue a failed attempt, or give up once `max_retries` is reached.
pub(crate) fn requeue_or_fail(
    op: PendingOperation,
    max_retries: u32,
) -> Result<RetryQueueEntry, (Completion, SyncError)> {
    if op.retry_count < max_retries {
        Ok(RetryQueueEntry::new(
            op.request,
            op.retry_count + 1,
            op.timeout,
            op.completion,
        ))
    } else {
        let error = SyncError::RetriesExhausted {
            action: op.request.action(),
            attempts: op.retry_count,
        };
        Err((op.completion, error))
    }
}

impl Engine {
    /// Send a correlated request, or queue it while the link is down.
    pub(crate) async fn submit(
        &mut self,
        request: Request,
        timeout: Duration,
        completion: Completion,
        retry_count: u32,
    ) {
        let writer = match &self.link {
            Link::Open(writer) => writer.clone(),
            Link::Idle | Link::Connecting => {
                log::info!(
                    "Not connected, queued {} ({} waiting)",
                    request.action(),
                    self.retry_queue.len() + 1
                );
                self.retry_queue
                    .push(RetryQueueEntry::new(request, retry_count, timeout, completion));
                return;
            }
        };

        let correlation_id = loop {
            let id = correlation_id();
            if !self.pending.contains(&id) {
                break id;
            }
        };
        let frame = match Envelope::new(request.clone(), Some(correlation_id.clone())).encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.finish(completion, Err(e.into())).await;
                return;
            }
        };

        log::debug!(
            "Sending {} [{}] (retry {})",
            request.action(),
            correlation_id,
            retry_count
        );
        let timer = self.spawn_operation_timer(correlation_id.clone(), timeout);
        self.pending.insert(PendingOperation {
            correlation_id,
            request,
            retry_count,
            created_at: Instant::now(),
            timeout,
            timer: Some(timer),
            completion,
        });
        if writer.send(frame).is_err() {
            // The link task is gone; its Closed event requeues this operation.
            log::debug!("Link writer closed during send");
        }
    }

    fn spawn_operation_timer(&self, correlation_id: String, timeout: Duration) -> JoinHandle<()> {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inputs.send(Event::OperationTimeout { correlation_id });
        })
    }

    pub(crate) async fn handle_response(&mut self, response: OperationResponse) {
        if let Some(version) = response.version {
            self.version.observe(version, response.checksum.as_deref());
        }
        let Some(op) = self.pending.take(&response.request_id) else {
            log::warn!("Response for unknown operation {}", response.request_id);
            return;
        };

        let elapsed = op.created_at.elapsed();
        let outcome = if response.success {
            log::info!(
                "Confirmed {} [{}] in {:?}",
                op.request.action(),
                op.correlation_id,
                elapsed
            );
            Ok(response)
        } else {
            let reason = response
                .error
                .unwrap_or_else(|| "operation failed".to_string());
            log::error!(
                "Rejected {} [{}]: {}",
                op.request.action(),
                op.correlation_id,
                reason
            );
            Err(SyncError::Rejected { reason })
        };
        self.finish(op.completion, outcome).await;
    }

    /// A timer fired. Stale timers for settled operations are ignored.
    pub(crate) async fn operation_timed_out(&mut self, correlation_id: &str) {
        let Some(op) = self.pending.take(correlation_id) else {
            return;
        };
        log::warn!(
            "Timeout: {} [{}] not confirmed after {:?}",
            op.request.action(),
            op.correlation_id,
            op.timeout
        );
        match requeue_or_fail(op, self.config.max_retries) {
            Ok(entry) => {
                self.retry_queue.push(entry);
                if self.is_open() {
                    self.flush_retry_queue().await;
                }
            }
            Err((completion, error)) => self.finish(completion, Err(error)).await,
        }
    }

    /// Resubmit queued requests in order; those at the ceiling fail.
    pub(crate) async fn flush_retry_queue(&mut self) {
        if self.retry_queue.is_empty() {
            return;
        }
        log::info!("Flushing {} queued operations", self.retry_queue.len());
        for entry in self.retry_queue.drain() {
            if entry.retry_count >= self.config.max_retries {
                let error = entry.exhausted();
                log::error!("{error}");
                self.finish(entry.completion, Err(error)).await;
            } else {
                log::debug!(
                    "Resubmitting {} after {:?} in queue",
                    entry.request.action(),
                    entry.enqueued_at.elapsed()
                );
                self.submit(
                    entry.request,
                    entry.timeout,
                    entry.completion,
                    entry.retry_count,
                )
                .await;
            }
        }
    }

    /// Move in-flight operations back to the queue after a lost link.
    pub(crate) async fn requeue_pending(&mut self) {
        for op in self.pending.drain() {
            match requeue_or_fail(op, self.config.max_retries) {
                Ok(entry) => self.retry_queue.push(entry),
                Err((completion, error)) => self.finish(completion, Err(error)).await,
            }
        }
        if !self.retry_queue.is_empty() {
            log::info!("{} operations waiting for reconnect", self.retry_queue.len());
        }
    }

    /// Fail every pending and queued operation with the same error.
    pub(crate) async fn fail_all(&mut self, error: fn() -> SyncError) {
        for op in self.pending.drain() {
            self.finish(op.completion, Err(error())).await;
        }
        for entry in self.retry_queue.drain() {
            self.finish(entry.completion, Err(error())).await;
        }
    }

    /// Settle an operation: undo or confirm its optimistic effect, then reply.
    pub(crate) async fn finish(&mut self, completion: Completion, outcome: Outcome) {
        let Completion { reply, intent } = completion;
        if let Some(intent) = intent {
            self.settle(intent, &outcome).await;
        }
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }
}
