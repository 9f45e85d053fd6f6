//! Batching producer: coalesces bursts of enqueues and applies bounded
//! buffering with backpressure.
//!
//! A single dispatcher task accumulates pending requests, flushing when the
//! batch fills or the flush timer fires. Within one coalesce key
//! (tenant|conversation|kind) requests are dispatched in `requested_at`
//! order; across keys ordering is unspecified.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Producer, QueueError};
use crate::models::job::QueueMessage;

#[derive(Debug, Clone, Copy)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub flush_timeout: Duration,
    pub queue_capacity: usize,
    pub max_in_flight_batches: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            flush_interval: Duration::from_millis(25),
            flush_timeout: Duration::from_secs(3),
            queue_capacity: 2048,
            max_in_flight_batches: 4,
        }
    }
}

impl BatchingConfig {
    fn normalized(mut self) -> Self {
        if self.max_batch_size == 0 {
            self.max_batch_size = 32;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = Duration::from_millis(25);
        }
        if self.flush_timeout.is_zero() {
            self.flush_timeout = Duration::from_secs(3);
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = 2048;
        }
        if self.max_in_flight_batches == 0 {
            self.max_in_flight_batches = 4;
        }
        self
    }
}

struct EnqueueRequest {
    message: QueueMessage,
    result: oneshot::Sender<Result<(), QueueError>>,
}

pub struct BatchingProducer {
    inbox: mpsc::Sender<EnqueueRequest>,
    shutdown: CancellationToken,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchingProducer {
    pub fn new(parent: CancellationToken, base: Arc<dyn Producer>, config: BatchingConfig) -> Self {
        let config = config.normalized();
        let (inbox, receiver) = mpsc::channel(config.queue_capacity);
        let shutdown = parent.child_token();

        let dispatcher = tokio::spawn(run_dispatcher(
            base,
            receiver,
            shutdown.clone(),
            config,
            Arc::new(Semaphore::new(config.max_in_flight_batches)),
        ));

        Self {
            inbox,
            shutdown,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        }
    }

    /// Flushes the final batch and waits for the dispatcher to exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait::async_trait]
impl Producer for BatchingProducer {
    /// Submits to the bounded inbox without blocking; a full inbox yields
    /// [`QueueError::Backpressure`] immediately.
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let request = EnqueueRequest { message, result: result_tx };

        match self.inbox.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(QueueError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(QueueError::Closed),
        }

        match result_rx.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Closed),
        }
    }
}

async fn run_dispatcher(
    base: Arc<dyn Producer>,
    mut receiver: mpsc::Receiver<EnqueueRequest>,
    shutdown: CancellationToken,
    config: BatchingConfig,
    semaphore: Arc<Semaphore>,
) {
    let mut pending: Vec<EnqueueRequest> = Vec::with_capacity(config.max_batch_size);
    let mut deadline: Option<Instant> = None;

    loop {
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                flush_batch(&base, &semaphore, &config, std::mem::take(&mut pending), true).await;
                return;
            }
            _ = timer => {
                deadline = None;
                flush_batch(&base, &semaphore, &config, std::mem::take(&mut pending), false).await;
            }
            request = receiver.recv() => {
                let Some(request) = request else {
                    flush_batch(&base, &semaphore, &config, std::mem::take(&mut pending), true).await;
                    return;
                };
                if request.result.is_closed() {
                    continue;
                }
                pending.push(request);
                if pending.len() == 1 {
                    deadline = Some(Instant::now() + config.flush_interval);
                }
                if pending.len() >= config.max_batch_size {
                    deadline = None;
                    flush_batch(&base, &semaphore, &config, std::mem::take(&mut pending), false).await;
                }
            }
        }
    }
}

async fn flush_batch(
    base: &Arc<dyn Producer>,
    semaphore: &Arc<Semaphore>,
    config: &BatchingConfig,
    batch: Vec<EnqueueRequest>,
    is_final: bool,
) {
    // Callers that gave up waiting are skipped before dispatch.
    let mut active: Vec<EnqueueRequest> =
        batch.into_iter().filter(|request| !request.result.is_closed()).collect();
    if active.is_empty() {
        return;
    }

    active.sort_by(|a, b| {
        a.message
            .coalesce_key()
            .cmp(&b.message.coalesce_key())
            .then_with(|| a.message.requested_at.cmp(&b.message.requested_at))
    });

    let messages: Vec<QueueMessage> =
        active.iter().map(|request| request.message.clone()).collect();

    let outcome = if is_final {
        dispatch(base, semaphore, messages).await
    } else {
        match tokio::time::timeout(config.flush_timeout, dispatch(base, semaphore, messages)).await
        {
            Ok(result) => result,
            Err(_) => Err(QueueError::FlushTimeout),
        }
    };

    match outcome {
        Ok(()) => {
            for request in active {
                let _ = request.result.send(Ok(()));
            }
        }
        Err(err) => {
            for request in active {
                let _ = request.result.send(Err(replicate_error(&err)));
            }
        }
    }
}

async fn dispatch(
    base: &Arc<dyn Producer>,
    semaphore: &Arc<Semaphore>,
    messages: Vec<QueueMessage>,
) -> Result<(), QueueError> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| QueueError::Closed)?;

    if base.supports_batching() {
        base.enqueue_batch(messages).await
    } else {
        for message in messages {
            base.enqueue(message).await?;
        }
        Ok(())
    }
}

/// Every surviving request in a batch observes the same failure.
fn replicate_error(err: &QueueError) -> QueueError {
    match err {
        QueueError::Backpressure => QueueError::Backpressure,
        QueueError::Closed => QueueError::Closed,
        QueueError::FlushTimeout => QueueError::FlushTimeout,
        other => QueueError::Backend(other.to_string()),
    }
}
