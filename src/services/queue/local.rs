//! In-process queue used when Redis is not configured.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Consumer, HandlerError, MessageHandler, Producer, QueueError};
use crate::models::job::QueueMessage;

/// Bounded channel queue with the same retry semantics as the durable
/// backend: failed deliveries are re-published with an incremented attempt
/// counter and land in an in-memory DLQ once attempts are exhausted.
pub struct LocalQueue {
    sender: mpsc::Sender<QueueMessage>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<QueueMessage>>,
    max_attempts: i32,
    dlq: Mutex<Vec<QueueMessage>>,
}

impl LocalQueue {
    pub fn new(buffer_size: usize, max_attempts: i32) -> Self {
        let buffer_size = if buffer_size == 0 { 512 } else { buffer_size };
        let max_attempts = if max_attempts <= 0 { 3 } else { max_attempts };
        let (sender, receiver) = mpsc::channel(buffer_size);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            max_attempts,
            dlq: Mutex::new(Vec::new()),
        }
    }

    pub fn dlq_size(&self) -> usize {
        self.dlq.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn dlq_messages(&self) -> Vec<QueueMessage> {
        self.dlq.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn push_dlq(&self, message: QueueMessage) {
        self.dlq.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(message);
    }
}

#[async_trait]
impl Producer for LocalQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| QueueError::Backend("local queue is closed".into()))
    }

    async fn enqueue_batch(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        for message in messages {
            self.enqueue(message).await?;
        }
        Ok(())
    }

    fn supports_batching(&self) -> bool {
        true
    }
}

#[async_trait]
impl Consumer for LocalQueue {
    async fn consume(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        let mut receiver = self.receiver.lock().await;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = receiver.recv() => match received {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };

            let result: Result<(), HandlerError> = handler.handle(message.clone()).await;
            let Err(err) = result else { continue };

            let mut retry = message;
            retry.attempt += 1;
            if retry.attempt >= self.max_attempts {
                tracing::warn!(
                    job_id = %retry.job_id,
                    attempt = retry.attempt,
                    error = %err,
                    "local queue moved message to DLQ"
                );
                self.push_dlq(retry);
                continue;
            }

            let delay = Duration::from_millis(retry.attempt as u64 * 500);
            let sender = self.sender.clone();
            let retry_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = retry_cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let _ = sender.send(retry).await;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::models::job::JobKind;

    fn message(job_id: &str) -> QueueMessage {
        QueueMessage {
            job_id: job_id.to_string(),
            kind: JobKind::Summary,
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            payload: b"{}".to_vec(),
            attempt: 0,
            requested_at: Utc::now(),
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: QueueMessage) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError("forced failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn successful_messages_are_delivered_once() {
        let queue = Arc::new(LocalQueue::new(8, 3));
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail: false });

        queue.enqueue(message("job-1")).await.unwrap();

        let cancel = CancellationToken::new();
        let consumer = queue.clone();
        let consume_handler = handler.clone();
        let consume_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            consumer.consume(consume_cancel, consume_handler).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dlq_size(), 0);
    }

    #[tokio::test]
    async fn failing_messages_retry_then_land_in_dlq() {
        let queue = Arc::new(LocalQueue::new(8, 3));
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail: true });

        queue.enqueue(message("job-dlq")).await.unwrap();

        let cancel = CancellationToken::new();
        let consumer = queue.clone();
        let consume_handler = handler.clone();
        let consume_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            consumer.consume(consume_cancel, consume_handler).await
        });

        // Attempts at 0ms, +500ms, +1000ms; allow slack for scheduling.
        tokio::time::sleep(Duration::from_millis(2200)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.dlq_size(), 1);
        let dead = queue.dlq_messages();
        assert_eq!(dead[0].job_id, "job-dlq");
        assert_eq!(dead[0].attempt, 3);
    }
}
