//! Batching producer behavior under backpressure and burst coalescing.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use wa_copilot::models::job::{JobKind, QueueMessage};
use wa_copilot::services::queue::{
    BatchingConfig, BatchingProducer, Producer, QueueError,
};

fn message(id: &str) -> QueueMessage {
    QueueMessage {
        job_id: id.to_string(),
        kind: JobKind::Summary,
        tenant_id: "tenant-1".into(),
        conversation_id: "conv-1".into(),
        payload: b"{}".to_vec(),
        attempt: 0,
        requested_at: Utc::now(),
    }
}

/// Base producer that blocks every enqueue until a permit is released.
struct BlockingProducer {
    gate: Arc<Semaphore>,
    seen: Mutex<Vec<String>>,
}

impl BlockingProducer {
    fn new() -> Self {
        Self { gate: Arc::new(Semaphore::new(0)), seen: Mutex::new(Vec::new()) }
    }

    fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl Producer for BlockingProducer {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        let permit = self.gate.acquire().await.map_err(|_| QueueError::Closed)?;
        permit.forget();
        self.seen.lock().unwrap().push(message.job_id);
        Ok(())
    }
}

#[tokio::test]
async fn backpressure_rejects_when_inbox_and_flight_are_saturated() {
    let base = Arc::new(BlockingProducer::new());
    let producer = Arc::new(BatchingProducer::new(
        CancellationToken::new(),
        base.clone(),
        BatchingConfig {
            max_batch_size: 1,
            flush_interval: Duration::from_millis(10),
            flush_timeout: Duration::from_secs(10),
            queue_capacity: 1,
            max_in_flight_batches: 1,
        },
    ));

    // First enqueue: drained by the dispatcher and flushed into the
    // blocked base, which pins the dispatcher.
    let first_producer = producer.clone();
    let first = tokio::spawn(async move { first_producer.enqueue(message("first")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second enqueue: accepted into the inbox while the dispatcher is busy.
    let second_producer = producer.clone();
    let second = tokio::spawn(async move { second_producer.enqueue(message("second")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Third enqueue: the inbox is full, so it bounces immediately.
    let started = tokio::time::Instant::now();
    let third = producer.enqueue(message("third")).await;
    assert!(started.elapsed() < Duration::from_millis(100), "backpressure must not block");
    assert!(matches!(third, Err(QueueError::Backpressure)), "got: {third:?}");

    // Unblocking the base lets the first and second complete cleanly.
    base.release(2);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let seen = base.seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);

    producer.close().await;
}

#[tokio::test]
async fn every_accepted_enqueue_gets_exactly_one_result() {
    let base = Arc::new(BlockingProducer::new());
    base.release(64);

    let producer = Arc::new(BatchingProducer::new(
        CancellationToken::new(),
        base.clone(),
        BatchingConfig {
            max_batch_size: 8,
            flush_interval: Duration::from_millis(5),
            ..BatchingConfig::default()
        },
    ));

    let mut handles = Vec::new();
    for index in 0..20 {
        let task_producer = producer.clone();
        handles.push(tokio::spawn(async move {
            task_producer.enqueue(message(&format!("burst-{index}"))).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(base.seen.lock().unwrap().len(), 20);

    producer.close().await;
}

#[tokio::test]
async fn flush_timeout_bounds_waiting_on_a_stuck_base() {
    let base = Arc::new(BlockingProducer::new());
    let producer = Arc::new(BatchingProducer::new(
        CancellationToken::new(),
        base,
        BatchingConfig {
            flush_interval: Duration::from_millis(5),
            flush_timeout: Duration::from_millis(200),
            ..BatchingConfig::default()
        },
    ));

    let started = tokio::time::Instant::now();
    let result = producer.enqueue(message("stuck")).await;
    assert!(matches!(result, Err(QueueError::FlushTimeout)), "got: {result:?}");
    assert!(started.elapsed() >= Duration::from_millis(190));
    assert!(started.elapsed() < Duration::from_secs(2));
}
