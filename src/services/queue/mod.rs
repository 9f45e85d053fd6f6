//! Queue capabilities: durable at-least-once delivery with a dead-letter
//! path. Two interchangeable backends (Redis Streams and in-process) plus a
//! batching producer wrapper.

pub mod batching;
pub mod local;
pub mod streams;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::job::QueueMessage;

pub use batching::{BatchingConfig, BatchingProducer};
pub use local::LocalQueue;
pub use streams::{StreamsConfig, StreamsQueue};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backpressure: enqueue buffer is full")]
    Backpressure,

    #[error("batching producer is closed")]
    Closed,

    #[error("flush timed out waiting for in-flight capacity")]
    FlushTimeout,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome a handler reports for one delivered message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Sends async jobs to a queue backend.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Backends with a cheaper bulk path override this.
    async fn enqueue_batch(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        for message in messages {
            self.enqueue(message).await?;
        }
        Ok(())
    }

    /// Whether `enqueue_batch` is a genuine bulk operation.
    fn supports_batching(&self) -> bool {
        false
    }
}

/// Receives async jobs and runs the handler for each, enforcing the
/// retry/DLQ policy of the backend.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(
        &self,
        cancel: CancellationToken,
        handler: std::sync::Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<(), HandlerError>;
}
