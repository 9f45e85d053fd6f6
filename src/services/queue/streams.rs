//! Redis Streams queue backend.
//!
//! Messages are appended to a main stream and consumed through a consumer
//! group. Failed deliveries are re-published with an incremented attempt
//! counter; messages that exhaust their attempts (and entries that fail to
//! parse) are diverted to a dead-letter stream. Entries are never mutated
//! in place: requeue and DLQ divert are both publishes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use super::{Consumer, MessageHandler, Producer, QueueError};
use crate::models::job::{JobKind, QueueMessage};

const READ_BLOCK_MS: usize = 5000;
const READ_COUNT: usize = 10;

#[derive(Debug, Clone)]
pub struct StreamsConfig {
    pub url: String,
    pub stream: String,
    pub dlq_stream: String,
    pub group: String,
    pub consumer: String,
    pub max_attempts: i32,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream: "wa_jobs".to_string(),
            dlq_stream: "wa_jobs_dlq".to_string(),
            group: "wa_workers".to_string(),
            consumer: "api-1".to_string(),
            max_attempts: 3,
        }
    }
}

pub struct StreamsQueue {
    client: redis::Client,
    stream: String,
    dlq_stream: String,
    group: String,
    consumer: String,
    max_attempts: i32,
}

impl StreamsQueue {
    pub async fn connect(mut config: StreamsConfig) -> Result<Self, QueueError> {
        if config.url.trim().is_empty() {
            return Err(QueueError::Backend("redis url is required".into()));
        }
        if config.stream.is_empty() {
            config.stream = "wa_jobs".to_string();
        }
        if config.dlq_stream.is_empty() {
            config.dlq_stream = "wa_jobs_dlq".to_string();
        }
        if config.group.is_empty() {
            config.group = "wa_workers".to_string();
        }
        if config.consumer.is_empty() {
            config.consumer = "api-1".to_string();
        }
        if config.max_attempts <= 0 {
            config.max_attempts = 3;
        }

        let client = redis::Client::open(config.url.as_str())?;
        let mut connection = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut connection).await?;

        let queue = Self {
            client,
            stream: config.stream,
            dlq_stream: config.dlq_stream,
            group: config.group,
            consumer: config.consumer,
            max_attempts: config.max_attempts,
        };
        queue.ensure_group(&mut connection).await?;
        Ok(queue)
    }

    /// Consumer groups are created lazily; an existing group is fine.
    async fn ensure_group(
        &self,
        connection: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let created: Result<String, redis::RedisError> = connection
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn message_fields(message: &QueueMessage) -> Vec<(&'static str, String)> {
        vec![
            ("job_id", message.job_id.clone()),
            ("kind", message.kind.as_str().to_string()),
            ("tenant_id", message.tenant_id.clone()),
            ("conversation_id", message.conversation_id.clone()),
            ("payload", String::from_utf8_lossy(&message.payload).into_owned()),
            ("attempt", message.attempt.to_string()),
            (
                "requested_at",
                message.requested_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ),
        ]
    }

    async fn ack_and_delete(
        &self,
        connection: &mut redis::aio::MultiplexedConnection,
        stream_id: &str,
    ) -> Result<(), QueueError> {
        let _: i64 = connection.xack(&self.stream, &self.group, &[stream_id]).await?;
        let _: i64 = connection.xdel(&self.stream, &[stream_id]).await?;
        Ok(())
    }

    async fn send_to_dlq(
        &self,
        connection: &mut redis::aio::MultiplexedConnection,
        message: Option<&QueueMessage>,
        stream_id: &str,
        error_message: &str,
    ) -> Result<(), QueueError> {
        let mut fields = vec![("stream_id", stream_id.to_string())];
        if let Some(message) = message {
            fields.extend(Self::message_fields(message));
        }
        fields.push(("error", error_message.to_string()));
        fields.push(("moved_at", Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)));

        let _: String = connection.xadd(&self.dlq_stream, "*", &fields).await?;
        Ok(())
    }
}

#[async_trait]
impl Producer for StreamsQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let fields = Self::message_fields(&message);
        let _: String = connection.xadd(&self.stream, "*", &fields).await?;
        Ok(())
    }

    async fn enqueue_batch(&self, messages: Vec<QueueMessage>) -> Result<(), QueueError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let mut pipeline = redis::pipe();
        for message in &messages {
            pipeline.cmd("XADD").arg(&self.stream).arg("*");
            for (field, value) in Self::message_fields(message) {
                pipeline.arg(field).arg(value);
            }
            pipeline.ignore();
        }
        pipeline.query_async::<()>(&mut connection).await?;
        Ok(())
    }

    fn supports_batching(&self) -> bool {
        true
    }
}

#[async_trait]
impl Consumer for StreamsQueue {
    async fn consume(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        self.ensure_group(&mut connection).await?;

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_COUNT)
            .block(READ_BLOCK_MS);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let stream_keys = [&self.stream];
            let reply: Option<StreamReadReply> = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = connection.xread_options::<_, _, Option<StreamReadReply>>(
                    &stream_keys,
                    &[">"],
                    &options,
                ) => read?,
            };

            let Some(reply) = reply else { continue };

            for key in reply.keys {
                for item in key.ids {
                    let message = match parse_stream_message(&item) {
                        Ok(message) => message,
                        Err(parse_err) => {
                            if let Err(err) = self
                                .send_to_dlq(&mut connection, None, &item.id, &parse_err)
                                .await
                            {
                                tracing::error!(error = %err, "failed to divert unparseable entry to DLQ");
                            }
                            if let Err(err) = self.ack_and_delete(&mut connection, &item.id).await {
                                tracing::error!(error = %err, "failed to ack unparseable entry");
                            }
                            continue;
                        }
                    };

                    match handler.handle(message.clone()).await {
                        Ok(()) => {
                            if let Err(err) = self.ack_and_delete(&mut connection, &item.id).await {
                                tracing::error!(error = %err, "failed to ack processed entry");
                            }
                        }
                        Err(handle_err) => {
                            let mut retry = message;
                            retry.attempt += 1;
                            if retry.attempt >= self.max_attempts {
                                if let Err(err) = self
                                    .send_to_dlq(
                                        &mut connection,
                                        Some(&retry),
                                        &item.id,
                                        &handle_err.to_string(),
                                    )
                                    .await
                                {
                                    tracing::error!(error = %err, "failed to divert message to DLQ");
                                }
                            } else if let Err(requeue_err) = self.enqueue(retry.clone()).await {
                                let reason = format!("requeue failed: {requeue_err}");
                                if let Err(err) = self
                                    .send_to_dlq(&mut connection, Some(&retry), &item.id, &reason)
                                    .await
                                {
                                    tracing::error!(error = %err, "failed to divert message to DLQ");
                                }
                            }
                            if let Err(err) = self.ack_and_delete(&mut connection, &item.id).await {
                                tracing::error!(error = %err, "failed to ack failed entry");
                            }
                        }
                    }
                }
            }
        }
    }
}

fn parse_stream_message(item: &StreamId) -> Result<QueueMessage, String> {
    let get_string = |key: &str| -> Result<String, String> {
        let value = item.map.get(key).ok_or_else(|| format!("missing field {key}"))?;
        redis::from_redis_value::<String>(value).map_err(|err| format!("invalid field {key}: {err}"))
    };

    let payload = get_string("payload")?;
    let attempt: i32 = get_string("attempt")?
        .parse()
        .map_err(|err| format!("invalid attempt: {err}"))?;
    let requested_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&get_string("requested_at")?)
        .map_err(|err| format!("invalid requested_at: {err}"))?
        .with_timezone(&Utc);

    let kind_value = get_string("kind")?;
    let kind = JobKind::parse(&kind_value).ok_or_else(|| format!("invalid kind: {kind_value}"))?;

    Ok(QueueMessage {
        job_id: get_string("job_id")?,
        kind,
        tenant_id: get_string("tenant_id")?,
        conversation_id: get_string("conversation_id")?,
        payload: payload.into_bytes(),
        attempt,
        requested_at,
    })
}
