use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use serde::Serialize;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::message;

/// Seam through which the saga coordinator and the reservation handler
/// publish. Object-safe so tests can substitute an in-process transport.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a serialized payload to `exchange` under `routing_key`,
    /// persistent, with `retry-count = 0` and the correlation ID stamped as
    /// message metadata.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        correlation_id: Option<&str>,
    ) -> Result<()>;
}

/// Publishes typed envelopes through the shared broker channel.
///
/// Publish failures propagate to the caller; the producer performs no retry
/// of its own. Redelivery is the consumer/broker's responsibility.
pub struct EventProducer {
    connection: Arc<ConnectionManager>,
}

impl EventProducer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Serialize `payload` as JSON and publish it
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        self.publish(exchange, routing_key, &body, correlation_id)
            .await
    }
}

#[async_trait]
impl EventPublisher for EventProducer {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let channel = self.connection.channel().await?;
        let properties = message::transport_properties(correlation_id, 0);

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        debug!(exchange, routing_key, "published message");
        Ok(())
    }
}

impl std::fmt::Debug for EventProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducer").finish()
    }
}
