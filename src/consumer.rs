use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::connection::ConnectionManager;
use crate::error::{OrderMeshError, Result};
use crate::message;

/// Type alias for async event callbacks keyed in the dispatch registry
pub type EventCallback =
    Arc<dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// A delivery reduced to the parts dispatch cares about, independent of the
/// transport. The live subscription builds these from AMQP deliveries; tests
/// build them directly.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub retry_count: u32,
    pub body: Vec<u8>,
}

/// What the delivery loop should do with a message after dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; acknowledge
    Ack,
    /// Poison or out of retries; negative-acknowledge without requeue
    DeadLetter,
    /// Transient failure; re-publish with an incremented retry count
    Retry,
}

/// Subscribes to a queue and dispatches deliveries to registered callbacks.
///
/// Callbacks are looked up by correlation ID first (one-shot, removed after a
/// successful invocation) and then by the delivery's routing key (long-lived
/// handler registrations). Retry counting is enforced here: broker redelivery
/// does not increment a custom header, so retried messages are re-published
/// with `retry-count + 1` and the original acknowledged. Once the count
/// reaches the ceiling the delivery dead-letters.
pub struct EventConsumer {
    connection: Arc<ConnectionManager>,
    policy: RetryPolicy,
    callbacks: tokio::sync::RwLock<HashMap<String, EventCallback>>,
    stopped: Arc<AtomicBool>,
    consumer_tag: tokio::sync::Mutex<Option<String>>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(connection: Arc<ConnectionManager>, policy: RetryPolicy) -> Self {
        Self {
            connection,
            policy,
            callbacks: tokio::sync::RwLock::new(HashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            consumer_tag: tokio::sync::Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a callback under a correlation ID or routing key.
    /// Registering an existing key overwrites.
    pub async fn register_callback(&self, key: impl Into<String>, callback: EventCallback) {
        let key = key.into();
        debug!(key = %key, "registering callback");
        self.callbacks.write().await.insert(key, callback);
    }

    /// Register a function-based callback
    pub async fn register_fn<F, Fut>(&self, key: impl Into<String>, callback: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_callback(key, Arc::new(move |value| Box::pin(callback(value))))
            .await;
    }

    /// Remove a callback; unregistering a missing key is a no-op
    pub async fn unregister_callback(&self, key: &str) {
        if self.callbacks.write().await.remove(key).is_some() {
            debug!(key = %key, "unregistered callback");
        }
    }

    /// Number of registered callbacks
    pub async fn callback_count(&self) -> usize {
        self.callbacks.read().await.len()
    }

    /// Decide what to do with a message and run its callback.
    ///
    /// This is the whole of the per-delivery policy: parse, enforce the retry
    /// ceiling, look up a callback, classify the outcome. It touches no
    /// transport, so the delivery loop and the tests share it.
    pub async fn dispatch(&self, msg: InboundMessage) -> Disposition {
        let payload: serde_json::Value = match serde_json::from_slice(&msg.body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, routing_key = %msg.routing_key, "unparseable payload, dead-lettering");
                return Disposition::DeadLetter;
            }
        };

        if msg.retry_count >= self.policy.max_retries {
            warn!(
                retry_count = msg.retry_count,
                routing_key = %msg.routing_key,
                "retry ceiling reached, dead-lettering"
            );
            return Disposition::DeadLetter;
        }

        if let Some(correlation_id) = &msg.correlation_id {
            let callback = self.callbacks.read().await.get(correlation_id).cloned();
            if let Some(callback) = callback {
                return match callback(payload).await {
                    Ok(()) => {
                        // Correlation-keyed callbacks are one-shot
                        self.callbacks.write().await.remove(correlation_id);
                        Disposition::Ack
                    }
                    Err(e) => self.classify_failure(e, &msg),
                };
            }
        }

        let callback = self.callbacks.read().await.get(&msg.routing_key).cloned();
        match callback {
            Some(callback) => match callback(payload).await {
                Ok(()) => Disposition::Ack,
                Err(e) => self.classify_failure(e, &msg),
            },
            None => {
                let err = OrderMeshError::CallbackNotFound {
                    key: msg
                        .correlation_id
                        .clone()
                        .unwrap_or_else(|| msg.routing_key.clone()),
                };
                warn!(error = %err, retry_count = msg.retry_count, "requeueing");
                Disposition::Retry
            }
        }
    }

    fn classify_failure(&self, error: OrderMeshError, msg: &InboundMessage) -> Disposition {
        match error {
            OrderMeshError::InvalidMessage { .. } => {
                warn!(error = %error, routing_key = %msg.routing_key, "schema mismatch, dead-lettering");
                Disposition::DeadLetter
            }
            _ => {
                warn!(error = %error, retry_count = msg.retry_count, "callback failed, requeueing");
                Disposition::Retry
            }
        }
    }

    /// Start the long-lived subscription on `queue_name`.
    ///
    /// The spawned loop survives connection loss: when the delivery stream
    /// ends and the manager is not shutting down, it waits for the
    /// reconnect notification and resubscribes.
    pub async fn initialize(self: Arc<Self>, queue_name: &str) -> Result<()> {
        let tag = format!("{}-{}", queue_name, Uuid::new_v4());
        *self.consumer_tag.lock().await = Some(tag.clone());

        let consumer = Arc::clone(&self);
        let connection = self.connection.clone();
        let stopped = self.stopped.clone();
        let queue = queue_name.to_string();

        let handle = tokio::spawn(async move {
            let mut reconnects = connection.subscribe_reconnects();

            loop {
                let channel = match connection.channel().await {
                    Ok(channel) => channel,
                    Err(e) => {
                        error!(error = %e, queue = %queue, "no channel for consumer");
                        break;
                    }
                };

                let mut stream = match channel
                    .basic_consume(
                        &queue,
                        &tag,
                        BasicConsumeOptions {
                            no_ack: false,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(error = %e, queue = %queue, "failed to start consumer");
                        if stopped.load(Ordering::SeqCst)
                            || connection.is_closing()
                            || reconnects.changed().await.is_err()
                        {
                            break;
                        }
                        continue;
                    }
                };
                info!(queue = %queue, "consumer started");

                while let Some(delivery) = stream.next().await {
                    match delivery {
                        Ok(delivery) => {
                            if let Err(e) =
                                consumer.handle_delivery(&channel, &queue, delivery).await
                            {
                                error!(error = %e, queue = %queue, "delivery handling failed");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, queue = %queue, "consumer stream error");
                            break;
                        }
                    }
                }

                if stopped.load(Ordering::SeqCst) || connection.is_closing() {
                    break;
                }
                warn!(queue = %queue, "delivery stream ended, waiting for reconnect");
                if reconnects.changed().await.is_err() {
                    break;
                }
            }

            info!(queue = %queue, "consumer stopped");
        });

        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    /// Apply the dispatch decision to a live delivery
    async fn handle_delivery(
        &self,
        channel: &Channel,
        queue: &str,
        delivery: Delivery,
    ) -> Result<()> {
        let msg = InboundMessage {
            routing_key: delivery.routing_key.to_string(),
            correlation_id: message::correlation_id(&delivery.properties),
            retry_count: message::retry_count(&delivery.properties),
            body: delivery.data.clone(),
        };
        let retry_count = msg.retry_count;
        let correlation_id = msg.correlation_id.clone();

        match self.dispatch(msg).await {
            Disposition::Ack => {
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Disposition::DeadLetter => {
                delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await?;
            }
            Disposition::Retry => {
                let next = retry_count + 1;
                if next >= self.policy.max_retries {
                    warn!(queue = %queue, retry_count = next, "retry budget spent, dead-lettering");
                    delivery
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: false,
                        })
                        .await?;
                } else {
                    // Redeliver through the default exchange with the header
                    // bumped; the original is acknowledged so the broker does
                    // not hand back the stale count.
                    let properties =
                        message::transport_properties(correlation_id.as_deref(), next);
                    channel
                        .basic_publish(
                            "",
                            queue,
                            BasicPublishOptions::default(),
                            &delivery.data,
                            properties,
                        )
                        .await?
                        .await?;
                    delivery.ack(BasicAckOptions::default()).await?;
                    debug!(queue = %queue, retry_count = next, "requeued with incremented retry count");
                }
            }
        }

        Ok(())
    }

    /// Stop consuming: cancel the subscription and let the in-flight handler
    /// finish. Close the channel/connection afterwards, not before.
    pub async fn shutdown(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);

        let tag = self.consumer_tag.lock().await.take();
        if let Some(tag) = tag {
            if let Ok(channel) = self.connection.channel().await {
                if let Err(e) = channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await
                {
                    warn!(error = %e, "error cancelling consumer");
                }
            }
        }

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("policy", &self.policy)
            .finish()
    }
}
