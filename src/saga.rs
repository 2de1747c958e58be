use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RetryPolicy, Topology};
use crate::consumer::EventConsumer;
use crate::error::{OrderMeshError, Result};
use crate::message::{OrderCompleted, OrderNotification, StockCheckReply, StockCheckRequest};
use crate::model::Order;
use crate::producer::EventPublisher;
use crate::repository::OrderRepository;

/// What the HTTP layer hands the saga to start an order
#[derive(Debug, Clone, Deserialize)]
pub struct OrderRequest {
    pub product_id: String,
    pub quantity: u32,
}

/// Saga instance lifecycle; `Completed`, `Cancelled` and `TimedOut` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Started,
    AwaitingReply,
    Completed,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "STARTED"),
            Self::AwaitingReply => write!(f, "AWAITING_REPLY"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Lives between saga start and (reply-received | timeout-fired); exactly one
/// of those two ends it
struct PendingTransaction {
    reply_tx: oneshot::Sender<Result<StockCheckReply>>,
    timeout: tokio::task::JoinHandle<()>,
    state: SagaState,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingTransaction>>>;

/// Requester side of the stock-check saga.
///
/// `start()` publishes a stock-check request stamped with a fresh correlation
/// ID and suspends until the reply callback or the timeout fires. Whichever
/// removes the pending entry first wins, so the deferred result resolves
/// exactly once even under duplicate delivery.
pub struct SagaCoordinator {
    orders: Arc<dyn OrderRepository>,
    publisher: Arc<dyn EventPublisher>,
    consumer: Arc<EventConsumer>,
    topology: Topology,
    policy: RetryPolicy,
    pending: PendingTable,
}

impl SagaCoordinator {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        publisher: Arc<dyn EventPublisher>,
        consumer: Arc<EventConsumer>,
        topology: Topology,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            orders,
            publisher,
            consumer,
            topology,
            policy,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one saga instance to completion.
    ///
    /// Resolves with the created order on a success reply; fails with the
    /// carried reason on an error reply, or with `Timeout` when no reply
    /// arrives within `max_retries x retry_delay`.
    pub async fn start(&self, request: OrderRequest) -> Result<Order> {
        let correlation_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        info!(
            correlation_id = %correlation_id,
            product_id = %request.product_id,
            quantity = request.quantity,
            state = %SagaState::Started,
            "saga started"
        );

        let timeout = self.spawn_timeout(&correlation_id);
        self.pending.lock().await.insert(
            correlation_id.clone(),
            PendingTransaction {
                reply_tx,
                timeout,
                state: SagaState::Started,
            },
        );
        self.register_reply_callback(&correlation_id).await;

        let check = StockCheckRequest {
            product_id: request.product_id.clone(),
            quantity: request.quantity,
            correlation_id: correlation_id.clone(),
        };
        let body = serde_json::to_vec(&check)?;
        if let Err(e) = self
            .publisher
            .publish(
                &self.topology.product_exchange,
                &self.topology.stock_check_key,
                &body,
                Some(&correlation_id),
            )
            .await
        {
            // No dangling timer: tear the entry down before surfacing the error
            if let Some(entry) = self.pending.lock().await.remove(&correlation_id) {
                entry.timeout.abort();
            }
            self.consumer.unregister_callback(&correlation_id).await;
            warn!(correlation_id = %correlation_id, error = %e, "stock check publish failed");
            return Err(e);
        }

        if let Some(entry) = self.pending.lock().await.get_mut(&correlation_id) {
            entry.state = SagaState::AwaitingReply;
        }

        let reply = reply_rx
            .await
            .map_err(|_| OrderMeshError::internal("reply channel closed"))??;

        if reply.is_success() {
            self.finalize(&correlation_id, reply).await
        } else {
            let err = OrderMeshError::from_reply_reason(reply.error.as_deref());
            info!(
                correlation_id = %correlation_id,
                state = %SagaState::Cancelled,
                reason = %err,
                "saga cancelled"
            );
            Err(err)
        }
    }

    /// Number of live pending transactions
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// State of a live saga instance; `None` once it has settled
    pub async fn state_of(&self, correlation_id: &str) -> Option<SagaState> {
        self.pending
            .lock()
            .await
            .get(correlation_id)
            .map(|entry| entry.state)
    }

    /// Persist the order and publish the completion and notification events.
    ///
    /// The events are at-least-once concerns: a publish failure after the
    /// order exists is logged, not surfaced to the caller.
    async fn finalize(&self, correlation_id: &str, reply: StockCheckReply) -> Result<Order> {
        let order = self
            .orders
            .create(Order::completed(
                reply.product_id.clone(),
                reply.quantity,
                reply.total,
            ))
            .await?;

        let completed = OrderCompleted {
            order_id: order.id.clone(),
            product_id: order.product_id.clone(),
            total: order.total,
        };
        if let Ok(body) = serde_json::to_vec(&completed) {
            if let Err(e) = self
                .publisher
                .publish(
                    &self.topology.order_exchange,
                    &self.topology.order_completed_key,
                    &body,
                    Some(correlation_id),
                )
                .await
            {
                warn!(order_id = %order.id, error = %e, "order-completed publish failed");
            }
        }

        let notification = OrderNotification {
            order_id: order.id.clone(),
            message: "Order created".to_string(),
        };
        if let Ok(body) = serde_json::to_vec(&notification) {
            if let Err(e) = self
                .publisher
                .publish(
                    &self.topology.notification_exchange,
                    &self.topology.notification_key,
                    &body,
                    Some(correlation_id),
                )
                .await
            {
                warn!(order_id = %order.id, error = %e, "notification publish failed");
            }
        }

        info!(
            correlation_id = %correlation_id,
            order_id = %order.id,
            total = order.total,
            state = %SagaState::Completed,
            "saga completed"
        );
        Ok(order)
    }

    /// Schedule the timeout racing the reply; the loser finds the entry gone
    fn spawn_timeout(&self, correlation_id: &str) -> tokio::task::JoinHandle<()> {
        let window = self.policy.reply_timeout();
        let pending = self.pending.clone();
        let consumer = self.consumer.clone();
        let correlation_id = correlation_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let entry = pending.lock().await.remove(&correlation_id);
            if let Some(entry) = entry {
                consumer.unregister_callback(&correlation_id).await;
                warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = window.as_millis() as u64,
                    state = %SagaState::TimedOut,
                    "saga timed out"
                );
                let _ = entry.reply_tx.send(Err(OrderMeshError::Timeout {
                    timeout_ms: window.as_millis() as u64,
                }));
            }
        })
    }

    /// Route the reply with this correlation ID back into the saga.
    ///
    /// Entry removal, timeout cancellation and the one-shot callback removal
    /// all happen before the deferred result fires, so a redelivered reply
    /// cannot complete the saga twice.
    async fn register_reply_callback(&self, correlation_id: &str) {
        let pending = self.pending.clone();
        let correlation_id = correlation_id.to_string();

        self.consumer
            .register_fn(correlation_id.clone(), move |payload| {
                let pending = pending.clone();
                let correlation_id = correlation_id.clone();
                async move {
                    let reply: StockCheckReply = serde_json::from_value(payload)
                        .map_err(|e| OrderMeshError::invalid_message(format!("stock-check reply: {e}")))?;

                    let entry = pending.lock().await.remove(&correlation_id);
                    let Some(entry) = entry else {
                        debug!(correlation_id = %correlation_id, "late reply, already settled");
                        return Ok(());
                    };

                    entry.timeout.abort();
                    let _ = entry.reply_tx.send(Ok(reply));
                    Ok(())
                }
            })
            .await;
    }
}

impl std::fmt::Debug for SagaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaCoordinator")
            .field("topology", &self.topology.product_exchange)
            .field("policy", &self.policy)
            .finish()
    }
}
