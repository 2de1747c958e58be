use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Topology;
use crate::consumer::EventConsumer;
use crate::error::{OrderMeshError, Result};
use crate::message::{StockCheckReply, StockCheckRequest};
use crate::producer::EventPublisher;
use crate::repository::ProductRepository;

/// Responder side of the stock-check saga.
///
/// Validates a request against current stock and decrements it, replying
/// success or error under the request's correlation ID. The check-and-
/// decrement runs under a per-product lock: two concurrent requests against
/// the same product cannot both pass the stock check on the same snapshot.
/// Replies are cached per correlation ID so a redelivered request replays its
/// original outcome instead of decrementing twice.
pub struct ReservationHandler {
    products: Arc<dyn ProductRepository>,
    publisher: Arc<dyn EventPublisher>,
    topology: Topology,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    settled: Mutex<HashMap<String, StockCheckReply>>,
}

impl ReservationHandler {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        publisher: Arc<dyn EventPublisher>,
        topology: Topology,
    ) -> Self {
        Self {
            products,
            publisher,
            topology,
            locks: Mutex::new(HashMap::new()),
            settled: Mutex::new(HashMap::new()),
        }
    }

    /// Register on the stock-check routing key; the consumer dispatches every
    /// request on the queue to this handler
    pub async fn register(self: Arc<Self>, consumer: &EventConsumer) {
        let handler = self.clone();
        consumer
            .register_fn(self.topology.stock_check_key.clone(), move |payload| {
                let handler = handler.clone();
                async move {
                    let request: StockCheckRequest = serde_json::from_value(payload)
                        .map_err(|e| {
                            OrderMeshError::invalid_message(format!("stock-check request: {e}"))
                        })?;

                    let reply = handler.handle(&request).await;
                    let body = serde_json::to_vec(&reply)?;
                    handler
                        .publisher
                        .publish(
                            &handler.topology.product_exchange,
                            &handler.topology.stock_check_reply_key,
                            &body,
                            Some(&request.correlation_id),
                        )
                        .await
                }
            })
            .await;
    }

    /// Produce the reply for a request; never fails, every outcome is a reply
    pub async fn handle(&self, request: &StockCheckRequest) -> StockCheckReply {
        if let Some(previous) = self
            .settled
            .lock()
            .await
            .get(&request.correlation_id)
            .cloned()
        {
            debug!(
                correlation_id = %request.correlation_id,
                "duplicate stock-check request, replaying reply"
            );
            return previous;
        }

        let reply = match self.reserve(request).await {
            Ok(total) => {
                info!(
                    product_id = %request.product_id,
                    quantity = request.quantity,
                    total,
                    "stock reserved"
                );
                StockCheckReply::success(request, total)
            }
            Err(e) => {
                warn!(
                    product_id = %request.product_id,
                    quantity = request.quantity,
                    error = %e,
                    "stock check rejected"
                );
                StockCheckReply::error(request, e.reply_reason())
            }
        };

        self.settled
            .lock()
            .await
            .insert(request.correlation_id.clone(), reply.clone());
        reply
    }

    /// Atomic check-and-decrement for one product; returns the order total
    async fn reserve(&self, request: &StockCheckRequest) -> Result<f64> {
        let lock = self.product_lock(&request.product_id).await;
        let _guard = lock.lock().await;

        let mut product = self.products.get_by_id(&request.product_id).await?;
        if product.stock < request.quantity {
            return Err(OrderMeshError::InsufficientStock);
        }

        product.stock -= request.quantity;
        let product = self.products.update_stock(product).await?;

        Ok(f64::from(request.quantity) * product.price)
    }

    async fn product_lock(&self, product_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(product_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for ReservationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationHandler").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::message::ReplyStatus;
    use crate::model::Product;
    use crate::repository::InMemoryProductRepository;

    struct NullPublisher;

    #[async_trait]
    impl EventPublisher for NullPublisher {
        async fn publish(&self, _: &str, _: &str, _: &[u8], _: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    fn handler_with_stock(stock: u32) -> (Arc<ReservationHandler>, Arc<InMemoryProductRepository>) {
        let products =
            InMemoryProductRepository::with_products(vec![Product::new("P1", "Widget", 10.0, stock)]);
        let handler = Arc::new(ReservationHandler::new(
            products.clone(),
            Arc::new(NullPublisher),
            Topology::default(),
        ));
        (handler, products)
    }

    fn request(product_id: &str, quantity: u32, correlation_id: &str) -> StockCheckRequest {
        StockCheckRequest {
            product_id: product_id.to_string(),
            quantity,
            correlation_id: correlation_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reservation_decrements_stock_and_computes_total() {
        let (handler, products) = handler_with_stock(5);

        let reply = handler.handle(&request("P1", 2, "c-1")).await;
        assert_eq!(reply.status, ReplyStatus::Success);
        assert_eq!(reply.total, 20.0);
        assert_eq!(reply.quantity, 2);
        assert_eq!(reply.correlation_id, "c-1");
        assert_eq!(products.stock_of("P1").await, Some(3));
    }

    #[tokio::test]
    async fn test_insufficient_stock_rejects_without_mutation() {
        let (handler, products) = handler_with_stock(5);

        let reply = handler.handle(&request("P1", 10, "c-1")).await;
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.error.as_deref(), Some("Insufficient stock"));
        assert_eq!(reply.total, 0.0);
        assert_eq!(products.stock_of("P1").await, Some(5));
    }

    #[tokio::test]
    async fn test_unknown_product_rejects() {
        let (handler, _) = handler_with_stock(5);

        let reply = handler.handle(&request("missing", 1, "c-1")).await;
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.error.as_deref(), Some("Product not found"));
    }

    #[tokio::test]
    async fn test_exact_stock_drains_to_zero() {
        let (handler, products) = handler_with_stock(5);

        let reply = handler.handle(&request("P1", 5, "c-1")).await;
        assert_eq!(reply.status, ReplyStatus::Success);
        assert_eq!(products.stock_of("P1").await, Some(0));

        let reply = handler.handle(&request("P1", 1, "c-2")).await;
        assert_eq!(reply.status, ReplyStatus::Error);
    }

    #[tokio::test]
    async fn test_concurrent_requests_cannot_oversell() {
        let (handler, products) = handler_with_stock(5);

        let a = handler.clone();
        let b = handler.clone();
        let req_a = request("P1", 3, "c-a");
        let req_b = request("P1", 3, "c-b");
        let (reply_a, reply_b) = tokio::join!(a.handle(&req_a), b.handle(&req_b));

        let successes = [&reply_a, &reply_b]
            .iter()
            .filter(|r| r.status == ReplyStatus::Success)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(products.stock_of("P1").await, Some(2));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_replays_without_double_decrement() {
        let (handler, products) = handler_with_stock(5);

        let first = handler.handle(&request("P1", 2, "c-1")).await;
        let second = handler.handle(&request("P1", 2, "c-1")).await;

        assert_eq!(first.status, second.status);
        assert_eq!(first.total, second.total);
        assert_eq!(products.stock_of("P1").await, Some(3));
    }
}
