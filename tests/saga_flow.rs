//! End-to-end saga flow with both sides wired through an in-process
//! transport: the coordinator publishes a stock-check request, the
//! reservation handler consumes it and replies, and the coordinator
//! finalizes the order, with no live broker involved.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use ordermesh::repository::{InMemoryOrderRepository, InMemoryProductRepository};
use ordermesh::{
    ConnectionManager, Disposition, EventConsumer, EventPublisher, InboundMessage, OrderMeshError,
    OrderRequest, OrderStatus, Product, ReservationHandler, Result, RetryPolicy, SagaCoordinator,
    Topology,
};

#[derive(Debug, Clone)]
struct Published {
    routing_key: String,
    body: Vec<u8>,
    correlation_id: Option<String>,
}

/// Publisher that feeds every message into the routing pump
struct LoopbackBroker {
    tx: mpsc::UnboundedSender<Published>,
}

#[async_trait]
impl EventPublisher for LoopbackBroker {
    async fn publish(
        &self,
        _exchange: &str,
        routing_key: &str,
        payload: &[u8],
        correlation_id: Option<&str>,
    ) -> Result<()> {
        self.tx
            .send(Published {
                routing_key: routing_key.to_string(),
                body: payload.to_vec(),
                correlation_id: correlation_id.map(String::from),
            })
            .map_err(|_| OrderMeshError::internal("loopback closed"))
    }
}

struct Loopback {
    saga: Arc<SagaCoordinator>,
    orders: Arc<InMemoryOrderRepository>,
    products: Arc<InMemoryProductRepository>,
    events: Arc<Mutex<Vec<Published>>>,
}

/// Wire both saga sides over a loopback channel and start the routing pump.
/// When `deliver_requests` is false the pump drops stock-check requests, so
/// no reply ever arrives and the coordinator times out.
fn wire(products: Vec<Product>, policy: RetryPolicy, deliver_requests: bool) -> Loopback {
    let topology = Topology::default();
    let (tx, mut rx) = mpsc::unbounded_channel::<Published>();
    let broker = Arc::new(LoopbackBroker { tx });

    let orders = Arc::new(InMemoryOrderRepository::new());
    let order_consumer = Arc::new(EventConsumer::new(
        Arc::new(ConnectionManager::new("amqp://localhost:5672")),
        policy.clone(),
    ));
    let saga = Arc::new(SagaCoordinator::new(
        orders.clone(),
        broker.clone(),
        order_consumer.clone(),
        topology.clone(),
        policy.clone(),
    ));

    let product_repo = InMemoryProductRepository::with_products(products);
    let product_consumer = Arc::new(EventConsumer::new(
        Arc::new(ConnectionManager::new("amqp://localhost:5672")),
        policy,
    ));
    let handler = Arc::new(ReservationHandler::new(
        product_repo.clone(),
        broker,
        topology.clone(),
    ));

    let events = Arc::new(Mutex::new(Vec::new()));

    let pump_events = events.clone();
    let pump_handler = handler.clone();
    let pump_order_consumer = order_consumer.clone();
    let pump_product_consumer = product_consumer.clone();
    tokio::spawn(async move {
        pump_handler.clone().register(&pump_product_consumer).await;

        while let Some(published) = rx.recv().await {
            let inbound = InboundMessage {
                routing_key: published.routing_key.clone(),
                correlation_id: published.correlation_id.clone(),
                retry_count: 0,
                body: published.body.clone(),
            };

            if published.routing_key == topology.stock_check_key {
                if deliver_requests {
                    let disposition = pump_product_consumer.dispatch(inbound).await;
                    assert_eq!(disposition, Disposition::Ack);
                }
            } else if published.routing_key == topology.stock_check_reply_key {
                pump_order_consumer.dispatch(inbound).await;
            } else {
                pump_events.lock().await.push(published);
            }
        }
    });

    Loopback {
        saga,
        orders,
        products: product_repo,
        events,
    }
}

#[tokio::test]
async fn saga_completes_order_when_stock_suffices() {
    let loopback = wire(
        vec![Product::new("P1", "Widget", 10.0, 5)],
        RetryPolicy::default(),
        true,
    );

    let order = loopback
        .saga
        .start(OrderRequest {
            product_id: "P1".to_string(),
            quantity: 2,
        })
        .await
        .unwrap();

    assert_eq!(order.product_id, "P1");
    assert_eq!(order.quantity, 2);
    assert_eq!(order.total, 20.0);
    assert_eq!(order.status, OrderStatus::Completed);

    assert_eq!(loopback.products.stock_of("P1").await, Some(3));
    assert_eq!(loopback.orders.count().await, 1);
    assert_eq!(loopback.saga.pending_count().await, 0);

    // The completion and notification events reached the outer exchanges
    for _ in 0..100 {
        if loopback.events.lock().await.len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let events = loopback.events.lock().await;
    let keys: Vec<_> = events.iter().map(|e| e.routing_key.as_str()).collect();
    assert!(keys.contains(&"order.completed"));
    assert!(keys.contains(&"order.notification"));
}

#[tokio::test]
async fn saga_rejects_when_stock_is_insufficient() {
    let loopback = wire(
        vec![Product::new("P1", "Widget", 10.0, 5)],
        RetryPolicy::default(),
        true,
    );

    let result = loopback
        .saga
        .start(OrderRequest {
            product_id: "P1".to_string(),
            quantity: 10,
        })
        .await;

    match result {
        Err(err @ OrderMeshError::InsufficientStock) => {
            assert_eq!(err.to_string(), "Insufficient stock");
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }

    assert_eq!(loopback.products.stock_of("P1").await, Some(5));
    assert_eq!(loopback.orders.count().await, 0);
    assert_eq!(loopback.saga.pending_count().await, 0);
}

#[tokio::test]
async fn saga_rejects_unknown_product() {
    let loopback = wire(vec![], RetryPolicy::default(), true);

    let result = loopback
        .saga
        .start(OrderRequest {
            product_id: "ghost".to_string(),
            quantity: 1,
        })
        .await;

    assert!(matches!(result, Err(OrderMeshError::ProductNotFound)));
    assert_eq!(loopback.orders.count().await, 0);
}

#[tokio::test]
async fn saga_times_out_when_no_reply_arrives() {
    let loopback = wire(
        vec![Product::new("P1", "Widget", 10.0, 5)],
        RetryPolicy {
            max_retries: 3,
            retry_delay_ms: 10,
        },
        false,
    );

    let result = loopback
        .saga
        .start(OrderRequest {
            product_id: "P1".to_string(),
            quantity: 2,
        })
        .await;

    assert!(matches!(result, Err(OrderMeshError::Timeout { .. })));
    assert_eq!(loopback.saga.pending_count().await, 0);
    assert_eq!(loopback.products.stock_of("P1").await, Some(5));
    assert_eq!(loopback.orders.count().await, 0);
}
