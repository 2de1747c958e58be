//! # OrderMesh - Order-Fulfillment Saga over RabbitMQ
//!
//! OrderMesh coordinates an order-fulfillment transaction across independently
//! deployed services that communicate only through a durable message broker.
//! The order side asks the product side to reserve stock; the product side
//! atomically adjusts inventory and replies; the order side finalizes or
//! cancels based on the reply or a timeout. Replies are matched to requests
//! with correlation IDs, so a single queue pair emulates RPC over pub/sub.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ordermesh::{OrderRequest, OrderSagaService, Settings};
//! use ordermesh::repository::InMemoryOrderRepository;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::new()?;
//!     let orders = Arc::new(InMemoryOrderRepository::new());
//!
//!     let service = OrderSagaService::new(&settings, orders);
//!     service.start().await?;
//!
//!     let order = service.saga().start(OrderRequest {
//!         product_id: "P1".to_string(),
//!         quantity: 2,
//!     }).await?;
//!
//!     println!("order {} completed, total {}", order.id, order.total);
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod model;
pub mod producer;
pub mod repository;
pub mod reservation;
pub mod saga;
pub mod service;
pub mod topology;

pub use config::{ConnectionConfig, RetryPolicy, Settings, Topology};
pub use connection::ConnectionManager;
pub use consumer::{Disposition, EventConsumer, InboundMessage};
pub use error::{OrderMeshError, Result};
pub use message::{ReplyStatus, StockCheckReply, StockCheckRequest};
pub use model::{Order, OrderStatus, Product};
pub use producer::{EventProducer, EventPublisher};
pub use reservation::ReservationHandler;
pub use saga::{OrderRequest, SagaCoordinator, SagaState};
pub use service::{OrderSagaService, ReservationService};
