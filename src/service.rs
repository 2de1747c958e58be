use std::sync::Arc;

use tracing::info;

use crate::config::{Settings, Topology};
use crate::connection::ConnectionManager;
use crate::consumer::EventConsumer;
use crate::error::Result;
use crate::producer::EventProducer;
use crate::repository::{OrderRepository, ProductRepository};
use crate::reservation::ReservationHandler;
use crate::saga::SagaCoordinator;
use crate::topology;

/// Order-side assembly: connection, topology, the reply consumer, and the
/// saga coordinator the HTTP layer calls into.
pub struct OrderSagaService {
    connection: Arc<ConnectionManager>,
    consumer: Arc<EventConsumer>,
    saga: Arc<SagaCoordinator>,
    topology: Topology,
}

impl OrderSagaService {
    pub fn new(settings: &Settings, orders: Arc<dyn OrderRepository>) -> Self {
        let topology = Topology::default();
        let connection = Arc::new(ConnectionManager::with_config(settings.amqp.clone()));
        let producer = Arc::new(EventProducer::new(connection.clone()));
        let consumer = Arc::new(EventConsumer::new(
            connection.clone(),
            settings.retry.clone(),
        ));
        let saga = Arc::new(SagaCoordinator::new(
            orders,
            producer,
            consumer.clone(),
            topology.clone(),
            settings.retry.clone(),
        ));

        Self {
            connection,
            consumer,
            saga,
            topology,
        }
    }

    /// Connect, declare topology, and subscribe to the reply queue
    pub async fn start(&self) -> Result<()> {
        info!("🚀 starting order saga service");
        self.connection.connect().await?;

        let channel = self.connection.channel().await?;
        topology::declare(&channel, &self.topology).await?;

        self.consumer
            .clone()
            .initialize(&self.topology.order_response_queue)
            .await?;

        info!("✅ order saga service ready");
        Ok(())
    }

    /// The coordinator driving `start(orderRequest)` sagas
    pub fn saga(&self) -> Arc<SagaCoordinator> {
        self.saga.clone()
    }

    /// Stop consuming, let the in-flight handler finish, then close channel
    /// and connection, in that order
    pub async fn shutdown(&self) -> Result<()> {
        self.consumer.shutdown().await?;
        self.connection.close().await;
        info!("order saga service stopped");
        Ok(())
    }
}

/// Product-side assembly: connection, topology, the reservation handler, and
/// the request consumer.
pub struct ReservationService {
    connection: Arc<ConnectionManager>,
    consumer: Arc<EventConsumer>,
    handler: Arc<ReservationHandler>,
    topology: Topology,
}

impl ReservationService {
    pub fn new(settings: &Settings, products: Arc<dyn ProductRepository>) -> Self {
        let topology = Topology::default();
        let connection = Arc::new(ConnectionManager::with_config(settings.amqp.clone()));
        let producer = Arc::new(EventProducer::new(connection.clone()));
        let consumer = Arc::new(EventConsumer::new(
            connection.clone(),
            settings.retry.clone(),
        ));
        let handler = Arc::new(ReservationHandler::new(
            products,
            producer,
            topology.clone(),
        ));

        Self {
            connection,
            consumer,
            handler,
            topology,
        }
    }

    /// Connect, declare topology, and subscribe to the stock-check queue
    pub async fn start(&self) -> Result<()> {
        info!("🚀 starting reservation service");
        self.connection.connect().await?;

        let channel = self.connection.channel().await?;
        topology::declare(&channel, &self.topology).await?;

        self.handler.clone().register(&self.consumer).await;
        self.consumer
            .clone()
            .initialize(&self.topology.stock_check_queue)
            .await?;

        info!("✅ reservation service ready");
        Ok(())
    }

    /// Stop consuming, then close channel and connection
    pub async fn shutdown(&self) -> Result<()> {
        self.consumer.shutdown().await?;
        self.connection.close().await;
        info!("reservation service stopped");
        Ok(())
    }
}
