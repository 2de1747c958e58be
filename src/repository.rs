//! Repository seams consumed by the saga core, with in-memory implementations
//! used for wiring and tests. Persistence schemas live outside this crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{OrderMeshError, Result};
use crate::model::{Order, OrderStatus, Product};

/// Order persistence contract
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create(&self, order: Order) -> Result<Order>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Order>>;
    async fn update_status(&self, id: &str, status: OrderStatus) -> Result<Option<Order>>;
}

/// Product persistence contract
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Fails with [`OrderMeshError::ProductNotFound`] for an unknown ID
    async fn get_by_id(&self, id: &str) -> Result<Product>;
    async fn update_stock(&self, product: Product) -> Result<Product>;
}

/// In-memory order store
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<String, Order>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create(&self, order: Order) -> Result<Order> {
        let mut orders = self.orders.write().await;
        orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(id).cloned())
    }

    async fn update_status(&self, id: &str, status: OrderStatus) -> Result<Option<Order>> {
        let mut orders = self.orders.write().await;
        let Some(order) = orders.get_mut(id) else {
            return Ok(None);
        };

        if order.status == status {
            return Ok(Some(order.clone()));
        }
        if !order.status.can_transition(status) {
            return Err(OrderMeshError::InvalidTransition {
                from: order.status,
                to: status,
            });
        }

        order.status = status;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }
}

/// In-memory product store
#[derive(Debug, Default)]
pub struct InMemoryProductRepository {
    products: RwLock<HashMap<String, Product>>,
}

impl InMemoryProductRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, replacing any existing products
    pub fn with_products(products: Vec<Product>) -> Arc<Self> {
        let map = products
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect::<HashMap<_, _>>();
        Arc::new(Self {
            products: RwLock::new(map),
        })
    }

    pub async fn insert(&self, product: Product) {
        self.products
            .write()
            .await
            .insert(product.id.clone(), product);
    }

    pub async fn stock_of(&self, id: &str) -> Option<u32> {
        self.products.read().await.get(id).map(|p| p.stock)
    }
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository {
    async fn get_by_id(&self, id: &str) -> Result<Product> {
        self.products
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(OrderMeshError::ProductNotFound)
    }

    async fn update_stock(&self, product: Product) -> Result<Product> {
        let mut products = self.products.write().await;
        if !products.contains_key(&product.id) {
            return Err(OrderMeshError::ProductNotFound);
        }
        products.insert(product.id.clone(), product.clone());
        Ok(product)
    }
}
