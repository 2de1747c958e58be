use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle status.
///
/// Transitions are monotonic and terminal: `Pending -> Completed` or
/// `Pending -> Cancelled`; nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed) | (Self::Pending, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// An order, created by the saga only after a successful reservation reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub product_id: String,
    pub quantity: u32,
    pub total: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a completed order from a successful reservation
    pub fn completed(product_id: impl Into<String>, quantity: u32, total: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            product_id: product_id.into(),
            quantity,
            total,
            status: OrderStatus::Completed,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A product whose stock is mutated only by the reservation handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: u32,
    pub category_name: String,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: f64, stock: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            price,
            stock,
            category_name: String::new(),
        }
    }
}
