use thiserror::Error;

use crate::model::OrderStatus;

/// Result type alias for OrderMesh operations
pub type Result<T> = std::result::Result<T, OrderMeshError>;

/// Error types for the saga/messaging layer
#[derive(Error, Debug)]
pub enum OrderMeshError {
    /// AMQP connection errors
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Connection attempts exhausted without reaching the broker
    #[error("Broker unavailable after {attempts} connection attempts")]
    BrokerUnavailable { attempts: u32 },

    /// A channel was requested before a successful connect
    #[error("Broker channel is not initialized")]
    NotInitialized,

    /// No reply arrived within the saga window
    #[error("Stock check timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A delivery carried a correlation ID with no registered handler
    #[error("No callback registered for key '{key}'")]
    CallbackNotFound { key: String },

    /// Reservation validation: the product does not exist
    #[error("Product not found")]
    ProductNotFound,

    /// Reservation validation: requested quantity exceeds available stock
    #[error("Insufficient stock")]
    InsufficientStock,

    /// The product side rejected the reservation for another reason
    #[error("Reservation failed: {reason}")]
    ReservationFailed { reason: String },

    /// An order status update would leave a terminal state
    #[error("Invalid order status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Internal framework errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// Tokio join errors
    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl OrderMeshError {
    /// Create a new internal error
    pub fn internal<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    /// Create a new invalid-message error
    pub fn invalid_message<T: ToString>(reason: T) -> Self {
        Self::InvalidMessage {
            reason: reason.to_string(),
        }
    }

    /// Check if error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::BrokerUnavailable { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// The reason string carried on an error-status reply.
    ///
    /// Known reasons map back to their variant on the requester side, so the
    /// wire strings are kept stable.
    pub fn reply_reason(&self) -> String {
        self.to_string()
    }

    /// Map a reason string carried on an error reply back to an error.
    pub fn from_reply_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("Product not found") => Self::ProductNotFound,
            Some("Insufficient stock") => Self::InsufficientStock,
            Some(other) => Self::ReservationFailed {
                reason: other.to_string(),
            },
            None => Self::ReservationFailed {
                reason: "unknown error".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_reason_round_trip() {
        let err = OrderMeshError::from_reply_reason(Some(
            &OrderMeshError::InsufficientStock.reply_reason(),
        ));
        assert!(matches!(err, OrderMeshError::InsufficientStock));

        let err = OrderMeshError::from_reply_reason(Some(
            &OrderMeshError::ProductNotFound.reply_reason(),
        ));
        assert!(matches!(err, OrderMeshError::ProductNotFound));

        let err = OrderMeshError::from_reply_reason(Some("database exploded"));
        assert!(matches!(err, OrderMeshError::ReservationFailed { .. }));

        let err = OrderMeshError::from_reply_reason(None);
        assert!(matches!(err, OrderMeshError::ReservationFailed { .. }));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(OrderMeshError::BrokerUnavailable { attempts: 5 }.is_recoverable());
        assert!(OrderMeshError::Timeout { timeout_ms: 15_000 }.is_recoverable());
        assert!(!OrderMeshError::InsufficientStock.is_recoverable());
        assert!(!OrderMeshError::invalid_message("bad payload").is_recoverable());
    }
}
