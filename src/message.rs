use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde::{Deserialize, Serialize};

/// Transport header carrying the delivery attempt count.
///
/// Broker redelivery does not increment custom headers, so the consumer
/// re-publishes retried messages with this header bumped (see
/// [`crate::consumer::EventConsumer`]).
pub const RETRY_COUNT_HEADER: &str = "retry-count";

/// Status tag on a stock-check reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Request published by the order side asking the product side to reserve stock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockCheckRequest {
    pub product_id: String,
    pub quantity: u32,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

/// Reply published by the product side, carrying the request's correlation ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockCheckReply {
    pub product_id: String,
    pub quantity: u32,
    pub total: f64,
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

impl StockCheckReply {
    /// Build a success reply for a reserved request
    pub fn success(request: &StockCheckRequest, total: f64) -> Self {
        Self {
            product_id: request.product_id.clone(),
            quantity: request.quantity,
            total,
            status: ReplyStatus::Success,
            error: None,
            correlation_id: request.correlation_id.clone(),
        }
    }

    /// Build an error reply; no stock was mutated
    pub fn error(request: &StockCheckRequest, reason: impl Into<String>) -> Self {
        Self {
            product_id: request.product_id.clone(),
            quantity: request.quantity,
            total: 0.0,
            status: ReplyStatus::Error,
            error: Some(reason.into()),
            correlation_id: request.correlation_id.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

/// Event published on the order exchange once an order is finalized
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: String,
    pub product_id: String,
    pub total: f64,
}

/// Event published on the notification exchange for the notification service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNotification {
    pub order_id: String,
    pub message: String,
}

/// Properties for an outgoing message: persistent delivery, a `retry-count`
/// header, and the correlation ID as message metadata.
pub fn transport_properties(correlation_id: Option<&str>, retry_count: u32) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(RETRY_COUNT_HEADER.to_string()),
        AMQPValue::LongInt(retry_count as i32),
    );

    let mut properties = BasicProperties::default()
        .with_delivery_mode(2)
        .with_headers(headers);

    if let Some(correlation_id) = correlation_id {
        properties = properties.with_correlation_id(correlation_id.to_string().into());
    }

    properties
}

/// Read the `retry-count` header from delivery properties, defaulting to 0
pub fn retry_count(properties: &BasicProperties) -> u32 {
    let key = ShortString::from(RETRY_COUNT_HEADER.to_string());
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(&key))
        .map(|value| match value {
            AMQPValue::ShortShortInt(n) => (*n).max(0) as u32,
            AMQPValue::ShortShortUInt(n) => u32::from(*n),
            AMQPValue::ShortInt(n) => (*n).max(0) as u32,
            AMQPValue::ShortUInt(n) => u32::from(*n),
            AMQPValue::LongInt(n) => (*n).max(0) as u32,
            AMQPValue::LongUInt(n) => *n,
            AMQPValue::LongLongInt(n) => (*n).max(0) as u32,
            _ => 0,
        })
        .unwrap_or(0)
}

/// Read the correlation ID message property, if present
pub fn correlation_id(properties: &BasicProperties) -> Option<String> {
    properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = StockCheckRequest {
            product_id: "P1".to_string(),
            quantity: 2,
            correlation_id: "abc-123".to_string(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["product_id"], "P1");
        assert_eq!(json["correlationId"], "abc-123");

        let parsed: StockCheckRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.quantity, 2);
    }

    #[test]
    fn test_reply_status_tags() {
        let request = StockCheckRequest {
            product_id: "P1".to_string(),
            quantity: 2,
            correlation_id: "abc-123".to_string(),
        };

        let success = StockCheckReply::success(&request, 20.0);
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("error").is_none());

        let error = StockCheckReply::error(&request, "Insufficient stock");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "Insufficient stock");
        assert_eq!(json["correlationId"], "abc-123");
    }

    #[test]
    fn test_reply_schema_mismatch_is_rejected() {
        let result: Result<StockCheckReply, _> =
            serde_json::from_value(serde_json::json!({ "status": "maybe" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_count_header_round_trip() {
        let properties = transport_properties(Some("abc-123"), 2);
        assert_eq!(retry_count(&properties), 2);
        assert_eq!(correlation_id(&properties), Some("abc-123".to_string()));
    }

    #[test]
    fn test_retry_count_defaults_to_zero() {
        let properties = BasicProperties::default();
        assert_eq!(retry_count(&properties), 0);
        assert_eq!(correlation_id(&properties), None);
    }
}
