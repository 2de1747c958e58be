//! Idempotent declaration of the exchanges, queues, and bindings both sides
//! of the saga depend on. Run once per service at startup; declarations are
//! no-ops when the objects already exist with the same arguments.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, ExchangeKind};
use tracing::info;

use crate::config::Topology;
use crate::error::Result;

/// Declare the full topology on the given channel.
///
/// The stock-check queue carries both a dead-letter exchange and a message
/// TTL, so broker-level expiry dead-letters a request independently of the
/// consumer's own retry counting.
pub async fn declare(channel: &Channel, topology: &Topology) -> Result<()> {
    for exchange in [
        &topology.order_exchange,
        &topology.product_exchange,
        &topology.notification_exchange,
        &topology.dead_letter_exchange,
    ] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
    }

    let durable = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    let mut stock_check_args = FieldTable::default();
    stock_check_args.insert(
        ShortString::from("x-dead-letter-exchange".to_string()),
        AMQPValue::LongString(topology.dead_letter_exchange.clone().into()),
    );
    stock_check_args.insert(
        ShortString::from("x-message-ttl".to_string()),
        AMQPValue::LongInt(topology.message_ttl_ms as i32),
    );
    channel
        .queue_declare(&topology.stock_check_queue, durable, stock_check_args)
        .await?;

    let mut reply_args = FieldTable::default();
    reply_args.insert(
        ShortString::from("x-dead-letter-exchange".to_string()),
        AMQPValue::LongString(topology.dead_letter_exchange.clone().into()),
    );
    channel
        .queue_declare(&topology.order_response_queue, durable, reply_args)
        .await?;

    channel
        .queue_declare(&topology.notification_queue, durable, FieldTable::default())
        .await?;
    channel
        .queue_declare(&topology.dead_letter_queue, durable, FieldTable::default())
        .await?;

    channel
        .queue_bind(
            &topology.stock_check_queue,
            &topology.product_exchange,
            &topology.stock_check_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &topology.order_response_queue,
            &topology.product_exchange,
            &topology.stock_check_reply_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &topology.notification_queue,
            &topology.notification_exchange,
            &topology.notification_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &topology.dead_letter_queue,
            &topology.dead_letter_exchange,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!("broker topology declared");
    Ok(())
}
