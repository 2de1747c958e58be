use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lapin::{options::BasicQosOptions, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{OrderMeshError, Result};

struct BrokerState {
    connection: Connection,
    channel: Channel,
}

/// Owns the single process-wide connection and channel to the broker.
///
/// `connect()` retries with a fixed backoff up to a fixed attempt count. After
/// a successful connect, broker-initiated connection errors wake a background
/// watchdog that re-runs the same backoff loop, unless a deliberate shutdown
/// is in progress. Consumers learn about a fresh channel through
/// [`subscribe_reconnects`](Self::subscribe_reconnects) and resubscribe on
/// their own.
pub struct ConnectionManager {
    config: ConnectionConfig,
    state: Arc<RwLock<Option<BrokerState>>>,
    closing: Arc<AtomicBool>,
    watchdog_started: AtomicBool,
    lost_tx: mpsc::UnboundedSender<()>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    reconnect_tx: watch::Sender<u64>,
}

impl ConnectionManager {
    /// Create a new connection manager with default configuration
    pub fn new(url: impl Into<String>) -> Self {
        let config = ConnectionConfig {
            url: url.into(),
            ..ConnectionConfig::default()
        };
        Self::with_config(config)
    }

    /// Create a new connection manager with custom configuration
    pub fn with_config(config: ConnectionConfig) -> Self {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, _) = watch::channel(0);
        Self {
            config,
            state: Arc::new(RwLock::new(None)),
            closing: Arc::new(AtomicBool::new(false)),
            watchdog_started: AtomicBool::new(false),
            lost_tx,
            lost_rx: Mutex::new(Some(lost_rx)),
            reconnect_tx,
        }
    }

    /// Establish connection and channel, retrying with fixed backoff.
    ///
    /// Exhausting the attempt budget is fatal: the process cannot serve
    /// without a broker.
    pub async fn connect(&self) -> Result<()> {
        let state = establish(&self.config, &self.closing, &self.lost_tx).await?;
        info!(url = %self.config.url, "connected to RabbitMQ");

        *self.state.write().await = Some(state);
        self.reconnect_tx.send_modify(|generation| *generation += 1);
        self.start_watchdog().await;
        Ok(())
    }

    /// The active channel, or `NotInitialized` before a successful connect
    pub async fn channel(&self) -> Result<Channel> {
        let state = self.state.read().await;
        state
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or(OrderMeshError::NotInitialized)
    }

    /// Check if connection is established and healthy
    pub async fn is_connected(&self) -> bool {
        let state = self.state.read().await;
        state
            .as_ref()
            .map(|s| s.connection.status().connected())
            .unwrap_or(false)
    }

    /// True once a deliberate shutdown has begun
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Receiver notified each time a fresh connection and channel are stored
    pub fn subscribe_reconnects(&self) -> watch::Receiver<u64> {
        self.reconnect_tx.subscribe()
    }

    /// Close channel then connection. Idempotent, and never triggers the
    /// autonomous-reconnect path.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let state = self.state.write().await.take();
        if let Some(state) = state {
            if let Err(e) = state.channel.close(200, "shutdown").await {
                warn!(error = %e, "error closing channel");
            }
            if let Err(e) = state.connection.close(200, "shutdown").await {
                warn!(error = %e, "error closing connection");
            }
            info!("broker connection closed");
        }
    }

    /// Spawn the reconnect watchdog once, after the first successful connect
    async fn start_watchdog(&self) {
        if self.watchdog_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut lost_rx) = self.lost_rx.lock().await.take() else {
            return;
        };

        let config = self.config.clone();
        let state = self.state.clone();
        let closing = self.closing.clone();
        let lost_tx = self.lost_tx.clone();
        let reconnect_tx = self.reconnect_tx.clone();

        tokio::spawn(async move {
            while lost_rx.recv().await.is_some() {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                // Collapse a burst of error events into one reconnect cycle
                while lost_rx.try_recv().is_ok() {}

                warn!("broker connection lost, reconnecting");
                match establish(&config, &closing, &lost_tx).await {
                    Ok(fresh) => {
                        *state.write().await = Some(fresh);
                        reconnect_tx.send_modify(|generation| *generation += 1);
                        info!("reconnected to RabbitMQ");
                    }
                    Err(e) => {
                        error!(error = %e, "reconnect attempts exhausted");
                    }
                }
            }
            debug!("connection watchdog stopped");
        });
    }
}

/// Run the fixed-backoff connect loop and wire the error hook
async fn establish(
    config: &ConnectionConfig,
    closing: &Arc<AtomicBool>,
    lost_tx: &mpsc::UnboundedSender<()>,
) -> Result<BrokerState> {
    let mut attempts = 0;

    loop {
        attempts += 1;
        match try_connect(config).await {
            Ok(state) => {
                let closing = closing.clone();
                let lost_tx = lost_tx.clone();
                state.connection.on_error(move |e| {
                    error!(error = %e, "broker connection error");
                    if !closing.load(Ordering::SeqCst) {
                        let _ = lost_tx.send(());
                    }
                });
                return Ok(state);
            }
            Err(e) => {
                if attempts >= config.max_connect_attempts {
                    error!(attempts, error = %e, "failed to connect to RabbitMQ");
                    return Err(OrderMeshError::BrokerUnavailable { attempts });
                }
                warn!(
                    attempt = attempts,
                    retry_in_ms = config.connect_retry_delay_ms,
                    error = %e,
                    "connection attempt failed, retrying"
                );
                tokio::time::sleep(config.connect_retry_delay()).await;
            }
        }
    }
}

async fn try_connect(config: &ConnectionConfig) -> Result<BrokerState> {
    debug!(url = %config.url, "attempting broker connection");

    let connection = Connection::connect(
        &config.url,
        ConnectionProperties::default()
            .with_connection_name(format!("ordermesh-{}", Uuid::new_v4()).into()),
    )
    .await?;

    let channel = connection.create_channel().await?;
    channel
        .basic_qos(config.prefetch_count, BasicQosOptions::default())
        .await?;

    debug!("AMQP connection and channel established");
    Ok(BrokerState {
        connection,
        channel,
    })
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_before_connect_is_not_initialized() {
        let manager = ConnectionManager::new("amqp://localhost:5672");
        let result = manager.channel().await;
        assert!(matches!(result, Err(OrderMeshError::NotInitialized)));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_without_connection() {
        let manager = ConnectionManager::new("amqp://localhost:5672");
        manager.close().await;
        manager.close().await;
        assert!(manager.is_closing());
    }

    #[tokio::test]
    async fn test_reconnect_subscription_sees_no_phantom_generations() {
        let manager = ConnectionManager::new("amqp://localhost:5672");
        let rx = manager.subscribe_reconnects();
        assert_eq!(*rx.borrow(), 0);
    }
}
