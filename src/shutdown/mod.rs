//! Graceful shutdown for the gateway.
//!
//! Clients are told to reconnect elsewhere, background tasks are stopped,
//! and every connection is closed through the supervisor so presence
//! bookkeeping runs for each user before the process exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection_manager::ConnectionRegistry;
use crate::dispatcher::EventDispatcher;
use crate::supervisor::{CloseReason, ConnectionSupervisor};
use crate::websocket::ServerMessage;

/// Pause between close sweeps while waiting for the registry to empty
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to keep sweeping connections admitted mid-shutdown (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Suggested reconnect delay to send to clients (default: 5 seconds)
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            reconnect_after_seconds: 5,
        }
    }
}

/// Coordinates shutdown of the realtime layer
pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    supervisor: Arc<ConnectionSupervisor>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<EventDispatcher>,
        supervisor: Arc<ConnectionSupervisor>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(
            registry,
            dispatcher,
            supervisor,
            shutdown_tx,
            ShutdownConfig::default(),
        )
    }

    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<EventDispatcher>,
        supervisor: Arc<ConnectionSupervisor>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            supervisor,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: tell clients; queued before their transports are torn down
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        let report = self.dispatcher.broadcast(&ServerMessage::Shutdown {
            reason: reason.to_string(),
            reconnect_after_seconds: self.config.reconnect_after_seconds,
        });
        result.clients_notified = report.delivered;

        // Phase 2: stop background tasks
        tracing::info!("Phase 2: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        // Phase 3: close everything through the supervisor
        tracing::info!("Phase 3: Closing connections");
        result.connections_closed = self.close_connections().await;
        result.remaining_connections = self.registry.len();

        result.duration = start.elapsed();
        result.success = result.remaining_connections == 0;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            remaining_connections = result.remaining_connections,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    /// Close all connections, sweeping again for any admitted while closing
    async fn close_connections(&self) -> usize {
        let mut closed = self.supervisor.close_all(CloseReason::Shutdown);

        if self.registry.is_empty() {
            return closed;
        }

        let sweep = async {
            loop {
                tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
                closed += self.supervisor.close_all(CloseReason::Shutdown);
                if self.registry.is_empty() {
                    break;
                }
            }
        };

        if timeout(self.config.drain_timeout, sweep).await.is_err() {
            tracing::warn!(
                remaining_connections = self.registry.len(),
                "Some connections did not close before the drain timeout"
            );
        }

        closed
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every connection was closed
    pub success: bool,
    /// Number of active clients that were sent a shutdown event
    pub clients_notified: usize,
    /// Number of connections closed by the shutdown
    pub connections_closed: usize,
    /// Connections still registered when shutdown gave up
    pub remaining_connections: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IdentityVerifier;
    use crate::domain::VerifiedIdentity;
    use crate::error::GatewayError;
    use crate::repository::InMemoryConversationDirectory;
    use crate::supervisor::SupervisorConfig;
    use crate::websocket::OutboundMessage;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct StaticVerifier;

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> Result<VerifiedIdentity, GatewayError> {
            Ok(VerifiedIdentity::new(token, token))
        }
    }

    struct Components {
        registry: Arc<ConnectionRegistry>,
        supervisor: Arc<ConnectionSupervisor>,
        shutdown: GracefulShutdown,
        shutdown_tx: broadcast::Sender<()>,
    }

    fn create_test_components() -> Components {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            registry.clone(),
            Arc::new(InMemoryConversationDirectory::new()),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            registry.clone(),
            dispatcher.clone(),
            Arc::new(StaticVerifier),
            SupervisorConfig::default(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(
            registry.clone(),
            dispatcher,
            supervisor.clone(),
            shutdown_tx.clone(),
        );
        Components {
            registry,
            supervisor,
            shutdown,
            shutdown_tx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg.to_server_message().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let c = create_test_components();

        let result = c.shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.connections_closed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_closes_everyone() {
        let c = create_test_components();
        let mut tasks_rx = c.shutdown_tx.subscribe();

        let (alice, mut rx_a) = c.supervisor.accept().unwrap();
        let (bob, mut rx_b) = c.supervisor.accept().unwrap();
        let (_pending, mut rx_p) = c.supervisor.accept().unwrap();
        c.supervisor.authenticate(alice.id, "alice").await.unwrap();
        c.supervisor.authenticate(bob.id, "bob").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let result = c.shutdown.execute("deploy").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 2);
        assert_eq!(result.connections_closed, 3);
        assert!(c.registry.is_empty());
        assert!(c.registry.online_user_ids().is_empty());
        assert!(tasks_rx.try_recv().is_ok());
        assert!(alice.is_close_requested());

        let expected = ServerMessage::Shutdown {
            reason: "deploy".into(),
            reconnect_after_seconds: 5,
        };
        assert_eq!(drain(&mut rx_a).first(), Some(&expected));
        assert_eq!(drain(&mut rx_b).first(), Some(&expected));
        // Unauthenticated connections are closed but not addressed
        assert!(drain(&mut rx_p).is_empty());
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_after_seconds, 5);
    }
}
