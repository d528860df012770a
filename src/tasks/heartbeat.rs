use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::WebSocketConfig;
use crate::connection_manager::ConnectionRegistry;
use crate::metrics::{ConnectionMetrics, HeartbeatMetrics};
use crate::supervisor::ConnectionSupervisor;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Timer floor; `tokio::time::interval` rejects a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Background task for server heartbeats and stale connection eviction
pub struct HeartbeatTask {
    config: WebSocketConfig,
    registry: Arc<ConnectionRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        registry: Arc<ConnectionRegistry>,
        supervisor: Arc<ConnectionSupervisor>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            supervisor,
            shutdown,
        }
    }

    /// Run the heartbeat and cleanup loops until shutdown is signalled
    pub async fn run(mut self) {
        let heartbeat_interval = self.config.heartbeat_interval().max(MIN_INTERVAL);
        let cleanup_interval = self.config.cleanup_interval().max(MIN_INTERVAL);

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = self.config.connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                }
                _ = cleanup_timer.tick() => {
                    self.evict_stale_connections();
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Queue a heartbeat on every active connection.
    ///
    /// Sends never wait; a full queue flags the connection and the next
    /// cleanup round closes it.
    fn send_heartbeats(&self) {
        let start = Instant::now();
        let connections = self.registry.active_connections();
        let total = connections.len();

        if total == 0 {
            return;
        }

        let message = match OutboundMessage::preserialized(&ServerMessage::Heartbeat) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize heartbeat");
                return;
            }
        };

        let failed = connections
            .iter()
            .filter(|handle| handle.send_outbound(message.clone()).is_err())
            .count();

        let elapsed = start.elapsed();
        HeartbeatMetrics::record_duration_ms(elapsed.as_millis() as u64);

        tracing::debug!(
            total = total,
            failed = failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Heartbeat round completed"
        );

        if elapsed > self.config.heartbeat_interval() / 2 {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                heartbeat_interval_ms = self.config.heartbeat_interval().as_millis() as u64,
                connections = total,
                "Heartbeat round took more than 50% of interval"
            );
        }
    }

    fn evict_stale_connections(&self) {
        let evicted = self.supervisor.evict_stale();
        HeartbeatMetrics::record_evictions(evicted);

        let stats = self.registry.stats();
        ConnectionMetrics::set_gauges(
            stats.total_connections,
            stats.unique_users,
            stats.rooms.len(),
        );

        if evicted > 0 {
            tracing::info!(
                evicted = evicted,
                timeout_secs = self.config.connection_timeout,
                "Evicted stale connections"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IdentityVerifier;
    use crate::dispatcher::EventDispatcher;
    use crate::domain::VerifiedIdentity;
    use crate::error::GatewayError;
    use crate::repository::InMemoryConversationDirectory;
    use crate::supervisor::SupervisorConfig;
    use async_trait::async_trait;

    struct StaticVerifier;

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> Result<VerifiedIdentity, GatewayError> {
            Ok(VerifiedIdentity::new(token, token))
        }
    }

    fn components(
        config: &WebSocketConfig,
    ) -> (Arc<ConnectionRegistry>, Arc<ConnectionSupervisor>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            registry.clone(),
            Arc::new(InMemoryConversationDirectory::new()),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            registry.clone(),
            dispatcher,
            Arc::new(StaticVerifier),
            SupervisorConfig::from(config),
        ));
        (registry, supervisor)
    }

    #[tokio::test]
    async fn test_heartbeat_task_shutdown() {
        let config = WebSocketConfig::default();
        let (registry, supervisor) = components(&config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = HeartbeatTask::new(config, registry, supervisor, shutdown_rx);
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_to_active_connections() {
        let config = WebSocketConfig {
            heartbeat_interval: 1,
            connection_timeout: 60,
            cleanup_interval: 60,
            ..Default::default()
        };
        let (registry, supervisor) = components(&config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (active, mut active_rx) = supervisor.accept().unwrap();
        supervisor.authenticate(active.id, "alice").await.unwrap();
        while active_rx.try_recv().is_ok() {}

        // Not authenticated yet, gets no heartbeat
        let (_pending, mut pending_rx) = supervisor.accept().unwrap();

        let task = HeartbeatTask::new(config, registry, supervisor, shutdown_rx);
        let handle = tokio::spawn(task.run());

        let msg = tokio::time::timeout(Duration::from_secs(3), active_rx.recv())
            .await
            .expect("Should receive heartbeat")
            .expect("Channel should not be closed");
        assert_eq!(msg.to_server_message().unwrap(), ServerMessage::Heartbeat);
        assert!(pending_rx.try_recv().is_err());

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_cleanup_evicts_unauthenticated_connections() {
        let config = WebSocketConfig {
            heartbeat_interval: 60,
            cleanup_interval: 1,
            auth_timeout: 0,
            ..Default::default()
        };
        let (registry, supervisor) = components(&config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (_pending, _rx) = supervisor.accept().unwrap();
        assert_eq!(registry.len(), 1);

        let task = HeartbeatTask::new(config, registry.clone(), supervisor, shutdown_rx);
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.is_empty());

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }
}
