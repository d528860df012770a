use std::sync::Arc;
use std::time::Instant;

use crate::auth::{IdentityVerifier, JwtValidator};
use crate::config::Settings;
use crate::connection_manager::{ConnectionLimits, ConnectionRegistry};
use crate::dispatcher::EventDispatcher;
use crate::repository::InMemoryConversationDirectory;
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<EventDispatcher>,
    pub supervisor: Arc<ConnectionSupervisor>,
    /// Participant sets pushed by the CRUD service
    pub conversations: Arc<InMemoryConversationDirectory>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let verifier = Arc::new(JwtValidator::new(&settings.jwt));
        let conversations = Arc::new(InMemoryConversationDirectory::new());
        Self::from_parts(settings, verifier, conversations)
    }

    /// Build the state around explicit collaborators
    pub fn from_parts(
        settings: Settings,
        verifier: Arc<dyn IdentityVerifier>,
        conversations: Arc<InMemoryConversationDirectory>,
    ) -> Self {
        let limits = ConnectionLimits {
            max_connections: settings.websocket.max_connections,
            max_connections_per_user: settings.websocket.max_connections_per_user,
        };
        let registry = Arc::new(ConnectionRegistry::with_limits(limits));
        let dispatcher = Arc::new(EventDispatcher::new(registry.clone(), conversations.clone()));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            registry.clone(),
            dispatcher.clone(),
            verifier,
            SupervisorConfig::from(&settings.websocket),
        ));

        Self {
            settings: Arc::new(settings),
            registry,
            dispatcher,
            supervisor,
            conversations,
            start_time: Instant::now(),
        }
    }
}
