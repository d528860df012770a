//! API layer - HTTP endpoint handlers organized by domain.

mod conversations;
mod health;
mod messages;
mod metrics;
mod presence;
mod routes;

// Re-export all handlers for use in server/app.rs
pub use conversations::{conversation_members, forget_conversation, sync_participants};
pub use health::{health, stats};
pub use messages::message_created;
pub use metrics::prometheus_metrics;
pub use presence::{online_users, user_presence};
pub use routes::api_routes;
