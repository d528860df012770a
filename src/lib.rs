// Shared components
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod repository;

// Core realtime layer
pub mod connection_manager;
pub mod dispatcher;
pub mod domain;
pub mod presence;
pub mod rooms;
pub mod supervisor;

// Transport and HTTP surface
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
