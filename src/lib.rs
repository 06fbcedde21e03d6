pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod provider;
pub mod server;
pub mod store;
pub mod workspace;
