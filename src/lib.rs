pub mod app;
pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod conversation;
pub mod conversation_handlers;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod providers;
pub mod quota;
pub mod relay;
pub mod store;
pub mod upstream;
