pub mod adapter;
pub mod app;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod sse;
pub mod vertex;
