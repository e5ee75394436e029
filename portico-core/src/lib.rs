//! Core types for the Portico API gateway: static configuration, the
//! routing data model, immutable config snapshots, and the compiled router.

pub mod config;
pub mod consumer;
pub mod error;
pub mod route;
pub mod router;
pub mod snapshot;
pub mod upstream;

pub use error::GatewayError;
