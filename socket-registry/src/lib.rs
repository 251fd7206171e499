//! Distributed connection registry and topic fanout.
//!
//! This crate provides:
//! - A shared membership store (Redis, or in-process for single instances)
//!   recording which client owns each socket and which clients follow each topic
//! - A per-process table of live connections
//! - Topic broadcast over the store's pub/sub, relayed by every instance to
//!   the subscribers' sockets it holds
//! - Direct delivery to a client's sockets on this instance
//!
//! # Example
//!
//! ```rust,ignore
//! use socket_registry::{connect_store, RegistryConfig, RelayListener, SocketManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RegistryConfig::from_lookup(|name| std::env::var(name).ok())?;
//!     let store = connect_store(&config).await?;
//!     let manager = Arc::new(SocketManager::new(store));
//!
//!     // One listener per process relays topic messages to local sockets
//!     let listener = RelayListener::start(manager.clone()).await?;
//!
//!     manager.subscribe("device-42", "sourdough-data:user-7").await?;
//!     manager
//!         .broadcast("sourdough-data:user-7", &serde_json::json!({"ph": 4.1}))
//!         .await?;
//!
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Failure model
//!
//! - **Invalid arguments** (blank client id or topic) are returned to the caller
//! - **Store outages** on mutating calls are logged and absorbed, so a store
//!   hiccup never tears down a connection
//! - **Per-socket write failures** are logged and counted; sibling sockets
//!   still receive the message

mod config;
mod connection;
mod delivery;
mod envelope;
mod error;
pub mod keys;
mod listener;
mod local;
mod manager;
pub mod metrics;
pub mod store;
#[cfg(test)]
mod testing;

pub use config::{RegistryConfig, StoreBackend, DEFAULT_REDIS_URL};
pub use connection::{ChannelConnection, Connection, ConnectionHandle, SocketId};
pub use delivery::DeliveryReport;
pub use envelope::{type_tag, Envelope};
pub use error::{Error, Result};
pub use listener::{process_message, RelayListener};
pub use local::LocalConnections;
pub use manager::{Clock, SocketManager};
pub use metrics::METRICS;
pub use store::{connect_store, MembershipStore, MemoryStore, RedisStore};
