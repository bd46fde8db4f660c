//! # Chat Server
//!
//! - [`server`]: the chat core (handlers, replication apply, coordinator view)
//! - [`middleware`]: registration, heartbeat, router/bus links, dispatch loop
//! - [`replication`]: replication emitter and idempotent applier
//! - [`store`]: per-entity JSON persistence

pub mod middleware;
pub mod replication;
pub mod server;
pub mod store;

pub use middleware::ChatServerMiddleware;
pub use server::ChatCore;
