//! # Client Components
//!
//! Connection-side helpers shared by chat servers, the reference service, and
//! the CLI:
//!
//! - [`client`]: request/reply client with timeout and lazy reconnect
//! - [`pubsub`]: bus publisher handle and subscriber link

pub mod client;
pub mod pubsub;

pub use client::RequestClient;
pub use pubsub::{Publisher, Subscriber};
