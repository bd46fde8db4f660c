//! # Common Components
//!
//! Shared utilities and data structures used by every process in the cluster.
//!
//! ## Modules
//!
//! - [`clock`]: Lamport logical clock
//! - [`messages`]: Request/response envelopes, replication and bus frames
//! - [`connection`]: Length-prefixed JSON framing over async streams
//! - [`config`]: TOML configuration with defaults
//! - [`error`]: Protocol error taxonomy
//! - [`logging`]: Logger initialization shared by the binaries

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod messages;
