//! # Reference Service
//!
//! Owns cluster membership and coordinator election for chat servers.
//!
//! - [`registry`]: rank assignment and lazy liveness filtering
//! - [`election`]: lowest-live-rank coordinator selection and change detection
//! - [`service`]: request dispatcher, network endpoint, and election task

pub mod election;
pub mod registry;
pub mod service;

pub use registry::MembershipRegistry;
pub use service::{ReferenceService, ReferenceState};
