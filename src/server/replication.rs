//! # Replication
//!
//! Chat servers keep their own copies of users, channels, and message logs.
//! Every local mutation is published once on the replication topic; peers
//! apply what they receive. There is no acknowledgment, retry, or backfill:
//! a peer that is offline at publish time misses the event.
//!
//! Application rules:
//! - `login`: append the timestamp unless that exact timestamp is already
//!   recorded for the user
//! - `channel`: add the name unless present
//! - `message` / `publication`: always append; a redelivered event produces a
//!   duplicate entry
//!
//! User and channel sets therefore converge across replicas; message logs may
//! diverge under redelivery.

use log::{error, info};

use crate::client::Publisher;
use crate::common::clock::LogicalClock;
use crate::common::messages::{Mutation, ReplicationEvent, REPLICATION_TOPIC};
use crate::server::store::{ChatState, Entity};

/// Publishes local mutations for peer replicas.
#[derive(Debug, Clone)]
pub struct ReplicationEmitter {
    /// Name stamped on every event as its origin
    origin: String,
    publisher: Publisher,
}

impl ReplicationEmitter {
    pub fn new(origin: impl Into<String>, publisher: Publisher) -> Self {
        Self {
            origin: origin.into(),
            publisher,
        }
    }

    /// Tick the clock and publish `mutation` on the replication topic.
    pub fn emit(&self, clock: &mut LogicalClock, mutation: &Mutation) {
        let clock = clock.tick();
        match ReplicationEvent::new(mutation, self.origin.as_str(), clock) {
            Ok(event) => {
                self.publisher.publish(REPLICATION_TOPIC, &event);
                info!(
                    "🔁 {} replicating {:?} (clock {})",
                    self.origin, event.operation, clock
                );
            }
            Err(e) => error!("❌ Failed to encode replication event: {}", e),
        }
    }
}

/// Apply one peer mutation to `state`.
///
/// Returns the entity that changed and must be persisted, or `None` when the
/// mutation was already reflected.
pub fn apply(state: &mut ChatState, mutation: Mutation) -> Option<Entity> {
    match mutation {
        Mutation::Login(login) => {
            let history = state.users.entry(login.user).or_default();
            if history.contains(&login.timestamp) {
                return None;
            }
            history.push(login.timestamp);
            Some(Entity::Users)
        }
        Mutation::Channel(record) => {
            if state.channels.contains(&record.channel) {
                return None;
            }
            state.channels.push(record.channel);
            Some(Entity::Channels)
        }
        Mutation::Message(message) => {
            state.messages.push(message);
            Some(Entity::Messages)
        }
        Mutation::Publication(publication) => {
            state.publications.push(publication);
            Some(Entity::Publications)
        }
    }
}
