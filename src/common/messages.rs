//! # Message Protocol
//!
//! Defines every payload exchanged in the chat cluster:
//! - Request/response envelopes for the reference service and chat servers
//! - Replication events broadcast between chat-server replicas
//! - Coordinator announcements from the reference service
//! - Bus frames carried by the publish/subscribe relay
//!
//! Messages are serialized to JSON and sent over TCP with a 4-byte length prefix
//! (see [`Connection`](super::connection::Connection)).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ProtocolError;

// ============================================================================
// WELL-KNOWN TOPICS
// ============================================================================

/// Bus topic carrying [`CoordinatorAnnouncement`]s.
pub const COORDINATOR_TOPIC: &str = "servers";

/// Bus topic carrying [`ReplicationEvent`]s between chat servers.
pub const REPLICATION_TOPIC: &str = "replication";

// ============================================================================
// REQUEST / RESPONSE ENVELOPES
// ============================================================================

/// Inbound request envelope: `{service, data}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Service name, e.g. `rank`, `login`, `publish`
    pub service: String,
    /// Service arguments plus the sender's clock
    #[serde(default)]
    pub data: RequestData,
}

/// Arguments of a request. Every field is optional on the wire; handlers
/// decide which ones are required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Message text for `publish` and `message`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Sender's logical clock
    #[serde(default)]
    pub clock: u64,
}

impl Request {
    /// Build a request stamped with the given clock and the current time.
    pub fn new(service: impl Into<String>, mut data: RequestData, clock: u64) -> Self {
        data.clock = clock;
        if data.timestamp.is_none() {
            data.timestamp = Some(current_timestamp());
        }
        Self {
            service: service.into(),
            data,
        }
    }
}

/// Outcome marker carried in `data.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// State-changing request applied (`login`, `channel`)
    #[serde(rename = "sucesso")]
    Success,
    /// Message delivered (`publish`, `message`)
    #[serde(rename = "OK")]
    Ok,
    /// Request rejected; see `description`
    #[serde(rename = "erro")]
    Error,
}

/// A `{name, rank}` entry in the reference service's member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub rank: u64,
}

/// Response payload. Only the fields relevant to the service are serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<MemberInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub clock: u64,
}

impl ResponseData {
    pub fn with_status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Outbound response envelope: `{service, data}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub service: String,
    #[serde(default)]
    pub data: ResponseData,
}

impl Response {
    /// Turn a handler result into a response stamped with `clock` and the
    /// current time. Errors become `status = "erro"` with a description.
    pub fn from_result(
        service: impl Into<String>,
        result: Result<ResponseData, ProtocolError>,
        clock: u64,
    ) -> Self {
        let mut data = match result {
            Ok(data) => data,
            Err(e) => ResponseData {
                status: Some(Status::Error),
                description: Some(e.to_string()),
                ..ResponseData::default()
            },
        };
        data.clock = clock;
        data.timestamp = current_timestamp();
        Self {
            service: service.into(),
            data,
        }
    }

    pub fn is_error(&self) -> bool {
        self.data.status == Some(Status::Error)
    }
}

// ============================================================================
// REPLICATED RECORDS
// ============================================================================

/// A user login, replicated so every replica knows the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub user: String,
    pub timestamp: String,
}

/// A newly created channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: String,
}

/// A private message from `src` to `dst`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub src: String,
    pub dst: String,
    #[serde(rename = "message")]
    pub text: String,
    pub timestamp: String,
    pub clock: u64,
}

/// A message posted to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub channel: String,
    pub user: String,
    #[serde(rename = "message")]
    pub text: String,
    pub timestamp: String,
    pub clock: u64,
}

/// Kind of state mutation carried by a [`ReplicationEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Login,
    Channel,
    Message,
    Publication,
}

/// Typed view of a replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Login(LoginRecord),
    Channel(ChannelRecord),
    Message(PrivateMessage),
    Publication(Publication),
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Mutation::Login(_) => Operation::Login,
            Mutation::Channel(_) => Operation::Channel,
            Mutation::Message(_) => Operation::Message,
            Mutation::Publication(_) => Operation::Publication,
        }
    }
}

/// Replication message published on [`REPLICATION_TOPIC`].
///
/// Wire shape: `{"operation": "login", "data": {...}, "server": "...", "clock": n}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub operation: Operation,
    pub data: Value,
    /// Name of the chat server that produced the mutation
    #[serde(rename = "server")]
    pub origin_server: String,
    pub clock: u64,
}

impl ReplicationEvent {
    pub fn new(
        mutation: &Mutation,
        origin_server: impl Into<String>,
        clock: u64,
    ) -> serde_json::Result<Self> {
        let data = match mutation {
            Mutation::Login(record) => serde_json::to_value(record)?,
            Mutation::Channel(record) => serde_json::to_value(record)?,
            Mutation::Message(record) => serde_json::to_value(record)?,
            Mutation::Publication(record) => serde_json::to_value(record)?,
        };
        Ok(Self {
            operation: mutation.operation(),
            data,
            origin_server: origin_server.into(),
            clock,
        })
    }

    /// Decode the payload according to `operation`.
    pub fn mutation(&self) -> serde_json::Result<Mutation> {
        Ok(match self.operation {
            Operation::Login => Mutation::Login(decode(&self.data)?),
            Operation::Channel => Mutation::Channel(decode(&self.data)?),
            Operation::Message => Mutation::Message(decode(&self.data)?),
            Operation::Publication => Mutation::Publication(decode(&self.data)?),
        })
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> serde_json::Result<T> {
    T::deserialize(value)
}

// ============================================================================
// ELECTION
// ============================================================================

/// Published on [`COORDINATOR_TOPIC`] whenever the elected coordinator changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorAnnouncement {
    pub coordinator: String,
    pub rank: u64,
    pub clock: u64,
}

// ============================================================================
// BUS FRAMES
// ============================================================================

/// Frames understood by the publish/subscribe relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    /// Sent by a subscriber to add topic prefixes to its filter
    Subscribe { topics: Vec<String> },
    /// A topic-tagged publication
    Publish { topic: String, payload: Value },
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Local wall-clock time as an ISO-8601 string with microseconds.
pub fn current_timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Clock value carried by an arbitrary payload, or 0 when absent.
pub fn payload_clock(payload: &Value) -> u64 {
    payload.get("clock").and_then(Value::as_u64).unwrap_or(0)
}
