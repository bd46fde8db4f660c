//! # Chat Core
//!
//! Everything a chat server does with a single message, independent of the
//! network: request handlers, replication application, and coordinator
//! tracking. The [`ChatServerMiddleware`](super::middleware::ChatServerMiddleware)
//! owns the sockets and feeds messages in one at a time.
//!
//! ## Services
//!
//! | service    | required fields          | effect                                     | status      |
//! |------------|--------------------------|--------------------------------------------|-------------|
//! | `login`    | `user`                   | record login, replicate                    | `sucesso`   |
//! | `users`    | -                        | list known users                           | -           |
//! | `channel`  | `channel`                | create channel (must be new), replicate    | `sucesso`   |
//! | `channels` | -                        | list channels in creation order            | -           |
//! | `publish`  | `user, channel, message` | post to existing channel, replicate        | `OK`        |
//! | `message`  | `src, dst, message`      | private message to known user, replicate   | `OK`        |
//!
//! Clock discipline: observe the request clock, handle (publications and
//! replication events tick as they are emitted), tick, reply.

use log::{debug, info, warn};
use serde_json::Value;

use crate::client::Publisher;
use crate::common::clock::LogicalClock;
use crate::common::error::{required, ProtocolError};
use crate::common::messages::{
    current_timestamp, payload_clock, ChannelRecord, CoordinatorAnnouncement, LoginRecord,
    MemberInfo, Mutation, PrivateMessage, Publication, ReplicationEvent, Request, RequestData,
    Response, ResponseData, Status, COORDINATOR_TOPIC, REPLICATION_TOPIC,
};
use crate::server::replication::{self, ReplicationEmitter};
use crate::server::store::{ChatState, ChatStore, Entity};

/// What happened to an inbound replication event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Emitted by this server; ignored
    OwnEvent,
    /// Applied and persisted
    Applied(Entity),
    /// Already reflected in local state
    AlreadyApplied,
    /// Payload did not match its operation
    Rejected,
}

pub struct ChatCore {
    /// Server name, also the origin tag on replication events
    name: String,
    clock: LogicalClock,
    state: ChatState,
    store: ChatStore,
    /// Direct publications on channel and user topics
    publisher: Publisher,
    emitter: ReplicationEmitter,
    rank: Option<u64>,
    /// Live members as of the last `list` call, plus announced coordinators
    members: Vec<MemberInfo>,
    coordinator: Option<CoordinatorAnnouncement>,
    /// Publications and private messages delivered by this server
    delivered: u64,
}

impl ChatCore {
    /// Load persisted state from `store` and prepare to serve as `name`.
    pub fn new(name: impl Into<String>, store: ChatStore, publisher: Publisher) -> Self {
        let name = name.into();
        let state = store.load();
        info!(
            "📂 {} loaded {} users, {} channels, {} messages, {} publications",
            name,
            state.users.len(),
            state.channels.len(),
            state.messages.len(),
            state.publications.len()
        );

        Self {
            emitter: ReplicationEmitter::new(name.clone(), publisher.clone()),
            name,
            clock: LogicalClock::new(),
            state,
            store,
            publisher,
            rank: None,
            members: Vec::new(),
            coordinator: None,
            delivered: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> u64 {
        self.clock.time()
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn rank(&self) -> Option<u64> {
        self.rank
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    pub fn coordinator(&self) -> Option<&str> {
        self.coordinator.as_ref().map(|c| c.coordinator.as_str())
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.name.as_str())
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Tick for an outbound message this server originates (e.g. a request
    /// to the reference service).
    pub fn tick(&mut self) -> u64 {
        self.clock.tick()
    }

    /// Merge the clock of an inbound reply.
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.clock.observe(remote)
    }

    pub fn set_rank(&mut self, rank: u64) {
        self.rank = Some(rank);
    }

    pub fn set_members(&mut self, members: Vec<MemberInfo>) {
        self.members = members;
    }

    // ========================================================================
    // REQUESTS
    // ========================================================================

    pub fn handle_request(&mut self, request: Request) -> Response {
        self.clock.observe(request.data.clock);

        let data = request.data;
        let result = match request.service.as_str() {
            "login" => self.login(data),
            "users" => Ok(self.users()),
            "channel" => self.create_channel(data),
            "channels" => Ok(self.channels()),
            "publish" => self.publish(data),
            "message" => self.message(data),
            other => Err(ProtocolError::UnknownService(other.to_string())),
        };

        if let Err(e) = &result {
            warn!("⚠️  [{}] Rejected '{}': {}", self.name, request.service, e);
        }

        let clock = self.clock.tick();
        Response::from_result(request.service, result, clock)
    }

    /// Reply to a frame that could not be decoded as a request.
    pub fn reject_malformed(&mut self, reason: String) -> Response {
        let clock = self.clock.tick();
        Response::from_result("", Err(ProtocolError::Malformed(reason)), clock)
    }

    fn login(&mut self, data: RequestData) -> Result<ResponseData, ProtocolError> {
        let user = required(data.user, "user")?;
        let timestamp = data.timestamp.unwrap_or_else(current_timestamp);

        self.state
            .users
            .entry(user.clone())
            .or_default()
            .push(timestamp.clone());
        self.store.persist(&self.state, Entity::Users);
        info!("👤 [{}] User '{}' logged in", self.name, user);

        self.emitter.emit(
            &mut self.clock,
            &Mutation::Login(LoginRecord { user, timestamp }),
        );
        Ok(ResponseData::with_status(Status::Success))
    }

    fn users(&self) -> ResponseData {
        ResponseData {
            users: Some(self.state.users.keys().cloned().collect()),
            ..ResponseData::default()
        }
    }

    fn create_channel(&mut self, data: RequestData) -> Result<ResponseData, ProtocolError> {
        let channel = required(data.channel, "channel")?;
        if self.state.channels.contains(&channel) {
            return Err(ProtocolError::ChannelExists(channel));
        }

        self.state.channels.push(channel.clone());
        self.store.persist(&self.state, Entity::Channels);
        info!("📢 [{}] Channel '{}' created", self.name, channel);

        self.emitter
            .emit(&mut self.clock, &Mutation::Channel(ChannelRecord { channel }));
        Ok(ResponseData::with_status(Status::Success))
    }

    fn channels(&self) -> ResponseData {
        ResponseData {
            channels: Some(self.state.channels.clone()),
            ..ResponseData::default()
        }
    }

    fn publish(&mut self, data: RequestData) -> Result<ResponseData, ProtocolError> {
        let user = required(data.user, "user")?;
        let channel = required(data.channel, "channel")?;
        let text = required(data.message, "message")?;
        if !self.state.channels.contains(&channel) {
            return Err(ProtocolError::UnknownChannel(channel));
        }

        let publication = Publication {
            channel,
            user,
            text,
            timestamp: data.timestamp.unwrap_or_else(current_timestamp),
            clock: self.clock.tick(),
        };
        self.publisher.publish(&publication.channel, &publication);

        self.state.publications.push(publication.clone());
        self.store.persist(&self.state, Entity::Publications);
        self.emitter
            .emit(&mut self.clock, &Mutation::Publication(publication));

        self.delivered += 1;
        Ok(ResponseData::with_status(Status::Ok))
    }

    fn message(&mut self, data: RequestData) -> Result<ResponseData, ProtocolError> {
        let src = required(data.src, "src")?;
        let dst = required(data.dst, "dst")?;
        let text = required(data.message, "message")?;
        if !self.state.users.contains_key(&dst) {
            return Err(ProtocolError::UnknownUser(dst));
        }

        let message = PrivateMessage {
            src,
            dst,
            text,
            timestamp: data.timestamp.unwrap_or_else(current_timestamp),
            clock: self.clock.tick(),
        };
        self.publisher.publish(&message.dst, &message);

        self.state.messages.push(message.clone());
        self.store.persist(&self.state, Entity::Messages);
        self.emitter.emit(&mut self.clock, &Mutation::Message(message));

        self.delivered += 1;
        Ok(ResponseData::with_status(Status::Ok))
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Handle one publication received from the bus. Returns the replication
    /// outcome for events on the replication topic.
    pub fn handle_publication(&mut self, topic: &str, payload: Value) -> Option<ApplyOutcome> {
        self.clock.observe(payload_clock(&payload));

        match topic {
            COORDINATOR_TOPIC => {
                match serde_json::from_value::<CoordinatorAnnouncement>(payload) {
                    Ok(announcement) => self.observe_coordinator(announcement),
                    Err(e) => warn!("⚠️  [{}] Bad coordinator announcement: {}", self.name, e),
                }
                None
            }
            REPLICATION_TOPIC => match serde_json::from_value::<ReplicationEvent>(payload) {
                Ok(event) => Some(self.apply_replication(event)),
                Err(e) => {
                    warn!("⚠️  [{}] Bad replication event: {}", self.name, e);
                    Some(ApplyOutcome::Rejected)
                }
            },
            other => {
                debug!("[{}] Ignoring publication on '{}'", self.name, other);
                None
            }
        }
    }

    /// Apply a peer's replication event. The caller has already observed its
    /// clock.
    pub fn apply_replication(&mut self, event: ReplicationEvent) -> ApplyOutcome {
        if event.origin_server == self.name {
            return ApplyOutcome::OwnEvent;
        }

        let mutation = match event.mutation() {
            Ok(mutation) => mutation,
            Err(e) => {
                warn!(
                    "⚠️  [{}] Unreadable {:?} event from {}: {}",
                    self.name, event.operation, event.origin_server, e
                );
                return ApplyOutcome::Rejected;
            }
        };

        info!(
            "🔁 [{}] Applying {:?} from {} (clock {})",
            self.name, event.operation, event.origin_server, event.clock
        );
        match replication::apply(&mut self.state, mutation) {
            Some(entity) => {
                self.store.persist(&self.state, entity);
                ApplyOutcome::Applied(entity)
            }
            None => ApplyOutcome::AlreadyApplied,
        }
    }

    fn observe_coordinator(&mut self, announcement: CoordinatorAnnouncement) {
        if announcement.coordinator == self.name {
            info!(
                "👑 [{}] I am the coordinator (rank {}, clock {})",
                self.name,
                announcement.rank,
                self.clock.time()
            );
        } else {
            info!(
                "🗳️  [{}] Coordinator is {} (rank {}, clock {})",
                self.name,
                announcement.coordinator,
                announcement.rank,
                self.clock.time()
            );
        }
        if !self
            .members
            .iter()
            .any(|member| member.name == announcement.coordinator)
        {
            self.members.push(MemberInfo {
                name: announcement.coordinator.clone(),
                rank: announcement.rank,
            });
            self.members.sort_by_key(|member| member.rank);
        }
        debug!("[{}] Known members: {:?}", self.name, self.members);
        self.coordinator = Some(announcement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::BusFrame;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        core: ChatCore,
        bus: mpsc::Receiver<BusFrame>,
        _dir: TempDir,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let store = ChatStore::open(dir.path()).unwrap();
            let (publisher, bus) = Publisher::channel(64);
            Self {
                core: ChatCore::new(name, store, publisher),
                bus,
                _dir: dir,
            }
        }

        fn send(&mut self, service: &str, data: RequestData) -> Response {
            self.core.handle_request(Request::new(service, data, 0))
        }

        /// Everything published since the last call.
        fn published(&mut self) -> Vec<(String, Value)> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.bus.try_recv() {
                if let BusFrame::Publish { topic, payload } = frame {
                    frames.push((topic, payload));
                }
            }
            frames
        }
    }

    fn login(user: &str, timestamp: &str) -> RequestData {
        RequestData {
            user: Some(user.into()),
            timestamp: Some(timestamp.into()),
            ..RequestData::default()
        }
    }

    fn channel(name: &str) -> RequestData {
        RequestData {
            channel: Some(name.into()),
            ..RequestData::default()
        }
    }

    fn post(user: &str, channel: &str, text: &str) -> RequestData {
        RequestData {
            user: Some(user.into()),
            channel: Some(channel.into()),
            message: Some(text.into()),
            ..RequestData::default()
        }
    }

    #[test]
    fn login_records_and_replicates() {
        let mut a = Harness::new("server_a");
        let response = a.send("login", login("alice", "t1"));

        assert_eq!(response.data.status, Some(Status::Success));
        assert_eq!(a.core.state().users["alice"], vec!["t1".to_string()]);

        let published = a.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, REPLICATION_TOPIC);
        assert_eq!(published[0].1["operation"], json!("login"));
        assert_eq!(published[0].1["server"], json!("server_a"));
    }

    #[test]
    fn login_without_user_is_rejected() {
        let mut a = Harness::new("server_a");
        let response = a.send("login", RequestData::default());
        assert!(response.is_error());
        assert!(response.data.description.unwrap().contains("user"));
        assert!(a.published().is_empty());
    }

    #[test]
    fn users_lists_logged_in_names() {
        let mut a = Harness::new("server_a");
        a.send("login", login("bob", "t1"));
        a.send("login", login("alice", "t2"));

        let response = a.send("users", RequestData::default());
        assert_eq!(
            response.data.users,
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(response.data.status, None);
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let mut a = Harness::new("server_a");
        assert_eq!(
            a.send("channel", channel("general")).data.status,
            Some(Status::Success)
        );

        let again = a.send("channel", channel("general"));
        assert!(again.is_error());
        assert_eq!(
            a.send("channels", RequestData::default()).data.channels,
            Some(vec!["general".to_string()])
        );
    }

    #[test]
    fn publish_requires_existing_channel() {
        let mut a = Harness::new("server_a");
        let response = a.send("publish", post("alice", "nowhere", "hi"));
        assert!(response.is_error());
        assert!(response.data.description.unwrap().contains("nowhere"));
        assert!(a.core.state().publications.is_empty());
    }

    #[test]
    fn publish_posts_on_channel_topic_and_replicates() {
        let mut a = Harness::new("server_a");
        a.send("channel", channel("general"));
        a.published();

        let response = a.send("publish", post("alice", "general", "hi"));
        assert_eq!(response.data.status, Some(Status::Ok));

        let published = a.published();
        let topics: Vec<&str> = published.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["general", REPLICATION_TOPIC]);
        assert_eq!(published[0].1["message"], json!("hi"));

        // publication clock < replication clock < reply clock
        let publication_clock = payload_clock(&published[0].1);
        let replication_clock = payload_clock(&published[1].1);
        assert!(publication_clock < replication_clock);
        assert!(replication_clock < response.data.clock);
        assert_eq!(a.core.delivered(), 1);
    }

    #[test]
    fn message_requires_known_destination() {
        let mut a = Harness::new("server_a");
        let data = RequestData {
            src: Some("alice".into()),
            dst: Some("bob".into()),
            message: Some("psst".into()),
            ..RequestData::default()
        };

        assert!(a.send("message", data.clone()).is_error());

        a.send("login", login("bob", "t1"));
        a.published();
        let response = a.send("message", data);
        assert_eq!(response.data.status, Some(Status::Ok));

        let published = a.published();
        assert_eq!(published[0].0, "bob");
        assert_eq!(published[0].1["src"], json!("alice"));
        assert_eq!(a.core.state().messages.len(), 1);
    }

    #[test]
    fn unknown_service_names_the_service() {
        let mut a = Harness::new("server_a");
        let response = a.send("frobnicate", RequestData::default());

        assert_eq!(response.service, "frobnicate");
        assert_eq!(response.data.status, Some(Status::Error));
        assert!(response.data.description.unwrap().contains("frobnicate"));
        assert_eq!(a.core.clock(), 2);
    }

    #[test]
    fn own_replication_events_are_ignored() {
        let mut a = Harness::new("server_a");
        a.send("channel", channel("general"));

        for (topic, payload) in a.published() {
            assert_eq!(
                a.core.handle_publication(&topic, payload),
                Some(ApplyOutcome::OwnEvent)
            );
        }
        assert_eq!(a.core.state().channels.len(), 1);
    }

    #[test]
    fn replicated_login_and_channel_are_idempotent() {
        let mut a = Harness::new("server_a");
        let mut b = Harness::new("server_b");
        a.send("login", login("alice", "t1"));
        a.send("channel", channel("general"));
        let events = a.published();

        for _ in 0..2 {
            for (topic, payload) in events.clone() {
                b.core.handle_publication(&topic, payload);
            }
        }

        assert_eq!(b.core.state().users["alice"], vec!["t1".to_string()]);
        assert_eq!(b.core.state().channels, vec!["general".to_string()]);
    }

    #[test]
    fn replicas_converge_without_resending_state() {
        let mut a = Harness::new("server_a");
        let mut b = Harness::new("server_b");

        a.send("channel", channel("general"));
        a.send("publish", post("alice", "general", "hi"));

        for (topic, payload) in a.published() {
            b.core.handle_publication(&topic, payload);
        }

        let state = b.core.state();
        assert_eq!(state.channels, vec!["general".to_string()]);
        assert_eq!(state.publications.len(), 1);
        assert_eq!(state.publications[0].text, "hi");
        assert_eq!(state.publications[0].user, "alice");
        // B's clock caught up with everything A emitted
        assert!(b.core.clock() >= a.core.clock());
        // B does not echo replicated state back onto the bus
        assert!(b.published().is_empty());
    }

    #[test]
    fn coordinator_announcements_update_local_view() {
        let mut a = Harness::new("server_a");
        assert_eq!(a.core.coordinator(), None);

        let payload = json!({"coordinator": "server_a", "rank": 0, "clock": 12});
        assert_eq!(a.core.handle_publication(COORDINATOR_TOPIC, payload), None);

        assert_eq!(a.core.coordinator(), Some("server_a"));
        assert!(a.core.is_coordinator());
        assert_eq!(a.core.clock(), 13);
    }

    #[test]
    fn announced_coordinator_joins_member_view() {
        let mut b = Harness::new("server_b");
        b.core.set_members(vec![MemberInfo {
            name: "server_b".into(),
            rank: 1,
        }]);

        let payload = json!({"coordinator": "server_a", "rank": 0, "clock": 3});
        b.core.handle_publication(COORDINATOR_TOPIC, payload.clone());
        b.core.handle_publication(COORDINATOR_TOPIC, payload);

        let names: Vec<&str> = b.core.members().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["server_a", "server_b"]);
        assert!(!b.core.is_coordinator());
    }

    #[test]
    fn garbled_replication_event_is_rejected() {
        let mut b = Harness::new("server_b");
        let payload = json!({
            "operation": "channel",
            "data": {"nope": true},
            "server": "server_a",
            "clock": 1
        });
        assert_eq!(
            b.core.handle_publication(REPLICATION_TOPIC, payload),
            Some(ApplyOutcome::Rejected)
        );
        assert!(b.core.state().channels.is_empty());
    }

    #[test]
    fn state_reloads_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (publisher, _bus) = Publisher::channel(64);
            let mut core = ChatCore::new("server_a", ChatStore::open(dir.path()).unwrap(), publisher);
            core.handle_request(Request::new("login", login("alice", "t1"), 0));
            core.handle_request(Request::new("channel", channel("general"), 0));
        }

        let (publisher, _bus) = Publisher::channel(64);
        let core = ChatCore::new("server_a", ChatStore::open(dir.path()).unwrap(), publisher);
        assert!(core.state().users.contains_key("alice"));
        assert_eq!(core.state().channels, vec!["general".to_string()]);
    }
}
