//! # Reference Service
//!
//! Request/response endpoint that owns cluster membership:
//!
//! | service     | effect                                   | reply fields |
//! |-------------|------------------------------------------|--------------|
//! | `rank`      | register `user` or fetch its rank        | `rank`       |
//! | `list`      | list live members                        | `list`       |
//! | `heartbeat` | refresh `user`'s last-seen time          | -            |
//!
//! Every request follows the same clock discipline: observe the inbound
//! clock, handle, tick, reply with the ticked value. Unknown services still
//! tick and get an `"erro"` reply.
//!
//! ## Tasks
//!
//! - **Listener**: one task per connected chat server, each serving strict
//!   request/reply on its link
//! - **Election**: re-derives the coordinator every `election_interval` and
//!   announces changes on the bus
//! - **Delayed announcement**: one-shot, spawned after a brand-new
//!   registration
//!
//! All of them share [`ReferenceState`] behind a single mutex, so requests
//! are applied one at a time.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::client::Publisher;
use crate::common::clock::LogicalClock;
use crate::common::config::ClusterConfig;
use crate::common::connection::Connection;
use crate::common::error::{required, ProtocolError};
use crate::common::messages::{
    CoordinatorAnnouncement, Request, RequestData, Response, ResponseData, COORDINATOR_TOPIC,
};
use crate::reference::election::CoordinatorElector;
use crate::reference::registry::MembershipRegistry;

// ============================================================================
// STATE - single-writer membership, election, and clock
// ============================================================================

/// Result of handling one request.
#[derive(Debug)]
pub struct Outcome {
    pub response: Response,
    /// The request registered a name never seen before
    pub new_member: bool,
}

#[derive(Debug)]
pub struct ReferenceState {
    clock: LogicalClock,
    registry: MembershipRegistry,
    elector: CoordinatorElector,
}

impl ReferenceState {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            clock: LogicalClock::new(),
            registry: MembershipRegistry::new(liveness_window),
            elector: CoordinatorElector::new(),
        }
    }

    pub fn clock(&self) -> u64 {
        self.clock.time()
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    /// Observe, dispatch by service name, tick, and build the reply.
    pub fn handle_request(&mut self, request: Request, now: Instant) -> Outcome {
        self.clock.observe(request.data.clock);

        let (result, new_member) = match request.service.as_str() {
            "rank" => match self.rank(request.data, now) {
                Ok((data, is_new)) => (Ok(data), is_new),
                Err(e) => (Err(e), false),
            },
            "list" => (Ok(self.list(now)), false),
            "heartbeat" => (self.heartbeat(request.data, now), false),
            other => (Err(ProtocolError::UnknownService(other.to_string())), false),
        };

        if let Err(e) = &result {
            warn!("⚠️  Rejected '{}': {}", request.service, e);
        }

        let clock = self.clock.tick();
        Outcome {
            response: Response::from_result(request.service, result, clock),
            new_member,
        }
    }

    /// Reply to a frame that could not be decoded as a request.
    pub fn reject_malformed(&mut self, reason: String) -> Response {
        let clock = self.clock.tick();
        Response::from_result("", Err(ProtocolError::Malformed(reason)), clock)
    }

    /// Re-derive the coordinator; see [`CoordinatorElector::maybe_announce`].
    pub fn announce(&mut self, now: Instant, force: bool) -> Option<CoordinatorAnnouncement> {
        let active = self.registry.list_active(now);
        self.elector.maybe_announce(&active, &mut self.clock, force)
    }

    fn rank(
        &mut self,
        data: RequestData,
        now: Instant,
    ) -> Result<(ResponseData, bool), ProtocolError> {
        let name = required(data.user, "user")?;
        let registration = self.registry.register_or_get_rank(&name, now);

        if registration.is_new {
            info!("🆕 Server '{}' registered with rank {}", name, registration.rank);
        }

        let data = ResponseData {
            rank: Some(registration.rank),
            ..ResponseData::default()
        };
        Ok((data, registration.is_new))
    }

    fn list(&self, now: Instant) -> ResponseData {
        ResponseData {
            list: Some(self.registry.list_active(now)),
            ..ResponseData::default()
        }
    }

    fn heartbeat(&mut self, data: RequestData, now: Instant) -> Result<ResponseData, ProtocolError> {
        let name = required(data.user, "user")?;
        if !self.registry.refresh_heartbeat(&name, now) {
            debug!("💓 Heartbeat from unknown server '{}' ignored", name);
        }
        Ok(ResponseData::default())
    }
}

// ============================================================================
// SERVICE - network endpoint and background election
// ============================================================================

#[derive(Clone)]
pub struct ReferenceService {
    config: ClusterConfig,
    state: Arc<Mutex<ReferenceState>>,
    /// Outbound link to the bus for coordinator announcements
    publisher: Publisher,
}

impl ReferenceService {
    pub fn new(config: ClusterConfig, publisher: Publisher) -> Self {
        let state = ReferenceState::new(config.timing.liveness_window());
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            publisher,
        }
    }

    pub fn state(&self) -> Arc<Mutex<ReferenceState>> {
        self.state.clone()
    }

    /// Bind the configured endpoint and serve forever.
    pub async fn run(&self) -> Result<()> {
        let addr = &self.config.endpoints.reference;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding reference service to {}", addr))?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve on an already bound listener. Returns only if a task dies.
    pub async fn serve(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("🚀 Reference service listening on {}", addr),
            Err(e) => warn!("⚠️  Reference service listening on unknown address: {}", e),
        }

        tokio::select! {
            _ = self.accept_loop(listener) => error!("❌ Listener task terminated"),
            _ = self.election_loop() => error!("❌ Election task terminated"),
        }
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("🔗 Reference service accepted connection from {}", addr);
                    let service = self.clone();
                    tokio::spawn(async move {
                        service.handle_connection(socket).await;
                    });
                }
                Err(e) => error!("❌ Accept error: {}", e),
            }
        }
    }

    /// Strict request/reply on one link: one reply per request, in order.
    async fn handle_connection(&self, socket: TcpStream) {
        let mut conn = Connection::new(socket);

        loop {
            let frame = match conn.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("🔌 Connection closed");
                    break;
                }
                Err(e) => {
                    warn!("⚠️  Dropping connection: {}", e);
                    break;
                }
            };

            let response = self.dispatch(&frame).await;
            if let Err(e) = conn.write_message(&response).await {
                error!("❌ Failed to send reply: {}", e);
                break;
            }
        }
    }

    async fn dispatch(&self, frame: &[u8]) -> Response {
        let mut state = self.state.lock().await;

        let request: Request = match serde_json::from_slice(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("⚠️  Malformed request: {}", e);
                return state.reject_malformed(e.to_string());
            }
        };

        info!("[Clock={}] Received: {}", state.clock(), request.service);
        let outcome = state.handle_request(request, Instant::now());
        info!(
            "[Clock={}] Replied: {}",
            state.clock(),
            outcome.response.service
        );
        drop(state);

        if outcome.new_member {
            self.schedule_announcement();
        }
        outcome.response
    }

    /// Announce shortly after a brand-new registration so the newcomer has
    /// finished connecting to the bus before it is told the coordinator.
    fn schedule_announcement(&self) {
        let service = self.clone();
        let delay = self.config.timing.announce_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service.announce(true).await;
        });
    }

    async fn election_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.timing.election_interval());
        loop {
            ticker.tick().await;
            self.announce(false).await;
        }
    }

    async fn announce(&self, force: bool) {
        let mut state = self.state.lock().await;
        if let Some(announcement) = state.announce(Instant::now(), force) {
            self.publisher.publish(COORDINATOR_TOPIC, &announcement);
        }
    }
}
