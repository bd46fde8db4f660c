//! # Server Middleware - Cluster Plumbing for a Chat Server
//!
//! The middleware connects a [`ChatCore`] to the rest of the cluster:
//!
//! ### 1. Registration
//! - Asks the reference service for a rank (random fallback if unreachable)
//! - Fetches the initial list of live servers
//!
//! ### 2. Heartbeat
//! - Sends `heartbeat` to the reference service every `heartbeat_interval`
//! - Failures are logged and retried on the next period
//!
//! ### 3. Request Link
//! - Attaches to the router backend and serves strict request/reply
//!
//! ### 4. Subscriptions
//! - Receives coordinator announcements and peer replication events
//!
//! ### 5. Dispatch Loop
//! - Single consumer of requests and publications, waiting with a bounded
//!   timeout; every message is applied to the core under its lock
//!
//! ## Message Flow
//!
//! ```text
//! Router  -> Request link  -> Dispatch loop -> ChatCore -> reply
//! Bus     -> Subscriptions -> Dispatch loop -> ChatCore (replication / coordinator)
//! ChatCore -> Publisher -> Bus (channel/user topics, replication)
//! ```

use anyhow::Result;
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::client::{Publisher, RequestClient, Subscriber};
use crate::common::config::ClusterConfig;
use crate::common::connection::Connection;
use crate::common::messages::{
    Request, RequestData, Response, COORDINATOR_TOPIC, REPLICATION_TOPIC,
};
use crate::server::server::ChatCore;
use crate::server::store::ChatStore;

/// Wait between reconnect attempts to the router or bus.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Inbound messages waiting for the dispatch loop.
const INBOUND_QUEUE: usize = 256;

/// Something for the dispatch loop to handle.
enum Inbound {
    /// A raw request frame and where to send its reply
    Request(Vec<u8>, oneshot::Sender<Response>),
    /// A bus publication on a subscribed topic
    Publication(String, Value),
}

#[derive(Clone)]
pub struct ChatServerMiddleware {
    config: ClusterConfig,
    name: String,
    core: Arc<Mutex<ChatCore>>,
}

impl ChatServerMiddleware {
    /// Open the store under `<data_dir>/<name>` and connect the bus publisher.
    pub fn new(config: ClusterConfig, name: String) -> Result<Self> {
        config.timing.validate()?;
        let store = ChatStore::open(config.storage.data_dir.join(&name))?;
        let publisher = Publisher::connect(config.endpoints.bus_publish.clone());
        let core = ChatCore::new(name, store, publisher);
        Ok(Self::with_core(config, core))
    }

    pub fn with_core(config: ClusterConfig, core: ChatCore) -> Self {
        Self {
            name: core.name().to_string(),
            config,
            core: Arc::new(Mutex::new(core)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the core, for inspection.
    pub fn core(&self) -> Arc<Mutex<ChatCore>> {
        self.core.clone()
    }

    /// Main entry point - registers, then runs all server tasks forever.
    pub async fn run(&self) {
        info!("🚀 Server {} starting", self.name);

        // Subscribe before registering so the announcement that follows our
        // registration is not missed.
        let subscriber = match Subscriber::connect(
            &self.config.endpoints.bus_subscribe,
            &subscribed_topics(),
        )
        .await
        {
            Ok(subscriber) => Some(subscriber),
            Err(e) => {
                warn!("⚠️  Bus unreachable at startup, will retry: {}", e);
                None
            }
        };

        let mut reference = RequestClient::new(
            self.config.endpoints.reference.clone(),
            self.config.timing.request_timeout(),
        );
        self.register(&mut reference).await;
        self.fetch_members(&mut reference).await;

        {
            let core = self.core.lock().await;
            info!(
                "✅ Server {} (rank={:?}) started, Clock: {}",
                self.name,
                core.rank(),
                core.clock()
            );
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        tokio::select! {
            _ = self.receive_requests(inbound_tx.clone()) => error!("❌ Request link task terminated"),
            _ = self.receive_publications(subscriber, inbound_tx) => error!("❌ Subscription task terminated"),
            _ = self.send_heartbeats(reference) => error!("❌ Heartbeat task terminated"),
            _ = self.dispatch_loop(inbound_rx) => error!("❌ Dispatch loop terminated"),
        }
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Obtain a rank from the reference service, or pick a random one.
    async fn register(&self, reference: &mut RequestClient) {
        let request = self.outbound_request("rank").await;

        let rank = match reference.request(&request).await {
            Ok(response) => {
                self.core.lock().await.observe(response.data.clock);
                if response.data.rank.is_none() {
                    warn!(
                        "⚠️  Reference service refused registration: {}",
                        response.data.description.unwrap_or_default()
                    );
                }
                response.data.rank
            }
            Err(e) => {
                warn!("⚠️  Registration with reference service failed: {:#}", e);
                None
            }
        };

        let rank = rank.unwrap_or_else(|| {
            let fallback = rand::thread_rng().gen_range(1..=1000);
            warn!("🎲 Server {} using random rank {}", self.name, fallback);
            fallback
        });

        let mut core = self.core.lock().await;
        core.set_rank(rank);
        info!(
            "🏷️  Server {} rank: {}, Clock: {}",
            self.name,
            rank,
            core.clock()
        );
    }

    async fn fetch_members(&self, reference: &mut RequestClient) {
        let request = self.outbound_request("list").await;

        match reference.request(&request).await {
            Ok(response) => {
                let mut core = self.core.lock().await;
                core.observe(response.data.clock);
                let members = response.data.list.unwrap_or_default();
                info!("📋 Server {} sees {} active server(s)", self.name, members.len());
                core.set_members(members);
            }
            Err(e) => warn!("⚠️  Could not fetch server list: {:#}", e),
        }
    }

    /// Build a request to the reference service, ticking the clock.
    async fn outbound_request(&self, service: &str) -> Request {
        let clock = self.core.lock().await.tick();
        let data = RequestData {
            user: Some(self.name.clone()),
            ..RequestData::default()
        };
        Request::new(service, data, clock)
    }

    // ========================================================================
    // TASK 1: Heartbeat to the reference service
    // ========================================================================

    async fn send_heartbeats(&self, mut reference: RequestClient) {
        let mut ticker = tokio::time::interval(self.config.timing.heartbeat_interval());
        // the first tick completes immediately; registration just refreshed us
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let request = self.outbound_request("heartbeat").await;
            match reference.request(&request).await {
                Ok(response) => {
                    let clock = self.core.lock().await.observe(response.data.clock);
                    debug!("💓 Server {} heartbeat acknowledged (clock {})", self.name, clock);
                }
                Err(e) => warn!(
                    "⚠️  Heartbeat to {} failed, retrying next period: {:#}",
                    reference.addr(),
                    e
                ),
            }
        }
    }

    // ========================================================================
    // TASK 2: Request link to the router
    // ========================================================================

    /// Attach to the router backend and forward each request to the dispatch
    /// loop, writing its reply before reading the next one.
    async fn receive_requests(&self, inbound: mpsc::Sender<Inbound>) {
        let addr = &self.config.endpoints.router_backend;

        loop {
            let mut conn = match Connection::connect(addr).await {
                Ok(conn) => {
                    info!("🤝 Server {} attached to router at {}", self.name, addr);
                    conn
                }
                Err(e) => {
                    debug!("❌ Router at {} unreachable: {}", addr, e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            loop {
                let frame = match conn.read_frame().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        warn!("⚠️  Router closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("⚠️  Lost router connection: {}", e);
                        break;
                    }
                };

                let (reply_tx, reply_rx) = oneshot::channel();
                if inbound.send(Inbound::Request(frame, reply_tx)).await.is_err() {
                    return;
                }
                let Ok(response) = reply_rx.await else {
                    return;
                };

                if let Err(e) = conn.write_message(&response).await {
                    warn!("⚠️  Failed to send reply to router: {}", e);
                    break;
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    // ========================================================================
    // TASK 3: Bus subscriptions
    // ========================================================================

    async fn receive_publications(
        &self,
        mut subscriber: Option<Subscriber>,
        inbound: mpsc::Sender<Inbound>,
    ) {
        let addr = &self.config.endpoints.bus_subscribe;

        loop {
            let mut link = match subscriber.take() {
                Some(link) => link,
                None => match Subscriber::connect(addr, &subscribed_topics()).await {
                    Ok(link) => {
                        info!("📡 Server {} subscribed at {}", self.name, addr);
                        link
                    }
                    Err(e) => {
                        debug!("❌ Bus at {} unreachable: {}", addr, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };

            loop {
                match link.recv().await {
                    Ok(Some((topic, payload))) => {
                        if inbound
                            .send(Inbound::Publication(topic, payload))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => {
                        warn!("⚠️  Bus closed the subscription");
                        break;
                    }
                    Err(e) => {
                        warn!("⚠️  Lost bus subscription: {}", e);
                        break;
                    }
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    // ========================================================================
    // TASK 4: Dispatch loop
    // ========================================================================

    /// Handle requests and publications one at a time, in arrival order.
    async fn dispatch_loop(&self, mut inbound: mpsc::Receiver<Inbound>) {
        let poll_timeout = self.config.timing.poll_timeout();

        loop {
            let next = match tokio::time::timeout(poll_timeout, inbound.recv()).await {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(_) => continue,
            };

            match next {
                Inbound::Request(frame, reply) => {
                    let response = self.dispatch(&frame).await;
                    if reply.send(response).is_err() {
                        warn!("⚠️  Requester went away before the reply");
                    }
                }
                Inbound::Publication(topic, payload) => {
                    self.core.lock().await.handle_publication(&topic, payload);
                }
            }
        }
    }

    async fn dispatch(&self, frame: &[u8]) -> Response {
        let mut core = self.core.lock().await;

        let request: Request = match serde_json::from_slice(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("⚠️  [{}] Malformed request: {}", self.name, e);
                return core.reject_malformed(e.to_string());
            }
        };

        info!(
            "[{} Clock={}] Received: {}",
            self.name,
            core.clock(),
            request.service
        );
        core.handle_request(request)
    }
}

/// Topics every chat server listens to.
fn subscribed_topics() -> Vec<String> {
    vec![COORDINATOR_TOPIC.to_string(), REPLICATION_TOPIC.to_string()]
}
