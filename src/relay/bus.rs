//! # Publish/Subscribe Bus
//!
//! Publishers connect to one endpoint and send `publish` frames; subscribers
//! connect to the other, send `subscribe` frames with topic prefixes, and
//! receive every publication whose topic starts with one of them.
//!
//! There is no retention: a subscriber only sees what is published while it
//! is connected and subscribed. A subscriber that falls too far behind loses
//! the oldest publications.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::common::config::ClusterConfig;
use crate::common::connection::Connection;
use crate::common::messages::BusFrame;

/// Publications buffered per subscriber before it starts losing them.
const FANOUT_CAPACITY: usize = 1024;

/// One publication, kept as the exact frame the publisher sent.
#[derive(Debug, Clone)]
struct Delivery {
    topic: String,
    frame: Arc<Vec<u8>>,
}

/// Whether `topic` is selected by any of `prefixes`.
pub fn matches(prefixes: &[String], topic: &str) -> bool {
    prefixes.iter().any(|prefix| topic.starts_with(prefix.as_str()))
}

/// Bind the configured endpoints and relay forever.
pub async fn run(config: &ClusterConfig) -> Result<()> {
    let publish = TcpListener::bind(&config.endpoints.bus_publish)
        .await
        .with_context(|| format!("binding bus publish endpoint {}", config.endpoints.bus_publish))?;
    let subscribe = TcpListener::bind(&config.endpoints.bus_subscribe)
        .await
        .with_context(|| {
            format!("binding bus subscribe endpoint {}", config.endpoints.bus_subscribe)
        })?;
    serve(publish, subscribe).await;
    Ok(())
}

/// Relay between already bound listeners. Returns only if a task dies.
pub async fn serve(publish: TcpListener, subscribe: TcpListener) {
    if let (Ok(publ), Ok(sub)) = (publish.local_addr(), subscribe.local_addr()) {
        info!("🚀 Bus: publishers on {}, subscribers on {}", publ, sub);
    }

    let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);

    tokio::select! {
        _ = accept_publishers(publish, fanout.clone()) => error!("❌ Publisher listener terminated"),
        _ = accept_subscribers(subscribe, fanout) => error!("❌ Subscriber listener terminated"),
    }
}

async fn accept_publishers(listener: TcpListener, fanout: broadcast::Sender<Delivery>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("🔗 Publisher connected from {}", addr);
                tokio::spawn(handle_publisher(socket, fanout.clone()));
            }
            Err(e) => error!("❌ Publisher accept error: {}", e),
        }
    }
}

async fn accept_subscribers(listener: TcpListener, fanout: broadcast::Sender<Delivery>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("🔗 Subscriber connected from {}", addr);
                // receive from the moment of connection, before any subscribe
                // frame is read
                let deliveries = fanout.subscribe();
                tokio::spawn(handle_subscriber(socket, deliveries));
            }
            Err(e) => error!("❌ Subscriber accept error: {}", e),
        }
    }
}

async fn handle_publisher(socket: TcpStream, fanout: broadcast::Sender<Delivery>) {
    let mut conn = Connection::new(socket);

    loop {
        let frame = match conn.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("⚠️  Dropping publisher: {}", e);
                break;
            }
        };

        match serde_json::from_slice::<BusFrame>(&frame) {
            Ok(BusFrame::Publish { topic, .. }) => {
                debug!("📨 Publication on '{}'", topic);
                // no subscribers is not an error
                let _ = fanout.send(Delivery {
                    topic,
                    frame: Arc::new(frame),
                });
            }
            Ok(BusFrame::Subscribe { .. }) => {
                warn!("⚠️  Ignoring subscribe frame on publisher link");
            }
            Err(e) => warn!("⚠️  Ignoring malformed publication: {}", e),
        }
    }
}

async fn handle_subscriber(socket: TcpStream, mut deliveries: broadcast::Receiver<Delivery>) {
    let (mut reader, mut writer) = Connection::new(socket).into_split();
    let (topics_tx, mut topics_rx) = mpsc::unbounded_channel::<Vec<String>>();

    tokio::spawn(async move {
        loop {
            match reader.read_message::<BusFrame>().await {
                Ok(Some(BusFrame::Subscribe { topics })) => {
                    if topics_tx.send(topics).is_err() {
                        return;
                    }
                }
                Ok(Some(BusFrame::Publish { .. })) => {
                    warn!("⚠️  Ignoring publish frame on subscriber link");
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("⚠️  Dropping subscriber: {}", e);
                    return;
                }
            }
        }
    });

    let mut prefixes: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            update = topics_rx.recv() => match update {
                Some(topics) => {
                    debug!("📡 Subscriber added prefixes {:?}", topics);
                    prefixes.extend(topics);
                }
                None => return,
            },
            delivery = deliveries.recv() => match delivery {
                Ok(delivery) => {
                    if !matches(&prefixes, &delivery.topic) {
                        continue;
                    }
                    if let Err(e) = writer.write_frame(&delivery.frame).await {
                        debug!("🔌 Subscriber gone: {}", e);
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("⚠️  Slow subscriber lost {} publication(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn prefix_matching() {
        let subscribed = prefixes(&["servers", "gen"]);
        assert!(matches(&subscribed, "servers"));
        assert!(matches(&subscribed, "general"));
        assert!(!matches(&subscribed, "replication"));
    }

    #[test]
    fn empty_prefix_matches_everything() {
        assert!(matches(&prefixes(&[""]), "anything"));
        assert!(!matches(&[], "anything"));
    }
}
