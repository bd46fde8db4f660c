//! # Request Client
//!
//! Strict request/reply client used by chat servers to reach the reference
//! service and by the CLI to reach the router.
//!
//! The TCP link is opened lazily on the first request and dropped after any
//! failure or timeout, so the next request starts from a fresh connection.
//! A stale reply can therefore never be matched with a later request.

use anyhow::{bail, Context, Result};
use log::debug;
use std::time::Duration;

use crate::common::connection::Connection;
use crate::common::messages::{Request, Response};

pub struct RequestClient {
    /// Address of the request/reply endpoint
    addr: String,
    /// How long one request waits for its reply
    timeout: Duration,
    conn: Option<Connection>,
}

impl RequestClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            conn: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send `request` and wait for its reply.
    ///
    /// # Errors
    /// Connect failure, I/O failure, the peer closing the link, or no reply
    /// within the configured timeout.
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        match tokio::time::timeout(self.timeout, self.exchange(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.conn = None;
                Err(e)
            }
            Err(_) => {
                self.conn = None;
                bail!(
                    "request '{}' to {} timed out after {:?}",
                    request.service,
                    self.addr,
                    self.timeout
                )
            }
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response> {
        if self.conn.is_none() {
            let conn = Connection::connect(&self.addr)
                .await
                .with_context(|| format!("connecting to {}", self.addr))?;
            debug!("🔗 Connected to {}", self.addr);
            self.conn = Some(conn);
        }
        let Some(conn) = self.conn.as_mut() else {
            bail!("no connection to {}", self.addr);
        };

        conn.write_message(request).await?;
        match conn.read_message::<Response>().await? {
            Some(response) => Ok(response),
            None => bail!("{} closed the connection before replying", self.addr),
        }
    }
}
