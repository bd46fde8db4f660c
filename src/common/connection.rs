//! # Framed Connection
//!
//! Wraps any async byte stream with the cluster's message framing.
//!
//! ## Wire Protocol
//!
//! Every message is a 4-byte big-endian length prefix followed by JSON:
//! ```text
//! [4 bytes: message length] [N bytes: JSON message data]
//! ```
//!
//! The same framing carries request/response envelopes, bus frames, and the
//! router's opaque relayed payloads.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Maximum allowed frame size (16MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed JSON connection over a stream (a [`TcpStream`] by default).
pub struct Connection<S = TcpStream> {
    stream: S,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl Connection<TcpStream> {
    /// Open a TCP connection to `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (Connection<OwnedReadHalf>, Connection<OwnedWriteHalf>) {
        let (read, write) = self.stream.into_split();
        (Connection::new(read), Connection::new(write))
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// Read one raw frame.
    ///
    /// # Returns
    /// - `Ok(Some(bytes))`: a complete frame body
    /// - `Ok(None)`: the peer closed the stream at a frame boundary
    /// - `Err`: oversized frame or I/O failure mid-frame
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut length_buf = [0u8; 4];
        let mut filled = 0;

        // EOF is clean only before the first byte of the length prefix
        while filled < length_buf.len() {
            let n = self.stream.read(&mut length_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!("connection closed mid-frame ({} of 4 length bytes)", filled);
            }
            filled += n;
        }

        let length = u32::from_be_bytes(length_buf) as usize;
        if length > MAX_MESSAGE_SIZE {
            bail!(
                "message too large: {} bytes (max: {} bytes)",
                length,
                MAX_MESSAGE_SIZE
            );
        }

        let mut data = vec![0u8; length];
        self.stream
            .read_exact(&mut data)
            .await
            .context("connection closed mid-frame")?;
        Ok(Some(data))
    }

    /// Read and decode one message. Decoding failures are errors.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_frame().await? {
            Some(data) => {
                let message = serde_json::from_slice(&data).context("malformed frame")?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// Write one raw frame and flush.
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE {
            bail!("refusing to send {} byte frame", data.len());
        }
        let length = data.len() as u32;

        self.stream.write_all(&length.to_be_bytes()).await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Encode and write one message.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let data = serde_json::to_vec(message)?;
        self.write_frame(&data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::{Request, RequestData};

    #[tokio::test]
    async fn message_survives_the_wire() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = Connection::new(a);
        let mut reader = Connection::new(b);

        let request = Request::new(
            "login",
            RequestData {
                user: Some("alice".into()),
                ..RequestData::default()
            },
            3,
        );
        writer.write_message(&request).await.unwrap();

        let received: Request = reader.read_message().await.unwrap().unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = Connection::new(b);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_length_prefix_is_an_error() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        let mut reader = Connection::new(b);

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("mid-frame"));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let mut reader = Connection::new(b);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = Connection::new(a);
        writer.write_frame(b"not json").await.unwrap();
        let mut reader = Connection::new(b);
        assert!(reader.read_message::<Request>().await.is_err());
    }
}
