//! Protocol-level errors reported to callers as `"erro"` responses.
//!
//! Infrastructure failures (I/O, connectivity) travel as `anyhow::Error` and
//! are never shown to callers.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("channel already exists: {0}")]
    ChannelExists(String),

    #[error("channel does not exist: {0}")]
    UnknownChannel(String),

    #[error("user does not exist: {0}")]
    UnknownUser(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Take a required request field or report which one is missing.
pub fn required(value: Option<String>, field: &'static str) -> Result<String, ProtocolError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProtocolError::MissingField(field)),
    }
}
