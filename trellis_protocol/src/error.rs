// Errors raised while decoding protocol data.
//
// Decoding failures are never fatal to a connection: the relay logs and drops
// a `MalformedMessage`, and a bad join code simply fails the handshake.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the fixed control header.
    #[error("malformed control message: {len} bytes, header needs {needed}")]
    MalformedMessage { len: usize, needed: usize },

    #[error("invalid join code: {0:?}")]
    InvalidJoinCode(String),

    #[error("handshake encoding: {0}")]
    Handshake(#[from] serde_json::Error),
}
