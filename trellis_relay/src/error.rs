// Error taxonomy for the relay and the client adapter.
//
// Relay-side failures that concern a single message or member
// (`MalformedMessage`, unauthorised kicks, per-member send failures) are
// logged where they happen and never surface here as a whole-operation
// failure. The enums below cover what callers actually act on: startup and
// configuration, registry lookups, admission, the CRUD surface, and the
// client's connect/send path.

use std::io;
use std::time::Duration;

use thiserror::Error;
use trellis_protocol::{JoinCode, ProtocolError, RejectReason};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("join code length must be a positive integer, got {0:?}")]
    InvalidJoinCodeLength(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("simulated loss must be 0-100 percent, got {0}")]
    LossPercent(u8),

    #[error("simulated latency min {min:?} exceeds max {max:?}")]
    LatencyRange { min: Duration, max: Duration },

    #[error("max connect attempts must be at least 1")]
    NoConnectAttempts,

    #[error("ping interval {ping:?} must be shorter than disconnect timeout {timeout:?}")]
    PingInterval { ping: Duration, timeout: Duration },

    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}

/// Failure to start the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure to hand a frame to one peer's outbound queue.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,

    #[error("outbound queue full")]
    QueueFull,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    SessionNotFound(JoinCode),

    #[error("no free join code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("session is closed")]
    SessionClosed,

    #[error("could not deliver welcome to the joining peer")]
    WelcomeUndeliverable,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0:?} not found")]
    NotFound(String),

    #[error("session destruction is disabled")]
    DestroyDisabled,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from the client-side transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no relay connection")]
    NotConnected,

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("relay closed the connection during the handshake")]
    HandshakeClosed,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to a relay")]
    NotConnected,

    #[error("gave up after {attempts} connection attempts")]
    ConnectExhausted { attempts: u32 },

    #[error("relay rejected the join: {0:?}")]
    Rejected(RejectReason),

    #[error("adapter has shut down")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
