// Connect-time handshake between a peer and the relay.
//
// The first message frame a peer sends is a `JoinRequest` naming the session
// it wants and whether it intends to be the session's host. The relay answers
// with exactly one `JoinResponse`. After a `Welcome`, every message frame in
// either direction is a control message (see `message.rs`); after a
// `Rejected`, the relay closes the connection.
//
// Both are JSON (serde_json). They are sent once per connection, so the
// compact binary layout used for control messages buys nothing here.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ClientIdentity, JoinCode};

/// Bumped whenever the control-message layout or handshake changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Role a peer asks for when joining.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRole {
    /// Ask for identity 0. Granted only to the first member of a fresh session.
    Host,
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub protocol_version: u32,
    pub join_code: JoinCode,
    pub role: JoinRole,
}

impl JoinRequest {
    pub fn new(join_code: JoinCode, role: JoinRole) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            join_code,
            role,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Why the relay refused a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    SessionNotFound,
    MalformedRequest,
    ProtocolMismatch,
    /// The session was torn down while the peer was joining.
    SessionClosed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinResponse {
    /// Admitted. `members` lists the identities already in the session.
    Welcome {
        identity: ClientIdentity,
        members: Vec<ClientIdentity>,
    },
    Rejected { reason: RejectReason },
}

impl JoinResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
