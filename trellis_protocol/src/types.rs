// Core ID types for the relay protocol.
//
// These are lightweight newtypes used by both `message.rs` (control messages)
// and the relay's session management (`trellis_relay::session`). They are
// relay-scoped identifiers: the relay assigns compact integer identities to
// session members, and sessions are addressed by short human-entered join
// codes.
//
// `DeliveryClass` names the per-channel guarantee a payload asks the
// transport for. The relay never changes the class of a forwarded message.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Relay-assigned identity of a session member, unique within its session.
///
/// Identity `0` is reserved for the session's host (the authoritative peer).
/// Every other member gets a non-zero identity from the session's counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIdentity(pub u64);

impl ClientIdentity {
    /// The host slot.
    pub const HOST: ClientIdentity = ClientIdentity(0);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Characters a join code may contain.
pub const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Upper bound on join code length accepted from the wire.
pub const MAX_JOIN_CODE_LEN: usize = 32;

/// Short uppercase code identifying a live session.
///
/// Construct through [`JoinCode::parse`], which normalises case and rejects
/// anything outside [`JOIN_CODE_ALPHABET`]. Deserialisation goes through the
/// same check, so a `JoinCode` read off the wire is always well formed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JoinCode(String);

impl JoinCode {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let code = raw.trim().to_ascii_uppercase();
        if code.is_empty() || code.len() > MAX_JOIN_CODE_LEN {
            return Err(ProtocolError::InvalidJoinCode(raw.to_string()));
        }
        if !code.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b)) {
            return Err(ProtocolError::InvalidJoinCode(raw.to_string()));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JoinCode {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JoinCode> for String {
    fn from(code: JoinCode) -> Self {
        code.0
    }
}

/// Per-channel delivery guarantee requested from the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryClass {
    /// May be lost, duplicated or reordered.
    Unreliable,
    /// May be lost; stale packets are discarded so order is preserved.
    Sequenced,
    /// Always arrives, in any order.
    ReliableUnordered,
    /// Always arrives, in send order.
    ReliableOrdered,
}

impl DeliveryClass {
    pub const ALL: [DeliveryClass; 4] = [
        DeliveryClass::Unreliable,
        DeliveryClass::Sequenced,
        DeliveryClass::ReliableUnordered,
        DeliveryClass::ReliableOrdered,
    ];

    pub fn to_byte(self) -> u8 {
        match self {
            DeliveryClass::Unreliable => 0,
            DeliveryClass::Sequenced => 1,
            DeliveryClass::ReliableUnordered => 2,
            DeliveryClass::ReliableOrdered => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DeliveryClass::Unreliable),
            1 => Some(DeliveryClass::Sequenced),
            2 => Some(DeliveryClass::ReliableUnordered),
            3 => Some(DeliveryClass::ReliableOrdered),
            _ => None,
        }
    }

    /// Whether a real transport would retransmit a lost packet on this class.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryClass::ReliableUnordered | DeliveryClass::ReliableOrdered
        )
    }

    /// Whether the transport preserves send order on this class.
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            DeliveryClass::Sequenced | DeliveryClass::ReliableOrdered
        )
    }
}
