// Control messages: the relay's own framing around forwarded payloads.
//
// Every packet exchanged with the relay after the handshake is a
// `ControlMessage`. Wire layout, in order:
//
//   [1 byte kind][8 bytes author identity, little-endian][payload...]
//
// The payload has no length prefix; it is "everything after the header",
// with the transport's message framing supplying the boundary. The relay
// never looks inside the payload.
//
// Kind values are fixed for a deployment: Connected=0, Disconnected=1,
// Data=2, KickFromRelay=3. Any other byte decodes to `Unsupported` so that
// newer peers can introduce kinds without breaking older ones; consumers
// ignore them.

use crate::error::ProtocolError;
use crate::types::ClientIdentity;

/// Size of the fixed control header (kind + author).
pub const HEADER_LEN: usize = 1 + 8;

/// What a control message means.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// A member joined (relay-originated only).
    Connected,
    /// A member left (relay-originated only).
    Disconnected,
    /// Opaque application payload.
    Data,
    /// Host asks the relay to drop the member named in the author field.
    KickFromRelay,
    /// A kind this build does not know. Carried through decode so callers
    /// can log it; never acted on.
    Unsupported(UnknownKind),
}

/// A kind byte outside the known range. Only `ControlKind::from_byte` makes
/// one, so it never shadows a known kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnknownKind(u8);

impl UnknownKind {
    pub fn byte(self) -> u8 {
        self.0
    }
}

impl ControlKind {
    pub fn to_byte(self) -> u8 {
        match self {
            ControlKind::Connected => 0,
            ControlKind::Disconnected => 1,
            ControlKind::Data => 2,
            ControlKind::KickFromRelay => 3,
            ControlKind::Unsupported(unknown) => unknown.0,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => ControlKind::Connected,
            1 => ControlKind::Disconnected,
            2 => ControlKind::Data,
            3 => ControlKind::KickFromRelay,
            other => ControlKind::Unsupported(UnknownKind(other)),
        }
    }
}

/// A decoded control message.
///
/// For `Data` travelling relay → peer, `author` is the sender's identity as
/// stamped by the relay. For `KickFromRelay` travelling peer → relay, it
/// names the member to remove.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: ControlKind,
    pub author: ClientIdentity,
    pub payload: Vec<u8>,
}

impl ControlMessage {
    pub fn connected(member: ClientIdentity) -> Self {
        Self {
            kind: ControlKind::Connected,
            author: member,
            payload: Vec::new(),
        }
    }

    pub fn disconnected(member: ClientIdentity) -> Self {
        Self {
            kind: ControlKind::Disconnected,
            author: member,
            payload: Vec::new(),
        }
    }

    pub fn data(author: ClientIdentity, payload: Vec<u8>) -> Self {
        Self {
            kind: ControlKind::Data,
            author,
            payload,
        }
    }

    pub fn kick(target: ClientIdentity) -> Self {
        Self {
            kind: ControlKind::KickFromRelay,
            author: target,
            payload: Vec::new(),
        }
    }

    /// Serialize to the wire layout described at the top of this module.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind.to_byte());
        buf.extend_from_slice(&self.author.0.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse the wire layout. Fails only when the header is truncated.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::MalformedMessage {
                len: bytes.len(),
                needed: HEADER_LEN,
            });
        }
        let kind = ControlKind::from_byte(bytes[0]);
        let mut author = [0u8; 8];
        author.copy_from_slice(&bytes[1..HEADER_LEN]);
        Ok(Self {
            kind,
            author: ClientIdentity(u64::from_le_bytes(author)),
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}
