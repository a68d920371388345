// Session state for the relay.
//
// `RelaySession` is one join code's worth of state: the members currently
// attached, each keyed by the `ClientIdentity` the session assigned, plus the
// identity counter. `server.rs` keeps every session behind its own mutex, so
// each method here runs with exclusive access and no internal locking.
//
// Member lifecycle: a connection is *pending* while `server.rs` runs the
// handshake, *active* once `admit` has put it in `members`, and *left* once
// `leave` has taken it out. Pending connections never touch the session, so
// the key set of `members` is exactly the set of active members.
//
// Key rules:
// - Identity 0 goes to the first admitted member, and only if it asked for
//   the host role. Everyone else draws from a counter that starts at 1 and
//   never rewinds, so identities are not reused while the session lives.
// - Forwarded `Data` carries the sender's assigned identity. Whatever the
//   sender put in the author field is overwritten.
// - Only the host may kick. A kick is a forced leave.
// - The host leaving ends the session: every remaining member is told
//   `Disconnected(0)` and closed.
//
// Writing to members: each `PeerConnection` holds an `Arc<dyn PeerLink>`
// whose `send` only enqueues. A failed send to one member is logged and the
// broadcast moves on; the member's reader thread will notice the dead link
// and call `leave` on its own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use trellis_protocol::{
    ClientIdentity, ControlKind, ControlMessage, DeliveryClass, JoinCode, JoinResponse, JoinRole,
};

use crate::error::AdmitError;
use crate::link::PeerLink;

/// Announcements and teardown notices always travel on the strictest class
/// so they stay ordered with respect to each other.
const LIFECYCLE_CLASS: DeliveryClass = DeliveryClass::ReliableOrdered;

/// One active member's physical connection.
pub struct PeerConnection {
    identity: ClientIdentity,
    link: Arc<dyn PeerLink>,
    joined_at: Instant,
}

impl PeerConnection {
    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    /// Round trip through this member's link.
    pub fn rtt(&self) -> Duration {
        self.link.ping() * 2
    }

    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }
}

/// Result of a successful `admit`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    pub identity: ClientIdentity,
    /// Members that were already active when this one joined.
    pub existing: Vec<ClientIdentity>,
}

/// What `dispatch` did with an inbound control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Forwarded { recipients: usize },
    Kicked(ClientIdentity),
    Ignored(Ignored),
    /// The message ended the session (the host kicked itself).
    SessionClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ignored {
    /// Sender is not (or no longer) an active member.
    NotMember,
    /// `Connected` / `Disconnected` are only ever produced by the relay.
    Untrusted(ControlKind),
    Unsupported(u8),
    UnauthorizedKick,
    UnknownKickTarget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    NotMember,
    Left,
    /// The host left and the session was torn down.
    SessionClosed,
}

pub struct RelaySession {
    join_code: JoinCode,
    members: BTreeMap<ClientIdentity, PeerConnection>,
    next_identity: u64,
    ever_admitted: bool,
    created_at: Instant,
    empty_since: Option<Instant>,
    closed: bool,
}

impl RelaySession {
    pub fn new(join_code: JoinCode) -> Self {
        let now = Instant::now();
        Self {
            join_code,
            members: BTreeMap::new(),
            next_identity: 1,
            ever_admitted: false,
            created_at: now,
            empty_since: Some(now),
            closed: false,
        }
    }

    /// Admit a connection whose handshake named this session.
    ///
    /// The welcome is queued on `link` before anyone else hears about the
    /// newcomer, so the newcomer's view always starts with its own identity.
    /// Existing members get `Connected(identity)`; the newcomer does not.
    pub fn admit(
        &mut self,
        link: Arc<dyn PeerLink>,
        role: JoinRole,
    ) -> Result<Admission, AdmitError> {
        if self.closed {
            return Err(AdmitError::SessionClosed);
        }

        let identity = if role == JoinRole::Host && !self.ever_admitted {
            ClientIdentity::HOST
        } else {
            let id = ClientIdentity(self.next_identity);
            self.next_identity += 1;
            id
        };
        self.ever_admitted = true;

        let existing = self.identities();
        let welcome = JoinResponse::Welcome {
            identity,
            members: existing.clone(),
        }
        .to_bytes()
        .map_err(|_| AdmitError::WelcomeUndeliverable)?;
        if let Err(e) = link.send(LIFECYCLE_CLASS, welcome) {
            warn!(session = %self.join_code, "welcome to {identity} failed: {e}");
            link.close();
            return Err(AdmitError::WelcomeUndeliverable);
        }

        self.broadcast(None, &ControlMessage::connected(identity), LIFECYCLE_CLASS);
        self.members.insert(
            identity,
            PeerConnection {
                identity,
                link,
                joined_at: Instant::now(),
            },
        );
        self.empty_since = None;
        info!(session = %self.join_code, "{identity} joined ({} members)", self.members.len());

        Ok(Admission { identity, existing })
    }

    /// Handle one decoded control message from `sender`.
    pub fn dispatch(
        &mut self,
        sender: ClientIdentity,
        class: DeliveryClass,
        msg: ControlMessage,
    ) -> Dispatch {
        if !self.members.contains_key(&sender) {
            return Dispatch::Ignored(Ignored::NotMember);
        }
        match msg.kind {
            ControlKind::Data => {
                if msg.author != sender {
                    debug!(session = %self.join_code, "{sender} claimed to be {}; restamped", msg.author);
                }
                let stamped = ControlMessage::data(sender, msg.payload);
                let recipients = self.broadcast(Some(sender), &stamped, class);
                Dispatch::Forwarded { recipients }
            }
            ControlKind::KickFromRelay => self.kick(sender, msg.author),
            kind @ (ControlKind::Connected | ControlKind::Disconnected) => {
                warn!(session = %self.join_code, "ignoring {kind:?} sent by {sender}");
                Dispatch::Ignored(Ignored::Untrusted(kind))
            }
            ControlKind::Unsupported(unknown) => {
                let byte = unknown.byte();
                debug!(session = %self.join_code, "ignoring unsupported kind {byte} from {sender}");
                Dispatch::Ignored(Ignored::Unsupported(byte))
            }
        }
    }

    /// Forcibly remove `target`. Only the host may do this.
    pub fn kick(&mut self, sender: ClientIdentity, target: ClientIdentity) -> Dispatch {
        if !sender.is_host() {
            warn!(session = %self.join_code, "{sender} tried to kick {target}; only the host may kick");
            return Dispatch::Ignored(Ignored::UnauthorizedKick);
        }
        if !self.members.contains_key(&target) {
            debug!(session = %self.join_code, "kick target {target} is not a member");
            return Dispatch::Ignored(Ignored::UnknownKickTarget);
        }
        info!(session = %self.join_code, "host kicked {target}");
        match self.leave(target) {
            LeaveOutcome::SessionClosed => Dispatch::SessionClosed,
            _ => Dispatch::Kicked(target),
        }
    }

    /// Remove a member after a disconnect, transport failure or kick.
    ///
    /// The member's link is closed. If it was the host the whole session
    /// goes with it.
    pub fn leave(&mut self, identity: ClientIdentity) -> LeaveOutcome {
        let Some(conn) = self.members.remove(&identity) else {
            return LeaveOutcome::NotMember;
        };
        conn.link.close();

        if identity.is_host() {
            info!(session = %self.join_code, "host left; closing session");
            self.teardown();
            return LeaveOutcome::SessionClosed;
        }

        info!(session = %self.join_code, "{identity} left ({} members)", self.members.len());
        self.broadcast(None, &ControlMessage::disconnected(identity), LIFECYCLE_CLASS);
        if self.members.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        LeaveOutcome::Left
    }

    /// Tear the session down from outside (registry destroy or relay stop).
    /// Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            info!(session = %self.join_code, "closing session");
            self.teardown();
        }
    }

    /// Tell everyone left that the authority is gone, then drop them.
    fn teardown(&mut self) {
        self.closed = true;
        self.broadcast(
            None,
            &ControlMessage::disconnected(ClientIdentity::HOST),
            LIFECYCLE_CLASS,
        );
        for conn in std::mem::take(&mut self.members).into_values() {
            conn.link.close();
        }
        self.empty_since = Some(Instant::now());
    }

    /// Send `msg` to every active member except `except`. Returns how many
    /// sends were accepted.
    fn broadcast(
        &self,
        except: Option<ClientIdentity>,
        msg: &ControlMessage,
        class: DeliveryClass,
    ) -> usize {
        let bytes = msg.encode();
        let mut delivered = 0;
        for (id, conn) in &self.members {
            if Some(*id) == except {
                continue;
            }
            match conn.link.send(class, bytes.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(session = %self.join_code, "send to {id} failed: {e}"),
            }
        }
        delivered
    }

    pub fn join_code(&self) -> &JoinCode {
        &self.join_code
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Active member identities, ascending.
    pub fn identities(&self) -> Vec<ClientIdentity> {
        self.members.keys().copied().collect()
    }

    pub fn contains(&self, identity: ClientIdentity) -> bool {
        self.members.contains_key(&identity)
    }

    pub fn member(&self, identity: ClientIdentity) -> Option<&PeerConnection> {
        self.members.get(&identity)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// True once the session has had no members for at least `grace`.
    pub fn is_expired(&self, now: Instant, grace: Duration) -> bool {
        self.members.is_empty()
            && self
                .empty_since
                .is_some_and(|since| now.saturating_duration_since(since) >= grace)
    }
}
