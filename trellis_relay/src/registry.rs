// Join code -> session map.
//
// `SessionRegistry` is shared by the acceptor, every connection thread, the
// sweeper and the CRUD surface. The map sits behind one short-lived mutex;
// each session sits behind its own. The map lock is never held while a
// session lock is taken, so a slow session can't stall lookups for others.
//
// Creation draws candidate codes from a `CodeGenerator` and uses the map's
// vacant-entry insert as the uniqueness check, so two concurrent creates can
// never both claim the same code.
//
// Removal paths:
// - `destroy`: explicit, idempotent. Takes the session out of the map, then
//   closes it (members hear `Disconnected(0)`).
// - `remove_closed`: after a host leave the session has already closed
//   itself; the connection thread just drops it from the map.
// - `sweep_expired`: sessions with no members for longer than the grace
//   period.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};
use trellis_protocol::{JOIN_CODE_ALPHABET, JoinCode};

use crate::error::RegistryError;
use crate::lock;
use crate::session::RelaySession;

/// Attempts `create` makes before giving up on finding a free code.
pub const MAX_CODE_ATTEMPTS: u32 = 64;

pub type SharedSession = Arc<Mutex<RelaySession>>;

/// Source of candidate join codes.
pub trait CodeGenerator: Send + Sync {
    /// Produce a candidate of `length` characters. The registry validates it
    /// and retries on collision, so a generator is free to repeat itself.
    fn generate(&self, length: usize) -> String;
}

/// Uniform random codes over `JOIN_CODE_ALPHABET`.
pub struct RandomCodes;

impl CodeGenerator for RandomCodes {
    fn generate(&self, length: usize) -> String {
        let mut rng = rand::rng();
        (0..length)
            .map(|_| char::from(JOIN_CODE_ALPHABET[rng.random_range(0..JOIN_CODE_ALPHABET.len())]))
            .collect()
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<JoinCode, SharedSession>>,
    code_length: usize,
    generator: Box<dyn CodeGenerator>,
}

impl SessionRegistry {
    pub fn new(code_length: usize) -> Self {
        Self::with_generator(code_length, Box::new(RandomCodes))
    }

    pub fn with_generator(code_length: usize, generator: Box<dyn CodeGenerator>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            code_length,
            generator,
        }
    }

    /// Create an empty session under a fresh code.
    pub fn create(&self) -> Result<JoinCode, RegistryError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let candidate = self.generator.generate(self.code_length);
            let code = match JoinCode::parse(&candidate) {
                Ok(code) => code,
                Err(e) => {
                    warn!("code generator produced an unusable code: {e}");
                    continue;
                }
            };
            match lock(&self.sessions).entry(code.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(Mutex::new(RelaySession::new(code.clone()))));
                }
                Entry::Occupied(_) => {
                    debug!("join code {code} already taken; rerolling");
                    continue;
                }
            }
            info!(session = %code, "session created");
            return Ok(code);
        }
        Err(RegistryError::CodeSpaceExhausted {
            attempts: MAX_CODE_ATTEMPTS,
        })
    }

    pub fn get(&self, code: &JoinCode) -> Result<SharedSession, RegistryError> {
        lock(&self.sessions)
            .get(code)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(code.clone()))
    }

    pub fn contains(&self, code: &JoinCode) -> bool {
        lock(&self.sessions).contains_key(code)
    }

    /// Remove and close a session. Returns whether it existed; destroying an
    /// unknown code is a no-op.
    pub fn destroy(&self, code: &JoinCode) -> bool {
        let removed = lock(&self.sessions).remove(code);
        match removed {
            Some(session) => {
                lock(&session).close();
                info!(session = %code, "session destroyed");
                true
            }
            None => false,
        }
    }

    /// Drop `session` from the map if `code` still points at it. Used once a
    /// session has closed itself.
    pub fn remove_closed(&self, code: &JoinCode, session: &SharedSession) {
        let mut sessions = lock(&self.sessions);
        if sessions
            .get(code)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(code);
            debug!(session = %code, "closed session removed");
        }
    }

    /// Close and remove every session that has been empty for `grace`.
    /// Returns the codes removed.
    pub fn sweep_expired(&self, now: Instant, grace: Duration) -> Vec<JoinCode> {
        let snapshot: Vec<(JoinCode, SharedSession)> = lock(&self.sessions)
            .iter()
            .map(|(code, session)| (code.clone(), session.clone()))
            .collect();

        let mut removed = Vec::new();
        for (code, session) in snapshot {
            {
                let mut state = lock(&session);
                if !state.is_expired(now, grace) {
                    continue;
                }
                // Closed under the session lock, so a joiner racing the sweep
                // is turned away rather than admitted into a dead session.
                state.close();
            }
            self.remove_closed(&code, &session);
            info!(session = %code, "empty session expired");
            removed.push(code);
        }
        removed
    }

    /// Close every session. Used when the relay stops.
    pub fn close_all(&self) {
        let drained: Vec<SharedSession> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in drained {
            lock(&session).close();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn codes(&self) -> Vec<JoinCode> {
        let mut codes: Vec<JoinCode> = lock(&self.sessions).keys().cloned().collect();
        codes.sort();
        codes
    }
}
