// TCP server for the relay.
//
// Architecture: thread-per-connection, with state shared through the
// registry.
//
// - **Acceptor thread**: polls a non-blocking `TcpListener` so it can check
//   `keep_running` between accepts, wraps each new stream in a `TcpLink`,
//   records it in `Connections` and spawns a connection thread for it.
// - **Connection threads** (one per peer): read the `JoinRequest` (which
//   must arrive within `handshake_timeout` of accept, pings or not), resolve
//   the join code and either admit the peer
//   into its session or reject it. Once admitted the thread becomes the
//   peer's reader: it decodes each control message and dispatches it into
//   the session under that session's lock. Any read error (EOF, reset,
//   silence past `disconnect_timeout`) is an implicit leave.
// - **Link writer threads** (one per peer, owned by `link.rs`): sessions only
//   ever enqueue, so a slow peer never blocks a broadcast.
// - **Sweeper thread**: every `sweep_interval`, drops sessions that have sat
//   empty for longer than `empty_session_grace`.
//
// Per-session work is serialized by the session mutex; different sessions
// never contend. The registry lock is only held for map operations.
//
// Shutdown: `RelayHandle::stop` clears `keep_running`, joins the acceptor
// and sweeper, closes every session, then closes every link still recorded
// in `Connections` (peers that never finished the handshake included) and
// joins the connection threads.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use trellis_protocol::{
    ClientIdentity, ControlMessage, DeliveryClass, JoinRequest, JoinResponse, PROTOCOL_VERSION,
    RejectReason,
};

use crate::api::SessionApi;
use crate::config::{LinkConfig, RelayConfig};
use crate::error::{AdmitError, RelayError};
use crate::link::{LinkReader, PeerLink, TcpLink};
use crate::lock;
use crate::registry::{SessionRegistry, SharedSession};
use crate::session::{Dispatch, Ignored, LeaveOutcome};

/// How long the acceptor sleeps when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Granularity at which the sweeper notices shutdown.
const SWEEP_TICK: Duration = Duration::from_millis(50);

/// Every live connection's link and thread.
#[derive(Default)]
struct Connections {
    next_id: AtomicU64,
    links: Mutex<HashMap<u64, Arc<TcpLink>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Connections {
    fn register(&self, link: Arc<TcpLink>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.links).insert(id, link);
        id
    }

    fn forget(&self, id: u64) {
        lock(&self.links).remove(&id);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut threads = lock(&self.threads);
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
    }

    fn len(&self) -> usize {
        lock(&self.links).len()
    }

    /// Close every recorded link and wait for the connection threads.
    fn close_and_join(&self) {
        let links: Vec<_> = lock(&self.links).drain().map(|(_, link)| link).collect();
        for link in links {
            link.close();
        }
        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            let _ = handle.join();
        }
    }
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    connections: Arc<Connections>,
    registry: Arc<SessionRegistry>,
    addr: SocketAddr,
    public_address: String,
    enable_destroy_api: bool,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// CRUD surface advertising this relay's public address and bound port.
    pub fn api(&self) -> SessionApi {
        SessionApi::new(
            self.registry.clone(),
            self.public_address.clone(),
            self.addr.port(),
            self.enable_destroy_api,
        )
    }

    /// Connections currently open, admitted or still handshaking.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting, sever every session and connection, and wait for the
    /// relay threads.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        for handle in self.threads {
            let _ = handle.join();
        }
        self.registry.close_all();
        self.connections.close_and_join();
        info!("relay on {} stopped", self.addr);
    }
}

/// Bind the listener and start the relay threads. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    config.validate()?;
    let listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port))?;
    let addr = listener.local_addr()?;
    // Non-blocking so the acceptor can check keep_running periodically.
    listener.set_nonblocking(true)?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let registry = Arc::new(SessionRegistry::new(config.join_code_length));
    let connections = Arc::new(Connections::default());

    let acceptor = {
        let acceptor = Acceptor {
            listener,
            registry: registry.clone(),
            connections: connections.clone(),
            link_config: config.link.clone(),
            handshake_timeout: config.handshake_timeout,
        };
        let keep_running = keep_running.clone();
        thread::Builder::new()
            .name("relay-accept".into())
            .spawn(move || acceptor.run(&keep_running))?
    };
    let sweeper = {
        let keep_running = keep_running.clone();
        let registry = registry.clone();
        let grace = config.empty_session_grace;
        let interval = config.sweep_interval;
        thread::Builder::new()
            .name("relay-sweep".into())
            .spawn(move || sweep_loop(registry, grace, interval, keep_running))?
    };

    info!("relay listening on {addr}");
    Ok((
        RelayHandle {
            keep_running,
            threads: vec![acceptor, sweeper],
            connections,
            registry,
            addr,
            public_address: config.public_address,
            enable_destroy_api: config.enable_destroy_api,
        },
        addr,
    ))
}

struct Acceptor {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    connections: Arc<Connections>,
    link_config: LinkConfig,
    handshake_timeout: Duration,
}

impl Acceptor {
    fn run(self, keep_running: &AtomicBool) {
        while keep_running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let accepted_at = Instant::now();
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("dropping connection from {peer}: {e}");
                        continue;
                    }
                    let (link, reader) = match TcpLink::open(stream, &self.link_config) {
                        Ok(pair) => pair,
                        Err(e) => {
                            debug!("could not open link to {peer}: {e}");
                            continue;
                        }
                    };
                    let conn = Connection {
                        id: self.connections.register(link.clone()),
                        peer: peer.to_string(),
                        link,
                        reader,
                        deadline: accepted_at + self.handshake_timeout,
                    };
                    self.spawn(conn);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn spawn(&self, conn: Connection) {
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let id = conn.id;
        let link = conn.link.clone();
        let spawned = thread::Builder::new()
            .name(format!("relay-conn-{}", conn.peer))
            .spawn(move || {
                conn.run(&registry);
                connections.forget(id);
            });
        match spawned {
            Ok(handle) => self.connections.track(handle),
            Err(e) => {
                warn!("could not spawn connection thread: {e}");
                link.close();
                self.connections.forget(id);
            }
        }
    }
}

fn sweep_loop(
    registry: Arc<SessionRegistry>,
    grace: Duration,
    interval: Duration,
    keep_running: Arc<AtomicBool>,
) {
    let mut next_sweep = Instant::now() + interval;
    while keep_running.load(Ordering::SeqCst) {
        thread::sleep(SWEEP_TICK.min(interval));
        let now = Instant::now();
        if now < next_sweep {
            continue;
        }
        next_sweep = now + interval;
        let removed = registry.sweep_expired(now, grace);
        if !removed.is_empty() {
            debug!("sweep removed {} empty sessions", removed.len());
        }
    }
}

/// One accepted peer, from handshake to departure.
struct Connection {
    id: u64,
    peer: String,
    link: Arc<TcpLink>,
    reader: LinkReader,
    /// When the join request must have arrived by.
    deadline: Instant,
}

impl Connection {
    fn run(mut self, registry: &SessionRegistry) {
        let Some((session, identity)) =
            handshake(&self.peer, &self.link, &mut self.reader, self.deadline, registry)
        else {
            self.link.close();
            return;
        };
        self.serve(registry, session, identity);
    }

    fn serve(mut self, registry: &SessionRegistry, session: SharedSession, identity: ClientIdentity) {
        let code = lock(&session).join_code().clone();
        debug!(session = %code, "connection {} serving {identity}", self.id);
        serve_member(&mut self.reader, registry, &session, identity);

        let outcome = lock(&session).leave(identity);
        if outcome == LeaveOutcome::SessionClosed {
            registry.remove_closed(&code, &session);
        }
        // Already closed by the session when it dropped us; harmless otherwise.
        self.link.close();
    }
}

/// Read loop for an admitted member. Returns when the member's link ends
/// or the session is gone.
fn serve_member(
    reader: &mut LinkReader,
    registry: &SessionRegistry,
    session: &SharedSession,
    identity: ClientIdentity,
) {
    let code = lock(session).join_code().clone();
    loop {
        let (class, bytes) = match reader.recv() {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = %code, "{identity} link ended: {e}");
                break;
            }
        };
        let msg = match ControlMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session = %code, "dropping malformed message from {identity}: {e}");
                continue;
            }
        };
        let outcome = lock(session).dispatch(identity, class, msg);
        match outcome {
            Dispatch::SessionClosed => {
                registry.remove_closed(&code, session);
                return;
            }
            Dispatch::Ignored(Ignored::NotMember) => return,
            _ => {}
        }
    }
}

/// Read the join request and admit or reject the peer.
fn handshake(
    peer: &str,
    link: &Arc<TcpLink>,
    reader: &mut LinkReader,
    deadline: Instant,
    registry: &SessionRegistry,
) -> Option<(SharedSession, ClientIdentity)> {
    let bytes = match reader.recv_before(deadline) {
        Ok((_, bytes)) => bytes,
        Err(e) => {
            debug!("{peer}: no join request: {e}");
            link.close();
            return None;
        }
    };
    let request = match JoinRequest::from_bytes(&bytes) {
        Ok(request) => request,
        Err(e) => {
            warn!("{peer}: malformed join request: {e}");
            reject(link, RejectReason::MalformedRequest);
            return None;
        }
    };
    if request.protocol_version != PROTOCOL_VERSION {
        warn!(
            "{peer}: protocol version {} (relay speaks {PROTOCOL_VERSION})",
            request.protocol_version
        );
        reject(link, RejectReason::ProtocolMismatch);
        return None;
    }
    let session = match registry.get(&request.join_code) {
        Ok(session) => session,
        Err(e) => {
            info!("{peer}: {e}");
            reject(link, RejectReason::SessionNotFound);
            return None;
        }
    };

    let shared: Arc<dyn PeerLink> = link.clone();
    let admitted = lock(&session).admit(shared, request.role);
    match admitted {
        Ok(admission) => {
            debug!(session = %request.join_code, "{peer} admitted as {}", admission.identity);
            Some((session, admission.identity))
        }
        Err(AdmitError::SessionClosed) => {
            reject(link, RejectReason::SessionClosed);
            None
        }
        Err(AdmitError::WelcomeUndeliverable) => None,
    }
}

/// Answer with a rejection and close once it has flushed.
fn reject(link: &TcpLink, reason: RejectReason) {
    match (JoinResponse::Rejected { reason }).to_bytes() {
        Ok(bytes) => {
            if let Err(e) = link.send(DeliveryClass::ReliableOrdered, bytes) {
                debug!("could not send rejection: {e}");
            }
        }
        Err(e) => warn!("could not encode rejection: {e}"),
    }
    link.close();
}
