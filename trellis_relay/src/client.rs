// Client relay adapter.
//
// `RelayAdapter` is the peer-side mirror of a relay session. Game code
// creates one per session, calls `send`/`kick` to talk to the other members,
// and drains `poll()` on its own schedule for `NetworkEvent`s. Architecture:
//
// - **Worker thread** (one per adapter, owned by it): runs the bounded
//   connect loop, then pumps traffic. Outbound application sends reach it
//   through an `mpsc` command channel; inbound control messages come from
//   `Transport::poll_events()`. Both directions pass through a `DelayLine`
//   so simulated loss and latency apply to the local view only.
// - **Event queue**: a bounded `sync_channel`. The worker waits (cancellably)
//   when it is full instead of dropping, so events are never lost or
//   duplicated and stay first-in first-out.
// - **`CancelToken`**: checked before every connect attempt and every pump
//   iteration, and wakes any retry sleep immediately. Once cancelled the
//   worker does no further I/O except telling the transport to disconnect.
//
// Connect policy: up to `max_connect_attempts` transport connects spaced by
// `reconnect_delay`. A relay rejection is final and not retried. After a
// successful join, losing the connection raises `TransportFailure` and the
// adapter stops; rejoining would hand out a new identity, so that is left to
// the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use trellis_protocol::{
    ClientIdentity, ControlKind, ControlMessage, DeliveryClass, JoinCode, JoinRequest,
    JoinResponse, JoinRole, RejectReason,
};

use crate::conditions::DelayLine;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::lock;
use crate::transport::{TcpTransport, Transport, TransportEvent};

/// Longest the worker sleeps between pump iterations.
const PUMP_INTERVAL: Duration = Duration::from_millis(2);

/// Quality-of-service levels as a game networking layer names them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkDelivery {
    Unreliable,
    UnreliableSequenced,
    Reliable,
    ReliableSequenced,
    ReliableFragmentedSequenced,
}

impl From<NetworkDelivery> for DeliveryClass {
    fn from(delivery: NetworkDelivery) -> Self {
        match delivery {
            NetworkDelivery::Unreliable => DeliveryClass::Unreliable,
            NetworkDelivery::UnreliableSequenced => DeliveryClass::Sequenced,
            NetworkDelivery::Reliable => DeliveryClass::ReliableUnordered,
            NetworkDelivery::ReliableSequenced | NetworkDelivery::ReliableFragmentedSequenced => {
                DeliveryClass::ReliableOrdered
            }
        }
    }
}

/// Local network event raised by the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A member is in the session (including members present when we joined).
    Connected(ClientIdentity),
    Disconnected(ClientIdentity),
    Data {
        from: ClientIdentity,
        payload: Vec<u8>,
    },
    /// The established relay connection was lost. Terminal.
    TransportFailure,
    /// The adapter never got into the session. Terminal.
    ConnectFailed(ConnectFailure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectFailure {
    Exhausted { attempts: u32 },
    Rejected(RejectReason),
}

impl From<ConnectFailure> for ClientError {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::Exhausted { attempts } => ClientError::ConnectExhausted { attempts },
            ConnectFailure::Rejected(reason) => ClientError::Rejected(reason),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Connecting { attempt: u32 },
    Connected { identity: ClientIdentity },
    /// Connecting gave up; see the `ConnectFailed` event.
    Failed(ConnectFailure),
    /// The relay connection dropped after joining.
    Lost,
    /// Cancelled by the owner.
    Closed,
}

/// Cancellation handle shared between an adapter and its worker.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *lock(flag) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for up to `timeout`, returning early (with `true`) if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock(flag);
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            cancelled = match wake.wait_timeout(cancelled, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *cancelled
    }
}

enum Command {
    Send {
        class: DeliveryClass,
        message: ControlMessage,
    },
}

struct Shared {
    state: Mutex<AdapterState>,
    ping_micros: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: AdapterState) {
        *lock(&self.state) = state;
    }
}

pub struct RelayAdapter {
    commands: Sender<Command>,
    events: Receiver<NetworkEvent>,
    shared: Arc<Shared>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl RelayAdapter {
    /// Start joining `join_code` through `transport`. Returns immediately;
    /// progress is reported through `poll()` and `state()`.
    pub fn connect<T: Transport>(
        transport: T,
        config: ClientConfig,
        join_code: JoinCode,
        role: JoinRole,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let handshake = JoinRequest::new(join_code, role).to_bytes()?;

        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::sync_channel(config.event_queue_capacity.max(1));
        let shared = Arc::new(Shared {
            state: Mutex::new(AdapterState::Connecting { attempt: 0 }),
            ping_micros: AtomicU64::new(0),
        });
        let cancel = CancelToken::new();

        let worker = Worker {
            transport,
            outbound: DelayLine::new(config.conditions.clone()),
            inbound: DelayLine::new(config.conditions.clone()),
            config,
            handshake,
            commands: command_rx,
            events: event_tx,
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let worker = thread::Builder::new()
            .name("relay-adapter".into())
            .spawn(move || worker.run())
            .map_err(|e| ClientError::Transport(e.into()))?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            shared,
            cancel,
            worker: Some(worker),
        })
    }

    /// `connect` over a `TcpTransport` built from `config`'s ping interval
    /// and disconnect timeout.
    pub fn connect_tcp(
        config: ClientConfig,
        join_code: JoinCode,
        role: JoinRole,
    ) -> Result<Self, ClientError> {
        let transport = TcpTransport::for_client(&config);
        Self::connect(transport, config, join_code, role)
    }

    pub fn state(&self) -> AdapterState {
        *lock(&self.shared.state)
    }

    pub fn local_identity(&self) -> Option<ClientIdentity> {
        match self.state() {
            AdapterState::Connected { identity } => Some(identity),
            _ => None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.local_identity().is_some_and(ClientIdentity::is_host)
    }

    /// Send `payload` to the rest of the session.
    ///
    /// The relay forwards to every other member; `target` is what the game
    /// layer addressed and is not carried on the wire.
    pub fn send(
        &self,
        target: ClientIdentity,
        payload: &[u8],
        class: DeliveryClass,
    ) -> Result<(), ClientError> {
        let identity = self.local_identity().ok_or(ClientError::NotConnected)?;
        debug!("{identity} -> {target}: {} bytes on {class:?}", payload.len());
        self.command(Command::Send {
            class,
            message: ControlMessage::data(identity, payload.to_vec()),
        })
    }

    /// Ask the relay to drop `target`. Only honoured for the host.
    pub fn kick(&self, target: ClientIdentity) -> Result<(), ClientError> {
        self.local_identity().ok_or(ClientError::NotConnected)?;
        self.command(Command::Send {
            class: DeliveryClass::ReliableUnordered,
            message: ControlMessage::kick(target),
        })
    }

    /// Drain every queued event, oldest first. Never blocks.
    pub fn poll(&self) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_event(&self, timeout: Duration) -> Option<NetworkEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Round trip through the relay: twice the transport's one-way ping.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.shared.ping_micros.load(Ordering::Relaxed)) * 2
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancel, disconnect and wait for the worker to finish.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

impl Drop for RelayAdapter {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// How the connect loop ended without a welcome.
enum ConnectExit {
    Cancelled,
    Failed(ConnectFailure),
}

struct Worker<T> {
    transport: T,
    config: ClientConfig,
    handshake: Vec<u8>,
    commands: Receiver<Command>,
    events: SyncSender<NetworkEvent>,
    shared: Arc<Shared>,
    cancel: CancelToken,
    outbound: DelayLine<(DeliveryClass, Vec<u8>)>,
    inbound: DelayLine<NetworkEvent>,
}

impl<T: Transport> Worker<T> {
    fn run(mut self) {
        match self.connect_loop() {
            Ok((identity, members)) => {
                info!("joined session as {identity}");
                self.shared.set_state(AdapterState::Connected { identity });
                let now = Instant::now();
                for member in members {
                    self.inbound.push(
                        DeliveryClass::ReliableOrdered,
                        NetworkEvent::Connected(member),
                        now,
                    );
                }
                self.pump();
            }
            Err(ConnectExit::Failed(failure)) => {
                warn!("could not join session: {failure:?}");
                self.shared.set_state(AdapterState::Failed(failure));
                self.emit(NetworkEvent::ConnectFailed(failure));
            }
            Err(ConnectExit::Cancelled) => {}
        }

        self.transport.disconnect();
        if self.cancel.is_cancelled() {
            self.shared.set_state(AdapterState::Closed);
        }
    }

    fn connect_loop(&mut self) -> Result<(ClientIdentity, Vec<ClientIdentity>), ConnectExit> {
        let endpoint = self.config.endpoint();
        let max = self.config.max_connect_attempts;

        for attempt in 1..=max {
            if self.cancel.is_cancelled() {
                return Err(ConnectExit::Cancelled);
            }
            self.shared.set_state(AdapterState::Connecting { attempt });

            match self.transport.connect(&endpoint, &self.handshake) {
                Ok(reply) => match JoinResponse::from_bytes(&reply) {
                    Ok(JoinResponse::Welcome { identity, members }) => {
                        return Ok((identity, members));
                    }
                    Ok(JoinResponse::Rejected { reason }) => {
                        self.transport.disconnect();
                        return Err(ConnectExit::Failed(ConnectFailure::Rejected(reason)));
                    }
                    Err(e) => {
                        warn!("attempt {attempt}/{max}: unreadable handshake reply: {e}");
                        self.transport.disconnect();
                    }
                },
                Err(e) => warn!("attempt {attempt}/{max} to reach {endpoint} failed: {e}"),
            }

            if attempt < max && self.cancel.wait_timeout(self.config.reconnect_delay) {
                return Err(ConnectExit::Cancelled);
            }
        }

        Err(ConnectExit::Failed(ConnectFailure::Exhausted { attempts: max }))
    }

    /// Move traffic until cancelled or the connection drops.
    fn pump(&mut self) {
        let mut lost = false;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();

            while let Ok(Command::Send { class, message }) = self.commands.try_recv() {
                self.outbound.push(class, (class, message.encode()), now);
            }
            for (class, bytes) in self.outbound.pop_due(now) {
                if let Err(e) = self.transport.send(class, bytes) {
                    debug!("send on {class:?} failed: {e}");
                }
            }

            for event in self.transport.poll_events() {
                match event {
                    TransportEvent::Received { class, payload } => self.receive(class, &payload, now),
                    TransportEvent::Disconnected => {
                        lost = true;
                        self.inbound.push(
                            DeliveryClass::ReliableOrdered,
                            NetworkEvent::TransportFailure,
                            now,
                        );
                    }
                }
            }
            for event in self.inbound.pop_due(now) {
                if event == NetworkEvent::TransportFailure {
                    warn!("relay connection lost");
                    self.shared.set_state(AdapterState::Lost);
                }
                if !self.emit(event) {
                    return;
                }
            }
            if lost && self.inbound.is_empty() {
                return;
            }

            let ping = self.transport.ping().as_micros() as u64;
            self.shared.ping_micros.store(ping, Ordering::Relaxed);

            let wait = self
                .inbound
                .next_due()
                .into_iter()
                .chain(self.outbound.next_due())
                .min()
                .map_or(PUMP_INTERVAL, |due| {
                    due.saturating_duration_since(now).min(PUMP_INTERVAL)
                });
            if self.cancel.wait_timeout(wait) {
                return;
            }
        }
    }

    fn receive(&mut self, class: DeliveryClass, payload: &[u8], now: Instant) {
        let msg = match ControlMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed message from relay: {e}");
                return;
            }
        };
        let (class, event) = match msg.kind {
            ControlKind::Connected => (
                DeliveryClass::ReliableOrdered,
                NetworkEvent::Connected(msg.author),
            ),
            ControlKind::Disconnected => (
                DeliveryClass::ReliableOrdered,
                NetworkEvent::Disconnected(msg.author),
            ),
            ControlKind::Data => (
                class,
                NetworkEvent::Data {
                    from: msg.author,
                    payload: msg.payload,
                },
            ),
            ControlKind::KickFromRelay | ControlKind::Unsupported(_) => {
                debug!("ignoring {:?} from relay", msg.kind);
                return;
            }
        };
        self.inbound.push(class, event, now);
    }

    /// Queue an event for the owner, waiting while the queue is full.
    /// Returns `false` if the owner is gone or cancelled.
    fn emit(&self, mut event: NetworkEvent) -> bool {
        loop {
            match self.events.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => {
                    if self.cancel.wait_timeout(PUMP_INTERVAL) {
                        return false;
                    }
                    event = back;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;
    use crate::conditions::SimulatedConditions;
    use crate::error::TransportError;

    /// What the scripted transport saw and what it should answer.
    #[derive(Default)]
    struct Script {
        attempts: Vec<Instant>,
        handshakes: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
        sent: Vec<(DeliveryClass, ControlMessage)>,
        incoming: VecDeque<TransportEvent>,
        disconnects: usize,
        ping: Duration,
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport(Arc<Mutex<Script>>);

    impl ScriptedTransport {
        fn unreachable() -> Self {
            Self::default()
        }

        fn answering(response: JoinResponse) -> Self {
            let transport = Self::default();
            transport
                .script()
                .replies
                .push_back(response.to_bytes().unwrap());
            transport
        }

        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.0.lock().unwrap()
        }

        fn deliver(&self, msg: ControlMessage, class: DeliveryClass) {
            self.script().incoming.push_back(TransportEvent::Received {
                class,
                payload: msg.encode(),
            });
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, _endpoint: &str, handshake: &[u8]) -> Result<Vec<u8>, TransportError> {
            let mut script = self.script();
            script.attempts.push(Instant::now());
            script.handshakes.push(handshake.to_vec());
            match script.replies.pop_front() {
                Some(reply) => Ok(reply),
                None => Err(TransportError::Io(io::Error::from(
                    io::ErrorKind::ConnectionRefused,
                ))),
            }
        }

        fn send(&mut self, class: DeliveryClass, payload: Vec<u8>) -> Result<(), TransportError> {
            let msg = ControlMessage::decode(&payload).unwrap();
            self.script().sent.push((class, msg));
            Ok(())
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            self.script().incoming.drain(..).collect()
        }

        fn disconnect(&mut self) {
            self.script().disconnects += 1;
        }

        fn ping(&self) -> Duration {
            self.script().ping
        }
    }

    fn config(max_attempts: u32, delay_ms: u64) -> ClientConfig {
        ClientConfig {
            max_connect_attempts: max_attempts,
            reconnect_delay: Duration::from_millis(delay_ms),
            ..ClientConfig::default()
        }
    }

    fn code() -> JoinCode {
        JoinCode::parse("ABCDEF").unwrap()
    }

    fn welcome(identity: u64, members: &[u64]) -> JoinResponse {
        JoinResponse::Welcome {
            identity: ClientIdentity(identity),
            members: members.iter().copied().map(ClientIdentity).collect(),
        }
    }

    fn wait_for<F: Fn(&RelayAdapter) -> bool>(adapter: &RelayAdapter, done: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(adapter) {
            assert!(Instant::now() < deadline, "timed out in state {:?}", adapter.state());
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn next(adapter: &RelayAdapter) -> NetworkEvent {
        adapter
            .next_event(Duration::from_secs(5))
            .expect("no event within 5s")
    }

    fn connected(transport: &ScriptedTransport) -> RelayAdapter {
        let adapter =
            RelayAdapter::connect(transport.clone(), config(3, 10), code(), JoinRole::Client)
                .unwrap();
        wait_for(&adapter, |a| a.local_identity().is_some());
        adapter
    }

    #[test]
    fn unreachable_relay_gets_exactly_max_attempts() {
        let transport = ScriptedTransport::unreachable();
        let adapter =
            RelayAdapter::connect(transport.clone(), config(3, 40), code(), JoinRole::Client)
                .unwrap();

        assert_eq!(
            next(&adapter),
            NetworkEvent::ConnectFailed(ConnectFailure::Exhausted { attempts: 3 })
        );
        assert_eq!(
            adapter.state(),
            AdapterState::Failed(ConnectFailure::Exhausted { attempts: 3 })
        );

        thread::sleep(Duration::from_millis(150));
        let script = transport.script();
        assert_eq!(script.attempts.len(), 3);
        for pair in script.attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(40));
        }
    }

    #[test]
    fn cancel_stops_retrying_and_disconnects() {
        let transport = ScriptedTransport::unreachable();
        let adapter =
            RelayAdapter::connect(transport.clone(), config(100, 5_000), code(), JoinRole::Client)
                .unwrap();
        wait_for(&adapter, |_| transport.script().attempts.len() == 1);

        let started = Instant::now();
        adapter.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));

        let script = transport.script();
        assert_eq!(script.attempts.len(), 1);
        assert!(script.disconnects >= 1);
    }

    #[test]
    fn rejection_is_final() {
        let transport = ScriptedTransport::answering(JoinResponse::Rejected {
            reason: RejectReason::SessionNotFound,
        });
        let adapter =
            RelayAdapter::connect(transport.clone(), config(5, 10), code(), JoinRole::Client)
                .unwrap();

        assert_eq!(
            next(&adapter),
            NetworkEvent::ConnectFailed(ConnectFailure::Rejected(RejectReason::SessionNotFound))
        );
        thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.script().attempts.len(), 1);
    }

    #[test]
    fn handshake_names_code_and_role() {
        let transport = ScriptedTransport::answering(welcome(0, &[]));
        let adapter =
            RelayAdapter::connect(transport.clone(), config(1, 10), code(), JoinRole::Host)
                .unwrap();
        wait_for(&adapter, RelayAdapter::is_host);

        let request = JoinRequest::from_bytes(&transport.script().handshakes[0]).unwrap();
        assert_eq!(request, JoinRequest::new(code(), JoinRole::Host));
    }

    #[test]
    fn welcome_members_become_connected_events() {
        let transport = ScriptedTransport::answering(welcome(4, &[0, 2]));
        let adapter = connected(&transport);

        assert_eq!(adapter.local_identity(), Some(ClientIdentity(4)));
        assert_eq!(next(&adapter), NetworkEvent::Connected(ClientIdentity(0)));
        assert_eq!(next(&adapter), NetworkEvent::Connected(ClientIdentity(2)));
    }

    #[test]
    fn control_messages_become_local_events() {
        let transport = ScriptedTransport::answering(welcome(1, &[]));
        let adapter = connected(&transport);

        transport.deliver(
            ControlMessage::connected(ClientIdentity(6)),
            DeliveryClass::ReliableOrdered,
        );
        transport.deliver(
            ControlMessage::data(ClientIdentity(6), b"state".to_vec()),
            DeliveryClass::Unreliable,
        );
        transport.deliver(
            ControlMessage {
                kind: ControlKind::from_byte(200),
                author: ClientIdentity(6),
                payload: vec![],
            },
            DeliveryClass::Unreliable,
        );
        transport.deliver(
            ControlMessage::disconnected(ClientIdentity(6)),
            DeliveryClass::ReliableOrdered,
        );

        assert_eq!(next(&adapter), NetworkEvent::Connected(ClientIdentity(6)));
        assert_eq!(
            next(&adapter),
            NetworkEvent::Data {
                from: ClientIdentity(6),
                payload: b"state".to_vec(),
            }
        );
        assert_eq!(next(&adapter), NetworkEvent::Disconnected(ClientIdentity(6)));
    }

    #[test]
    fn lost_connection_is_reported_once() {
        let transport = ScriptedTransport::answering(welcome(1, &[]));
        let adapter = connected(&transport);

        transport
            .script()
            .incoming
            .push_back(TransportEvent::Disconnected);
        assert_eq!(next(&adapter), NetworkEvent::TransportFailure);
        wait_for(&adapter, |a| a.state() == AdapterState::Lost);
        assert!(adapter.next_event(Duration::from_millis(50)).is_none());
        assert_eq!(transport.script().attempts.len(), 1);
    }

    #[test]
    fn send_wraps_payload_as_data() {
        let transport = ScriptedTransport::answering(welcome(3, &[0]));
        let adapter = connected(&transport);

        adapter
            .send(ClientIdentity::HOST, b"input", NetworkDelivery::Reliable.into())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.script().sent.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(
            transport.script().sent,
            vec![(
                DeliveryClass::ReliableUnordered,
                ControlMessage::data(ClientIdentity(3), b"input".to_vec())
            )]
        );
    }

    #[test]
    fn kick_names_target_on_reliable_unordered() {
        let transport = ScriptedTransport::answering(welcome(0, &[]));
        let adapter = connected(&transport);

        adapter.kick(ClientIdentity(7)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.script().sent.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(
            transport.script().sent,
            vec![(
                DeliveryClass::ReliableUnordered,
                ControlMessage::kick(ClientIdentity(7))
            )]
        );
    }

    #[test]
    fn send_before_join_is_not_connected() {
        let transport = ScriptedTransport::unreachable();
        let adapter =
            RelayAdapter::connect(transport, config(100, 5_000), code(), JoinRole::Client).unwrap();
        assert!(matches!(
            adapter.send(ClientIdentity::HOST, b"x", DeliveryClass::Unreliable),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            adapter.kick(ClientIdentity(1)),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn rtt_is_twice_transport_ping() {
        let transport = ScriptedTransport::answering(welcome(1, &[]));
        transport.script().ping = Duration::from_millis(12);
        let adapter = connected(&transport);
        wait_for(&adapter, |a| !a.rtt().is_zero());
        assert_eq!(adapter.rtt(), Duration::from_millis(24));
    }

    #[test]
    fn full_simulated_loss_drops_unreliable_data_only() {
        let transport = ScriptedTransport::answering(welcome(1, &[]));
        let mut cfg = config(1, 10);
        cfg.conditions = SimulatedConditions {
            loss_percent: 100,
            ..SimulatedConditions::default()
        };
        let adapter =
            RelayAdapter::connect(transport.clone(), cfg, code(), JoinRole::Client).unwrap();
        wait_for(&adapter, |a| a.local_identity().is_some());

        transport.deliver(
            ControlMessage::data(ClientIdentity(2), b"lossy".to_vec()),
            DeliveryClass::Unreliable,
        );
        transport.deliver(
            ControlMessage::data(ClientIdentity(2), b"kept".to_vec()),
            DeliveryClass::ReliableOrdered,
        );
        transport.deliver(
            ControlMessage::disconnected(ClientIdentity(2)),
            DeliveryClass::Unreliable,
        );

        assert_eq!(
            next(&adapter),
            NetworkEvent::Data {
                from: ClientIdentity(2),
                payload: b"kept".to_vec(),
            }
        );
        assert_eq!(next(&adapter), NetworkEvent::Disconnected(ClientIdentity(2)));
    }

    #[test]
    fn simulated_latency_delays_delivery() {
        let transport = ScriptedTransport::answering(welcome(1, &[]));
        let mut cfg = config(1, 10);
        cfg.conditions = SimulatedConditions {
            loss_percent: 0,
            min_latency: Duration::from_millis(80),
            max_latency: Duration::from_millis(80),
        };
        let adapter =
            RelayAdapter::connect(transport.clone(), cfg, code(), JoinRole::Client).unwrap();
        wait_for(&adapter, |a| a.local_identity().is_some());

        let sent_at = Instant::now();
        transport.deliver(
            ControlMessage::data(ClientIdentity(2), b"late".to_vec()),
            DeliveryClass::ReliableOrdered,
        );
        assert!(matches!(next(&adapter), NetworkEvent::Data { .. }));
        assert!(sent_at.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn cancel_token_wakes_sleepers() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));

        let sleeper = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let cancelled = token.wait_timeout(Duration::from_secs(30));
                (cancelled, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, waited) = sleeper.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
        assert!(token.is_cancelled());
    }

    #[test]
    fn delivery_levels_map_to_classes() {
        use NetworkDelivery::*;
        let mapped: Vec<DeliveryClass> = [
            Unreliable,
            UnreliableSequenced,
            Reliable,
            ReliableSequenced,
            ReliableFragmentedSequenced,
        ]
        .into_iter()
        .map(DeliveryClass::from)
        .collect();
        assert_eq!(
            mapped,
            vec![
                DeliveryClass::Unreliable,
                DeliveryClass::Sequenced,
                DeliveryClass::ReliableUnordered,
                DeliveryClass::ReliableOrdered,
                DeliveryClass::ReliableOrdered,
            ]
        );
    }

    #[test]
    fn invalid_config_is_refused_up_front() {
        let mut cfg = config(0, 10);
        cfg.conditions.loss_percent = 120;
        assert!(matches!(
            RelayAdapter::connect(ScriptedTransport::default(), cfg, code(), JoinRole::Client),
            Err(ClientError::Config(_))
        ));
    }
}
