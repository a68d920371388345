// Test-only game peer for multiplayer integration tests.
//
// Wraps the real `RelayAdapter` over a real `TcpTransport` (both from
// `trellis_relay`) to provide a synchronous, test-friendly API for
// exercising the full pipeline:
// host -> relay -> join -> data -> forwarded event -> verify.
//
// The only test-specific code here is the synchronous polling wrappers
// (blocking loops around `RelayAdapter::poll()`) and a tiny JSON game
// message standing in for real application payloads. All networking uses
// the same code paths as a real game.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use trellis_protocol::{ClientIdentity, DeliveryClass, JoinCode, JoinRole};
use trellis_relay::client::{AdapterState, NetworkEvent, RelayAdapter};
use trellis_relay::conditions::SimulatedConditions;
use trellis_relay::config::ClientConfig;
use trellis_relay::error::ClientError;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Stand-in application payload. The relay never looks inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMessage {
    pub turn: u32,
    pub text: String,
}

/// A test peer wrapping a real `RelayAdapter`.
pub struct TestPeer {
    adapter: RelayAdapter,
    /// Events polled while waiting for something else.
    backlog: VecDeque<NetworkEvent>,
}

/// Adapter settings pointed at `addr`, with a short retry delay.
pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        relay_address: addr.ip().to_string(),
        relay_port: addr.port(),
        ping_interval: Duration::from_millis(100),
        disconnect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(50),
        ..ClientConfig::default()
    }
}

impl TestPeer {
    /// Start joining without waiting for the outcome.
    pub fn start(config: ClientConfig, code: &JoinCode, role: JoinRole) -> Self {
        let adapter = RelayAdapter::connect_tcp(config, code.clone(), role)
            .expect("RelayAdapter::connect_tcp failed");
        Self {
            adapter,
            backlog: VecDeque::new(),
        }
    }

    /// Join and block until the relay has assigned an identity.
    pub fn join(addr: SocketAddr, code: &JoinCode, role: JoinRole) -> Self {
        Self::join_with(client_config(addr), code, role)
    }

    pub fn join_with(config: ClientConfig, code: &JoinCode, role: JoinRole) -> Self {
        let peer = Self::start(config, code, role);
        peer.wait_for_state(|state| matches!(state, AdapterState::Connected { .. }));
        peer
    }

    pub fn join_lossy(
        addr: SocketAddr,
        code: &JoinCode,
        conditions: SimulatedConditions,
    ) -> Self {
        let config = ClientConfig {
            conditions,
            ..client_config(addr)
        };
        Self::join_with(config, code, JoinRole::Client)
    }

    pub fn identity(&self) -> ClientIdentity {
        self.adapter
            .local_identity()
            .expect("peer is not connected")
    }

    pub fn state(&self) -> AdapterState {
        self.adapter.state()
    }

    pub fn adapter(&self) -> &RelayAdapter {
        &self.adapter
    }

    /// Serialize `msg` as JSON and send it to the session.
    pub fn send_message(&self, msg: &GameMessage, class: DeliveryClass) {
        let json = serde_json::to_vec(msg).expect("serialize GameMessage failed");
        self.adapter
            .send(ClientIdentity::HOST, &json, class)
            .expect("send failed");
    }

    pub fn send_raw(&self, payload: &[u8], class: DeliveryClass) -> Result<(), ClientError> {
        self.adapter.send(ClientIdentity::HOST, payload, class)
    }

    pub fn kick(&self, target: ClientIdentity) {
        self.adapter.kick(target).expect("kick failed");
    }

    /// Blocking poll until an event matching `pred` arrives. Events skipped
    /// on the way are kept for later calls.
    pub fn wait_for<F>(&mut self, what: &str, pred: F) -> NetworkEvent
    where
        F: Fn(&NetworkEvent) -> bool,
    {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return self.backlog.remove(pos).expect("position is in range");
        }
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            let mut found = None;
            for event in self.adapter.poll() {
                if found.is_none() && pred(&event) {
                    found = Some(event);
                } else {
                    self.backlog.push_back(event);
                }
            }
            if let Some(event) = found {
                return event;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn wait_connected(&mut self, id: ClientIdentity) {
        self.wait_for(&format!("Connected({id})"), |e| {
            *e == NetworkEvent::Connected(id)
        });
    }

    pub fn wait_disconnected(&mut self, id: ClientIdentity) {
        self.wait_for(&format!("Disconnected({id})"), |e| {
            *e == NetworkEvent::Disconnected(id)
        });
    }

    /// Blocking poll until a `GameMessage` arrives. Returns it with its
    /// relay-stamped author.
    pub fn wait_message(&mut self) -> (ClientIdentity, GameMessage) {
        match self.wait_for("Data", |e| matches!(e, NetworkEvent::Data { .. })) {
            NetworkEvent::Data { from, payload } => {
                let msg = serde_json::from_slice(&payload).expect("payload is not a GameMessage");
                (from, msg)
            }
            _ => unreachable!(),
        }
    }

    /// Block until `state` satisfies `pred`.
    pub fn wait_for_state<F>(&self, pred: F)
    where
        F: Fn(AdapterState) -> bool,
    {
        let start = Instant::now();
        while !pred(self.adapter.state()) {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out in state {:?}",
                self.adapter.state()
            );
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Everything queued right now, backlog first.
    pub fn drain(&mut self) -> Vec<NetworkEvent> {
        let mut events: Vec<NetworkEvent> = self.backlog.drain(..).collect();
        events.extend(self.adapter.poll());
        events
    }

    /// Cancel the adapter and close the connection.
    pub fn disconnect(self) {
        self.adapter.shutdown();
    }
}
