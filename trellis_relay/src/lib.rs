// trellis_relay: session relay and client adapter for Trellis.
//
// The relay lets peers that cannot reach each other directly (NAT-bound game
// clients) talk through one public endpoint. Each peer opens a single
// connection, names a session by join code, and from then on every payload it
// sends is forwarded to the other members of that session with the relay
// stamping the sender's identity onto it. Payloads are never inspected.
//
// Module overview:
// - `session.rs`:    One session's membership state machine: identity
//                    assignment, author stamping, star forwarding, kicks,
//                    leave and host teardown.
// - `registry.rs`:   Join code -> session map with collision-safe creation,
//                    idempotent destroy and the empty-session sweep.
// - `server.rs`:     Accept loop, per-connection handshake and reader
//                    threads, sweeper thread, and the `RelayHandle` that
//                    stops them.
// - `link.rs`:       Framed TCP link with a per-peer writer thread and
//                    ping sampling. Used by both the relay and clients.
// - `api.rs`:        Session CRUD surface for an external HTTP layer.
// - `transport.rs`:  Client-side transport contract and its TCP version.
// - `client.rs`:     `RelayAdapter`, the peer-side mirror of a session.
// - `conditions.rs`: Simulated loss and latency for the adapter.
// - `config.rs`:     `RelayConfig` / `ClientConfig` and the env overlay.
// - `error.rs`:      Error enums.
//
// Dependencies: `trellis_protocol` for the wire vocabulary, `tracing` for
// logging, `thiserror` for errors, `rand` for join codes and simulated
// conditions.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// game process via the library API (`start_relay`).

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
pub mod client;
pub mod conditions;
pub mod config;
pub mod error;
pub mod link;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use api::{SessionApi, SessionInfo};
pub use client::{CancelToken, ConnectFailure, NetworkEvent, RelayAdapter};
pub use config::{ClientConfig, RelayConfig};
pub use registry::SessionRegistry;
pub use server::{RelayHandle, start_relay};
pub use transport::{TcpTransport, Transport};

/// Lock a mutex, carrying on with the inner value if a panicking thread
/// poisoned it. Session state stays consistent between method calls, so a
/// panic mid-call is no reason to take the whole relay down.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
