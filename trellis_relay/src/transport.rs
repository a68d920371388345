// Client-side transport contract.
//
// `RelayAdapter` (client.rs) is written against the `Transport` trait, not
// against sockets, so game code can plug in whatever carries its packets and
// tests can script a transport without a relay. The contract is the one the
// relay assumes of any transport: connect with a handshake payload, send on
// a delivery class, poll for what arrived, disconnect, and report a one-way
// ping estimate.
//
// `TcpTransport` is the shipped implementation. It uses the same `TcpLink`
// as the relay:
// - `connect()` dials, sends the handshake as the first message frame and
//   waits for the relay's single reply on the calling (worker) thread, then
//   spawns a reader thread.
// - The reader thread calls `LinkReader::recv()` in a loop and pushes into
//   an `mpsc` channel; when the link ends it pushes one `Disconnected`.
// - `poll_events()` drains that channel without blocking.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use trellis_protocol::DeliveryClass;

use crate::config::{ClientConfig, LinkConfig};
use crate::error::TransportError;
use crate::link::{LinkReader, PeerLink, TcpLink};

/// Something that happened on an established transport connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Received {
        class: DeliveryClass,
        payload: Vec<u8>,
    },
    /// The connection is gone. Nothing follows this.
    Disconnected,
}

pub trait Transport: Send + 'static {
    /// Open a connection to `endpoint` (`host:port`), send `handshake` as the
    /// first message and return the peer's reply. Replaces any existing
    /// connection.
    fn connect(&mut self, endpoint: &str, handshake: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn send(&mut self, class: DeliveryClass, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Drain whatever has arrived since the last call. Never blocks.
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Drop the connection, if any. Idempotent.
    fn disconnect(&mut self);

    /// One-way latency estimate; zero before the first sample.
    fn ping(&self) -> Duration;
}

/// `Transport` over one framed TCP connection.
pub struct TcpTransport {
    config: LinkConfig,
    link: Option<Arc<TcpLink>>,
    inbox: Option<Receiver<TransportEvent>>,
    reader_thread: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            link: None,
            inbox: None,
            reader_thread: None,
        }
    }

    /// Transport using the link timing of an adapter configuration.
    pub fn for_client(config: &ClientConfig) -> Self {
        Self::new(config.link_config())
    }

    pub fn link_config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| !link.is_closed())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(LinkConfig::default())
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, endpoint: &str, handshake: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.disconnect();

        let addr = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Resolve(endpoint.to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, self.config.disconnect_timeout)?;
        let (link, mut reader) = TcpLink::open(stream, &self.config)?;

        link.send(DeliveryClass::ReliableOrdered, handshake.to_vec())?;
        let reply = match reader.recv() {
            Ok((_, reply)) => reply,
            Err(_) => {
                link.close();
                return Err(TransportError::HandshakeClosed);
            }
        };

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::Builder::new()
            .name("transport-reader".into())
            .spawn(move || reader_loop(reader, tx))?;

        self.link = Some(link);
        self.inbox = Some(rx);
        self.reader_thread = Some(reader_thread);
        Ok(reply)
    }

    fn send(&mut self, class: DeliveryClass, payload: Vec<u8>) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        link.send(class, payload)?;
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let Some(inbox) = &self.inbox else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            events.push(event);
        }
        events
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.inbox = None;
        if let Some(handle) = self.reader_thread.take() {
            // The writer shuts the socket down once the close marker drains,
            // which ends the reader's blocking read.
            let _ = handle.join();
        }
    }

    fn ping(&self) -> Duration {
        self.link
            .as_ref()
            .map(|link| link.ping())
            .unwrap_or_default()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reader thread: forward message frames until the link ends.
fn reader_loop(mut reader: LinkReader, tx: Sender<TransportEvent>) {
    loop {
        match reader.recv() {
            Ok((class, payload)) => {
                if tx.send(TransportEvent::Received { class, payload }).is_err() {
                    return; // Transport dropped the receiver
                }
            }
            Err(_) => {
                let _ = tx.send(TransportEvent::Disconnected);
                return;
            }
        }
    }
}
