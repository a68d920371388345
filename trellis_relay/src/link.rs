// Framed peer link over a TCP stream.
//
// One `TcpLink` wraps one physical connection and is used by both ends: the
// relay holds one per member, the client's `TcpTransport` holds one to the
// relay. Architecture:
//
// - **Writer thread** (one per link): owns the write half, drains a bounded
//   outbound queue, and sends a ping whenever `ping_interval` has passed
//   since the last one. Callers never block on a slow socket; when the queue
//   is full `send` fails immediately and the caller logs it.
// - **`LinkReader`**: owns the read half. The owner calls `recv()` in its
//   own thread. Pings are answered with pongs through the outbound queue and
//   pongs update the latency sample; only message frames are returned.
//
// The read half carries `disconnect_timeout` as its socket read timeout.
// Both ends ping more often than that, so a read timing out means the peer
// has gone silent and is treated like any other transport failure. A peer
// that answers pings but never sends a message is only caught by
// `recv_before`, which bounds the whole wait rather than each read.
//
// `close()` queues a close marker behind any pending frames, so farewell
// announcements are flushed before the socket is shut down.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;
use trellis_protocol::{DeliveryClass, Frame, read_frame, write_frame};

use crate::config::LinkConfig;
use crate::error::LinkError;

/// The relay's view of one member's connection.
///
/// `TcpLink` is the production implementation; session tests supply an
/// in-memory one.
pub trait PeerLink: Send + Sync {
    /// Queue a message frame. Never blocks.
    fn send(&self, class: DeliveryClass, payload: Vec<u8>) -> Result<(), LinkError>;

    /// Flush whatever is queued, then close the connection. Idempotent.
    fn close(&self);

    /// Latest one-way latency estimate (half the measured round trip).
    fn ping(&self) -> Duration;
}

enum Outbound {
    Frame(Frame),
    Close,
}

struct LinkStats {
    origin: Instant,
    ping_micros: AtomicU64,
}

impl LinkStats {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            ping_micros: AtomicU64::new(0),
        }
    }

    fn stamp(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn record_pong(&self, stamp: u64) {
        // Floor at 1us so "sampled" and "never sampled" stay distinguishable.
        let rtt = self.stamp().saturating_sub(stamp);
        self.ping_micros.store((rtt / 2).max(1), Ordering::Relaxed);
    }

    fn ping(&self) -> Duration {
        Duration::from_micros(self.ping_micros.load(Ordering::Relaxed))
    }
}

pub struct TcpLink {
    outbound: SyncSender<Outbound>,
    stream: TcpStream,
    stats: Arc<LinkStats>,
    closed: AtomicBool,
}

/// Read half of a `TcpLink`.
pub struct LinkReader {
    reader: BufReader<TcpStream>,
    outbound: SyncSender<Outbound>,
    stats: Arc<LinkStats>,
    idle_timeout: Duration,
}

impl TcpLink {
    /// Take ownership of a connected stream and start its writer thread.
    pub fn open(stream: TcpStream, config: &LinkConfig) -> io::Result<(Arc<TcpLink>, LinkReader)> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.disconnect_timeout))?;
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;

        let (tx, rx) = mpsc::sync_channel(config.outbound_queue.max(1));
        let stats = Arc::new(LinkStats::new());

        let writer_stats = stats.clone();
        let ping_interval = config.ping_interval;
        thread::Builder::new()
            .name("link-writer".into())
            .spawn(move || writer_loop(BufWriter::new(write_half), rx, ping_interval, writer_stats))?;

        let link = Arc::new(TcpLink {
            outbound: tx.clone(),
            stream,
            stats: stats.clone(),
            closed: AtomicBool::new(false),
        });
        let reader = LinkReader {
            reader: BufReader::new(read_half),
            outbound: tx,
            stats,
            idle_timeout: config.disconnect_timeout,
        };
        Ok((link, reader))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PeerLink for TcpLink {
    fn send(&self, class: DeliveryClass, payload: Vec<u8>) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        match self
            .outbound
            .try_send(Outbound::Frame(Frame::Message { class, payload }))
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LinkError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(LinkError::Closed),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.outbound.try_send(Outbound::Close).is_err() {
            // Writer is gone or backed up; cut the socket directly.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn ping(&self) -> Duration {
        self.stats.ping()
    }
}

impl LinkReader {
    /// Block until the next message frame arrives.
    ///
    /// Any error (EOF, reset, read timeout, bad framing) means the link is
    /// finished.
    pub fn recv(&mut self) -> io::Result<(DeliveryClass, Vec<u8>)> {
        self.recv_bounded(None)
    }

    /// Like `recv`, but fails with `TimedOut` once `deadline` passes, no
    /// matter how many pings arrive in the meantime.
    pub fn recv_before(&mut self, deadline: Instant) -> io::Result<(DeliveryClass, Vec<u8>)> {
        let result = self.recv_bounded(Some(deadline));
        self.reader
            .get_ref()
            .set_read_timeout(Some(self.idle_timeout))?;
        result
    }

    fn recv_bounded(&mut self, deadline: Option<Instant>) -> io::Result<(DeliveryClass, Vec<u8>)> {
        loop {
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(deadline_passed());
                }
                self.reader
                    .get_ref()
                    .set_read_timeout(Some(left.min(self.idle_timeout)))?;
            }
            let frame = match read_frame(&mut self.reader) {
                Ok(frame) => frame,
                // Read timeouts surface as WouldBlock on Unix, TimedOut on Windows.
                Err(e)
                    if deadline.is_some()
                        && matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Err(deadline_passed());
                }
                Err(e) => return Err(e),
            };
            match frame {
                Frame::Message { class, payload } => return Ok((class, payload)),
                Frame::Ping { stamp } => {
                    let _ = self.outbound.try_send(Outbound::Frame(Frame::Pong { stamp }));
                }
                Frame::Pong { stamp } => self.stats.record_pong(stamp),
            }
        }
    }

    pub fn ping(&self) -> Duration {
        self.stats.ping()
    }
}

fn deadline_passed() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline passed")
}

/// Writer thread: drain the queue, interleave pings, stop on close or error.
fn writer_loop(
    mut writer: BufWriter<TcpStream>,
    rx: Receiver<Outbound>,
    ping_interval: Duration,
    stats: Arc<LinkStats>,
) {
    let mut last_ping = Instant::now();
    if write_frame(&mut writer, &Frame::Ping { stamp: stats.stamp() }).is_err() {
        return;
    }

    loop {
        let wait = ping_interval.saturating_sub(last_ping.elapsed());
        let result = match rx.recv_timeout(wait) {
            Ok(Outbound::Frame(frame)) => write_frame(&mut writer, &frame),
            Ok(Outbound::Close) => break,
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = result {
            debug!("link write failed: {e}");
            break;
        }
        if last_ping.elapsed() >= ping_interval {
            last_ping = Instant::now();
            if write_frame(&mut writer, &Frame::Ping { stamp: stats.stamp() }).is_err() {
                break;
            }
        }
    }

    let _ = writer.get_ref().shutdown(Shutdown::Both);
}
