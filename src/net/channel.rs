//! Channel handles and transport events.
//!
//! A channel is one bidirectional peer connection. The core never touches
//! sockets: it holds a [`ChannelHandle`] to send frames and consumes
//! [`TransportEvent`]s for open/receive/close notifications.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

/// Global monotonic channel ID counter. IDs are never reused.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a new unique channel ID.
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// This side closed the channel.
    LocalClose,
    /// An outbound connection attempt failed.
    ConnectFailed(String),
    /// The peer sent a frame above the size limit.
    FrameTooLarge(usize),
    /// Socket error.
    Io(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::LocalClose => write!(f, "closed locally"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            CloseReason::FrameTooLarge(n) => write!(f, "frame of {n} bytes too large"),
            CloseReason::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

/// Sending side of one channel.
///
/// Cloning is cheap; all clones refer to the same connection. Once closed,
/// a handle stays closed, so a stale handle can never reach a newer
/// connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
    peer: Option<SocketAddr>,
}

impl ChannelHandle {
    /// Create a handle around a transport's outbound queue and close flag.
    pub fn new(
        id: ChannelId,
        outbound: mpsc::UnboundedSender<Bytes>,
        closed: Arc<watch::Sender<bool>>,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            id,
            outbound,
            closed,
            peer,
        }
    }

    /// A handle not backed by any socket: frames sent through it land in
    /// the returned receiver. Used for in-process transports and tests.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        (Self::new(ChannelId::next(), tx, Arc::new(closed), None), rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && !self.outbound.is_closed()
    }

    /// Queue a frame. Returns false if the channel is already closed.
    pub fn send(&self, frame: Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    /// Ask the transport to close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Receiver that observes the close flag.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Notifications from a transport to the proxy that owns the channels.
#[derive(Debug)]
pub enum TransportEvent {
    Opened(ChannelHandle),
    Received(ChannelId, Bytes),
    Closed(ChannelId, CloseReason),
}

/// Where a transport delivers its events.
pub type TransportSender = mpsc::UnboundedSender<TransportEvent>;
