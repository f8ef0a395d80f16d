//! Client proxy: one outbound connection to a cache server.
//!
//! The proxy owns at most one channel. Requests are fire-and-forget (the
//! return value only says whether the packet was queued); responses arrive
//! later as [`ClientEvent`]s from [`ClientProxy::next_event`].

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::key::CacheKey;
use crate::net::channel::{ChannelHandle, ChannelId, TransportEvent, TransportSender};
use crate::net::tcp;
use crate::protocol::packet::{ClientResponse, Packet, PacketError, ServerRequest};

/// Connection state of a client proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a client proxy reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Response(ClientResponse),
    /// A frame that could not be decoded, or a request-only packet.
    IncorrectPacket(PacketError),
}

pub struct ClientProxy {
    channel: Option<ChannelHandle>,
    pending: Option<ChannelId>,
    connector: Option<JoinHandle<()>>,
    events_tx: TransportSender,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Default for ClientProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientProxy {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            channel: None,
            pending: None,
            connector: None,
            events_tx,
            events_rx,
        }
    }

    /// Start connecting to `addr`. Returns false if a connection is
    /// already open or in progress.
    pub fn connect(&mut self, addr: impl Into<String>) -> bool {
        if self.channel.is_some() || self.pending.is_some() {
            return false;
        }
        let addr = addr.into();
        let id = ChannelId::next();
        debug!(%addr, channel = %id, "Connecting");
        self.pending = Some(id);
        self.connector = Some(tcp::connect(addr, id, self.events_tx.clone()));
        true
    }

    /// Sender for transports other than TCP. An `Opened` event delivered
    /// while the proxy is idle is adopted as its connection.
    pub fn transport(&self) -> TransportSender {
        self.events_tx.clone()
    }

    /// Close the connection or abandon a pending connect.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.connector.take() {
            task.abort();
        }
        self.pending = None;
        if let Some(channel) = &self.channel {
            debug!(channel = %channel.id(), "Disconnecting");
            channel.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self.pending.is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> ClientEvent {
        loop {
            // The proxy holds a sender, so the queue never ends.
            let Some(event) = self.events_rx.recv().await else {
                return std::future::pending().await;
            };
            if let Some(event) = self.process(event) {
                return event;
            }
        }
    }

    /// Next already-queued event, without waiting.
    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(event) = self.process(event) {
                return Some(event);
            }
        }
        None
    }

    fn process(&mut self, event: TransportEvent) -> Option<ClientEvent> {
        match event {
            TransportEvent::Opened(handle) => {
                let id = handle.id();
                let expected = self.channel.is_none() && self.pending.map_or(true, |p| p == id);
                if !expected {
                    debug!(channel = %id, "Dropping stale connection");
                    handle.close();
                    return None;
                }
                self.pending = None;
                self.connector = None;
                self.channel = Some(handle);
                Some(ClientEvent::StateChanged(ConnectionState::Connected))
            }
            TransportEvent::Received(id, frame) => {
                if self.channel.as_ref().map(|c| c.id()) != Some(id) {
                    return None;
                }
                match Packet::decode(frame).and_then(ClientResponse::try_from) {
                    Ok(response) => Some(ClientEvent::Response(response)),
                    Err(e) => {
                        warn!(channel = %id, "Incorrect packet from server: {e}");
                        Some(ClientEvent::IncorrectPacket(e))
                    }
                }
            }
            TransportEvent::Closed(id, reason) => {
                if self.channel.as_ref().map(|c| c.id()) == Some(id) {
                    debug!(channel = %id, %reason, "Connection closed");
                    self.channel = None;
                    Some(ClientEvent::StateChanged(ConnectionState::Disconnected))
                } else if self.pending == Some(id) {
                    debug!(channel = %id, %reason, "Connect failed");
                    self.pending = None;
                    self.connector = None;
                    Some(ClientEvent::StateChanged(ConnectionState::Disconnected))
                } else {
                    None
                }
            }
        }
    }

    fn send(&self, request: ServerRequest) -> bool {
        match &self.channel {
            Some(channel) => channel.send(Packet::from(request).encode()),
            None => false,
        }
    }

    pub fn request_add_announce(&self, key: CacheKey, total_bytes: u64, total_chunks: u32) -> bool {
        self.send(ServerRequest::AddAnnounce {
            key,
            total_bytes,
            total_chunks,
        })
    }

    pub fn request_add_chunk(&self, key: CacheKey, index: u32, data: Bytes) -> bool {
        self.send(ServerRequest::AddChunk { key, index, data })
    }

    pub fn request_get(&self, key: CacheKey) -> bool {
        self.send(ServerRequest::Get { key })
    }

    pub fn request_get_chunk(&self, key: CacheKey, index: u32) -> bool {
        self.send(ServerRequest::GetChunk { key, index })
    }

    pub fn request_remove(&self, key: CacheKey) -> bool {
        self.send(ServerRequest::Remove { key })
    }

    pub fn request_clear(&self) -> bool {
        self.send(ServerRequest::Clear)
    }

    pub fn request_warmup(&self, key: CacheKey) -> bool {
        self.send(ServerRequest::Warmup { key })
    }

    pub fn request_status(&self) -> bool {
        self.send(ServerRequest::Status)
    }
}

impl Drop for ClientProxy {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::DIGEST_SIZE;
    use crate::net::channel::CloseReason;

    fn key() -> CacheKey {
        CacheKey::new([1; DIGEST_SIZE], [2; DIGEST_SIZE])
    }

    /// Adopt a detached channel; returns the server-side view of it.
    fn attach(proxy: &mut ClientProxy) -> (ChannelId, mpsc::UnboundedReceiver<Bytes>) {
        let (handle, outbound) = ChannelHandle::detached();
        let id = handle.id();
        proxy.transport().send(TransportEvent::Opened(handle)).unwrap();
        assert_eq!(
            proxy.poll_event(),
            Some(ClientEvent::StateChanged(ConnectionState::Connected))
        );
        (id, outbound)
    }

    #[tokio::test]
    async fn test_requests_fail_when_disconnected() {
        let proxy = ClientProxy::new();
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
        assert!(!proxy.request_get(key()));
        assert!(!proxy.request_status());
    }

    #[tokio::test]
    async fn test_request_encoding_and_response_decoding() {
        let mut proxy = ClientProxy::new();
        let (id, mut outbound) = attach(&mut proxy);
        assert!(proxy.is_connected());

        assert!(proxy.request_get_chunk(key(), 3));
        let frame = outbound.try_recv().unwrap();
        assert_eq!(
            Packet::decode(frame).unwrap(),
            Packet::GetChunkRequest { key: key(), index: 3 }
        );

        let reply = Packet::RemoveAck {
            key: key(),
            removed: true,
        };
        proxy
            .transport()
            .send(TransportEvent::Received(id, reply.encode()))
            .unwrap();
        assert_eq!(
            proxy.next_event().await,
            ClientEvent::Response(ClientResponse::RemoveAck {
                key: key(),
                removed: true
            })
        );
    }

    #[tokio::test]
    async fn test_request_packet_from_server_is_incorrect() {
        let mut proxy = ClientProxy::new();
        let (id, _outbound) = attach(&mut proxy);
        proxy
            .transport()
            .send(TransportEvent::Received(id, Packet::StatusRequest.encode()))
            .unwrap();
        assert!(matches!(
            proxy.poll_event(),
            Some(ClientEvent::IncorrectPacket(PacketError::UnexpectedDirection(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_reports_disconnected_once() {
        let mut proxy = ClientProxy::new();
        let (id, _outbound) = attach(&mut proxy);

        let tx = proxy.transport();
        tx.send(TransportEvent::Closed(id, CloseReason::PeerClosed)).unwrap();
        tx.send(TransportEvent::Closed(id, CloseReason::PeerClosed)).unwrap();
        assert_eq!(
            proxy.poll_event(),
            Some(ClientEvent::StateChanged(ConnectionState::Disconnected))
        );
        assert_eq!(proxy.poll_event(), None);
        assert!(!proxy.request_status());
    }

    #[tokio::test]
    async fn test_second_connection_is_refused() {
        let mut proxy = ClientProxy::new();
        let (_id, _outbound) = attach(&mut proxy);
        assert!(!proxy.connect("127.0.0.1:1"));

        let (extra, _rx) = ChannelHandle::detached();
        let second = extra.clone();
        proxy.transport().send(TransportEvent::Opened(extra)).unwrap();
        assert_eq!(proxy.poll_event(), None);
        assert!(!second.is_open());
    }
}
