//! Server proxy: accepts client channels and turns frames into requests.
//!
//! The proxy keeps the set of open channels. It validates every inbound
//! frame and hands the orchestrator either a typed [`ServerRequest`] or a
//! [`ServerEvent::Malformed`] notice; replies go out through the typed
//! `send_*` methods.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::key::CacheKey;
use crate::net::channel::{ChannelHandle, ChannelId, CloseReason, TransportEvent, TransportSender};
use crate::net::tcp;
use crate::protocol::packet::{ClientResponse, Packet, PacketError, ServerRequest};

/// Everything the server proxy reports to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ChannelOpened {
        channel: ChannelId,
    },
    Request {
        channel: ChannelId,
        request: ServerRequest,
    },
    Malformed {
        channel: ChannelId,
        error: PacketError,
    },
    ChannelClosed {
        channel: ChannelId,
        reason: CloseReason,
    },
}

pub struct ServerProxy {
    channels: HashMap<ChannelId, ChannelHandle>,
    listener: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    events_tx: TransportSender,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Default for ServerProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerProxy {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            channels: HashMap::new(),
            listener: None,
            local_addr: None,
            events_tx,
            events_rx,
        }
    }

    /// Start accepting TCP connections on `addr`.
    pub async fn listen(&mut self, addr: &str) -> std::io::Result<SocketAddr> {
        if let Some(task) = self.listener.take() {
            task.abort();
        }
        let (local_addr, task) = tcp::listen(addr, self.events_tx.clone()).await?;
        info!(addr = %local_addr, "Cache protocol listening");
        self.listener = Some(task);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Sender for transports other than TCP.
    pub fn transport(&self) -> TransportSender {
        self.events_tx.clone()
    }

    /// Stop accepting and close every channel.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.listener.take() {
            task.abort();
        }
        self.local_addr = None;
        for channel in self.channels.values() {
            channel.close();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_open(&self, channel: ChannelId) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.is_open())
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> ServerEvent {
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
    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(event) = self.process(event) {
                return Some(event);
            }
        }
        None
    }

    fn process(&mut self, event: TransportEvent) -> Option<ServerEvent> {
        match event {
            TransportEvent::Opened(handle) => {
                let channel = handle.id();
                debug!(%channel, peer = ?handle.peer_addr(), "Client connected");
                self.channels.insert(channel, handle);
                Some(ServerEvent::ChannelOpened { channel })
            }
            TransportEvent::Received(channel, frame) => {
                if !self.channels.contains_key(&channel) {
                    return None;
                }
                match Packet::decode(frame).and_then(ServerRequest::try_from) {
                    Ok(request) => Some(ServerEvent::Request { channel, request }),
                    Err(error) => {
                        warn!(%channel, "Malformed packet: {error}");
                        Some(ServerEvent::Malformed { channel, error })
                    }
                }
            }
            TransportEvent::Closed(channel, reason) => {
                self.channels.remove(&channel)?;
                debug!(%channel, %reason, "Client disconnected");
                Some(ServerEvent::ChannelClosed { channel, reason })
            }
        }
    }

    fn send(&self, channel: ChannelId, response: ClientResponse) -> bool {
        match self.channels.get(&channel) {
            Some(handle) => handle.send(Packet::from(response).encode()),
            None => false,
        }
    }

    pub fn send_add_ack(&self, channel: ChannelId, key: CacheKey, accepted: bool) -> bool {
        self.send(channel, ClientResponse::AddAck { key, accepted })
    }

    /// `0, 0` reports a miss.
    pub fn send_get_info(
        &self,
        channel: ChannelId,
        key: CacheKey,
        total_bytes: u64,
        total_chunks: u32,
    ) -> bool {
        self.send(
            channel,
            ClientResponse::GetInfo {
                key,
                total_bytes,
                total_chunks,
            },
        )
    }

    /// Empty `data` aborts the transfer.
    pub fn send_get_chunk(&self, channel: ChannelId, key: CacheKey, index: u32, data: Bytes) -> bool {
        self.send(channel, ClientResponse::GetChunk { key, index, data })
    }

    pub fn send_remove_ack(&self, channel: ChannelId, key: CacheKey, removed: bool) -> bool {
        self.send(channel, ClientResponse::RemoveAck { key, removed })
    }

    pub fn send_clear_ack(&self, channel: ChannelId, cleared: bool) -> bool {
        self.send(channel, ClientResponse::ClearAck { cleared })
    }

    pub fn send_status_ack(&self, channel: ChannelId) -> bool {
        self.send(channel, ClientResponse::StatusAck)
    }
}

impl Drop for ServerProxy {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::DIGEST_SIZE;

    fn key() -> CacheKey {
        CacheKey::new([5; DIGEST_SIZE], [6; DIGEST_SIZE])
    }

    fn open(proxy: &mut ServerProxy) -> (ChannelId, mpsc::UnboundedReceiver<Bytes>) {
        let (handle, outbound) = ChannelHandle::detached();
        let channel = handle.id();
        proxy.transport().send(TransportEvent::Opened(handle)).unwrap();
        assert_eq!(proxy.poll_event(), Some(ServerEvent::ChannelOpened { channel }));
        (channel, outbound)
    }

    #[tokio::test]
    async fn test_request_is_typed() {
        let mut proxy = ServerProxy::new();
        let (channel, _outbound) = open(&mut proxy);

        let frame = Packet::WarmupRequest { key: key() }.encode();
        proxy
            .transport()
            .send(TransportEvent::Received(channel, frame))
            .unwrap();
        assert_eq!(
            proxy.next_event().await,
            ServerEvent::Request {
                channel,
                request: ServerRequest::Warmup { key: key() }
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_reported() {
        let mut proxy = ServerProxy::new();
        let (channel, _outbound) = open(&mut proxy);

        proxy
            .transport()
            .send(TransportEvent::Received(channel, Bytes::from_static(b"\x00\x00\x01")))
            .unwrap();
        assert_eq!(
            proxy.poll_event(),
            Some(ServerEvent::Malformed {
                channel,
                error: PacketError::TooShort(3)
            })
        );

        // A response-only packet is malformed in this direction.
        proxy
            .transport()
            .send(TransportEvent::Received(channel, Packet::StatusAck.encode()))
            .unwrap();
        assert!(matches!(
            proxy.poll_event(),
            Some(ServerEvent::Malformed {
                error: PacketError::UnexpectedDirection(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_replies_reach_channel() {
        let mut proxy = ServerProxy::new();
        let (channel, mut outbound) = open(&mut proxy);

        assert!(proxy.send_get_info(channel, key(), 10, 1));
        assert_eq!(
            Packet::decode(outbound.try_recv().unwrap()).unwrap(),
            Packet::GetInfo {
                key: key(),
                total_bytes: 10,
                total_chunks: 1
            }
        );
        assert!(!proxy.send_status_ack(ChannelId::next()));
    }

    #[tokio::test]
    async fn test_close_removes_channel() {
        let mut proxy = ServerProxy::new();
        let (channel, _outbound) = open(&mut proxy);
        assert_eq!(proxy.channel_count(), 1);

        let tx = proxy.transport();
        tx.send(TransportEvent::Closed(channel, CloseReason::PeerClosed)).unwrap();
        tx.send(TransportEvent::Received(channel, Packet::StatusRequest.encode()))
            .unwrap();
        assert_eq!(
            proxy.poll_event(),
            Some(ServerEvent::ChannelClosed {
                channel,
                reason: CloseReason::PeerClosed
            })
        );
        // Frames from a closed channel are dropped.
        assert_eq!(proxy.poll_event(), None);
        assert_eq!(proxy.channel_count(), 0);
        assert!(!proxy.send_status_ack(channel));
    }
}
