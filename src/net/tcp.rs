//! TCP transport: length-prefixed frames over tokio sockets.
//!
//! Frame format: `[u32 little-endian length][packet]`. Frames above
//! [`MAX_PACKET_SIZE`] close the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::net::channel::{ChannelHandle, ChannelId, CloseReason, TransportEvent, TransportSender};
use crate::protocol::packet::MAX_PACKET_SIZE;

#[derive(Error, Debug)]
enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Bind a listener and start accepting connections in the background.
///
/// Every accepted connection is announced with [`TransportEvent::Opened`].
pub async fn listen(
    addr: &str,
    events: TransportSender,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let task = tokio::spawn(accept_loop(listener, events));
    Ok((local_addr, task))
}

async fn accept_loop(listener: TcpListener, events: TransportSender) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Accepted connection");
                spawn_connection(stream, ChannelId::next(), Some(peer), events.clone());
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        if events.is_closed() {
            break;
        }
    }
}

/// Connect to `addr` in the background as channel `id`.
///
/// Success is announced with [`TransportEvent::Opened`], failure with
/// [`TransportEvent::Closed`] carrying [`CloseReason::ConnectFailed`].
pub fn connect(addr: String, id: ChannelId, events: TransportSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                debug!(%addr, channel = %id, "Connected");
                spawn_connection(stream, id, peer, events);
            }
            Err(e) => {
                debug!(%addr, channel = %id, "Connect failed: {e}");
                let _ = events.send(TransportEvent::Closed(
                    id,
                    CloseReason::ConnectFailed(e.to_string()),
                ));
            }
        }
    })
}

/// Announce the channel, then run its reader and writer tasks.
fn spawn_connection(
    stream: TcpStream,
    id: ChannelId,
    peer: Option<SocketAddr>,
    events: TransportSender,
) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (closed_tx, _) = watch::channel(false);
    let closed = Arc::new(closed_tx);

    let handle = ChannelHandle::new(id, outbound_tx, closed.clone(), peer);
    // Opened must precede any Received for this channel.
    if events.send(TransportEvent::Opened(handle)).is_err() {
        return;
    }

    tokio::spawn(write_loop(writer, outbound_rx, closed.clone()));
    tokio::spawn(read_loop(reader, id, closed, events));
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    id: ChannelId,
    closed: Arc<watch::Sender<bool>>,
    events: TransportSender,
) {
    let mut close_signal = closed.subscribe();
    let reason = loop {
        tokio::select! {
            _ = wait_closed(&mut close_signal) => break CloseReason::LocalClose,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => {
                    if events.send(TransportEvent::Received(id, frame)).is_err() {
                        break CloseReason::LocalClose;
                    }
                }
                Ok(None) => break CloseReason::PeerClosed,
                Err(FrameError::TooLarge(len)) => break CloseReason::FrameTooLarge(len),
                Err(FrameError::Io(e)) => break CloseReason::Io(e.to_string()),
            },
        }
    };

    closed.send_replace(true);
    debug!(channel = %id, %reason, "Channel closed");
    let _ = events.send(TransportEvent::Closed(id, reason));
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut close_signal = closed.subscribe();
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!("Write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            _ = wait_closed(&mut close_signal) => {
                // Flush what was queued before the close.
                while let Ok(frame) = outbound.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    closed.send_replace(true);
}

/// Resolve once the channel is marked closed or its sender is gone.
async fn wait_closed(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Bytes>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_PACKET_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(frame.len() as u32).to_le_bytes()).await?;
    writer.write_all(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed")
    }

    #[tokio::test]
    async fn test_frames_cross_the_socket() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (addr, _listener) = listen("127.0.0.1:0", server_tx).await.unwrap();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client_id = ChannelId::next();
        connect(addr.to_string(), client_id, client_tx);

        let client = match next_event(&mut client_rx).await {
            TransportEvent::Opened(handle) => handle,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(client.id(), client_id);
        let server = match next_event(&mut server_rx).await {
            TransportEvent::Opened(handle) => handle,
            other => panic!("unexpected event {other:?}"),
        };

        assert!(client.send(Bytes::from_static(b"ping")));
        match next_event(&mut server_rx).await {
            TransportEvent::Received(id, frame) => {
                assert_eq!(id, server.id());
                assert_eq!(frame, Bytes::from_static(b"ping"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        client.close();
        match next_event(&mut client_rx).await {
            TransportEvent::Closed(id, CloseReason::LocalClose) => assert_eq!(id, client_id),
            other => panic!("unexpected event {other:?}"),
        }
        match next_event(&mut server_rx).await {
            TransportEvent::Closed(id, _) => assert_eq!(id, server.id()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!server.send(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_closed() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ChannelId::next();
        connect(addr.to_string(), id, tx);
        match next_event(&mut rx).await {
            TransportEvent::Closed(closed, CloseReason::ConnectFailed(_)) => assert_eq!(closed, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queued_frames_flushed_on_close() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (addr, _listener) = listen("127.0.0.1:0", server_tx).await.unwrap();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client_id = ChannelId::next();
        connect(addr.to_string(), client_id, client_tx);
        assert!(matches!(next_event(&mut client_rx).await, TransportEvent::Opened(_)));
        let server = match next_event(&mut server_rx).await {
            TransportEvent::Opened(handle) => handle,
            other => panic!("unexpected event {other:?}"),
        };

        assert!(server.send(Bytes::from_static(b"first")));
        assert!(server.send(Bytes::from_static(b"last")));
        server.close();

        for expected in [&b"first"[..], &b"last"[..]] {
            match next_event(&mut client_rx).await {
                TransportEvent::Received(id, frame) => {
                    assert_eq!(id, client_id);
                    assert_eq!(frame, Bytes::from_static(expected));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        match next_event(&mut client_rx).await {
            TransportEvent::Closed(id, CloseReason::PeerClosed) => assert_eq!(id, client_id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
