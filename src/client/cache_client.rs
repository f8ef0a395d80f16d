//! Request/response cache client.
//!
//! Wraps a [`ClientProxy`] and turns each operation into one awaited call:
//! send the request(s), then drive the proxy's events until the matching
//! reply arrives or the operation times out. One operation runs at a time;
//! a second concurrent call fails with [`CacheError::Busy`].

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::cache::key::CacheKey;
use crate::cache::value::CacheValue;
use crate::client::proxy::{ClientEvent, ClientProxy, ConnectionState};
use crate::protocol::chunk;
use crate::protocol::packet::{ClientResponse, CHUNK_SIZE};

/// Default time allowed for one operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cannot connect to cache server at {0}")]
    CannotConnect(String),

    #[error("Not connected to a cache server")]
    NotConnected,

    #[error("Cannot send request to cache server")]
    CannotSendRequest,

    #[error("Another cache operation is in progress")]
    Busy,

    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),

    #[error("Request rejected by cache server")]
    Rejected,

    #[error("Item does not exist in cache")]
    NotExistInCache,

    #[error("Transfer aborted by cache server")]
    Aborted,

    #[error("Received data is corrupted: {0}")]
    CorruptedData(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Connection to cache server lost")]
    ConnectionLost,
}

pub struct CacheClient {
    proxy: Mutex<ClientProxy>,
    timeout: Duration,
}

impl Default for CacheClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl CacheClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_proxy(ClientProxy::new(), timeout)
    }

    /// Use an existing proxy (for example one fed by a non-TCP transport).
    pub fn with_proxy(proxy: ClientProxy, timeout: Duration) -> Self {
        Self {
            proxy: Mutex::new(proxy),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connect and wait until the connection is open.
    pub async fn connect(&self, addr: &str) -> Result<(), CacheError> {
        let mut proxy = self.proxy.try_lock().map_err(|_| CacheError::Busy)?;
        drain(&mut proxy);
        if proxy.is_connected() {
            return Ok(());
        }
        if !proxy.connect(addr) {
            return Err(CacheError::CannotConnect(addr.to_string()));
        }

        let result = tokio::time::timeout(self.timeout, async {
            loop {
                match proxy.next_event().await {
                    ClientEvent::StateChanged(ConnectionState::Connected) => return Ok(()),
                    ClientEvent::StateChanged(ConnectionState::Disconnected) => {
                        return Err(CacheError::CannotConnect(addr.to_string()))
                    }
                    _ => {}
                }
            }
        })
        .await;

        match result {
            Ok(result) => result,
            Err(_) => {
                proxy.disconnect();
                Err(CacheError::OperationTimeout(self.timeout))
            }
        }
    }

    /// Close the connection.
    pub async fn disconnect(&self) {
        self.proxy.lock().await.disconnect();
    }

    pub async fn is_connected(&self) -> bool {
        self.proxy.lock().await.is_connected()
    }

    /// Upload a value under `key`.
    pub async fn add_to_cache(&self, key: CacheKey, value: &CacheValue) -> Result<(), CacheError> {
        if !value.is_valid() {
            return Err(CacheError::InvalidValue(
                "value is empty or inconsistent".to_string(),
            ));
        }
        let data = value
            .serialize()
            .map_err(|e| CacheError::InvalidValue(e.to_string()))?;

        let mut proxy = self.lock_connected()?;
        self.with_timeout(upload(&mut proxy, key, data)).await
    }

    /// Download the value stored under `key`.
    pub async fn request_from_cache(&self, key: CacheKey) -> Result<CacheValue, CacheError> {
        let mut proxy = self.lock_connected()?;
        let data = self.with_timeout(download(&mut proxy, key)).await?;

        let value = CacheValue::deserialize(&data)
            .map_err(|e| CacheError::CorruptedData(e.to_string()))?;
        if !value.is_valid() {
            return Err(CacheError::CorruptedData("inconsistent value".to_string()));
        }
        Ok(value)
    }

    /// Delete `key` from the server's store.
    pub async fn remove_from_cache(&self, key: CacheKey) -> Result<(), CacheError> {
        let mut proxy = self.lock_connected()?;
        self.with_timeout(async {
            if !proxy.request_remove(key) {
                return Err(CacheError::CannotSendRequest);
            }
            let removed = wait_for(&mut proxy, |response| match response {
                ClientResponse::RemoveAck { key: k, removed } if k == key => Some(removed),
                _ => None,
            })
            .await?;
            if removed {
                Ok(())
            } else {
                Err(CacheError::NotExistInCache)
            }
        })
        .await
    }

    /// Empty the server's store.
    pub async fn clear_cache(&self) -> Result<(), CacheError> {
        let mut proxy = self.lock_connected()?;
        self.with_timeout(async {
            if !proxy.request_clear() {
                return Err(CacheError::CannotSendRequest);
            }
            let cleared = wait_for(&mut proxy, |response| match response {
                ClientResponse::ClearAck { cleared } => Some(cleared),
                _ => None,
            })
            .await?;
            if cleared {
                Ok(())
            } else {
                Err(CacheError::Rejected)
            }
        })
        .await
    }

    /// Mark `key` as recently used. The server does not reply.
    pub async fn warmup(&self, key: CacheKey) -> Result<(), CacheError> {
        let proxy = self.lock_connected()?;
        if proxy.request_warmup(key) {
            Ok(())
        } else {
            Err(CacheError::CannotSendRequest)
        }
    }

    /// Round-trip a status request to check the server is responsive.
    pub async fn check_status(&self) -> Result<(), CacheError> {
        let mut proxy = self.lock_connected()?;
        self.with_timeout(async {
            if !proxy.request_status() {
                return Err(CacheError::CannotSendRequest);
            }
            wait_for(&mut proxy, |response| match response {
                ClientResponse::StatusAck => Some(()),
                _ => None,
            })
            .await
        })
        .await
    }

    /// Take the proxy for one operation. Fails if another operation holds
    /// it or there is no connection.
    fn lock_connected(&self) -> Result<MutexGuard<'_, ClientProxy>, CacheError> {
        let mut proxy = self.proxy.try_lock().map_err(|_| CacheError::Busy)?;
        drain(&mut proxy);
        if !proxy.is_connected() {
            return Err(CacheError::NotConnected);
        }
        Ok(proxy)
    }

    async fn with_timeout<T>(
        &self,
        op: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .unwrap_or(Err(CacheError::OperationTimeout(self.timeout)))
    }
}

async fn upload(proxy: &mut ClientProxy, key: CacheKey, data: Bytes) -> Result<(), CacheError> {
    let total_bytes = data.len() as u64;
    let total_chunks = chunk::chunk_count(total_bytes, CHUNK_SIZE);
    if !proxy.request_add_announce(key, total_bytes, total_chunks) {
        return Err(CacheError::CannotSendRequest);
    }
    expect_add_ack(proxy, key).await?;

    for index in 0..total_chunks {
        let chunk = chunk::get_chunk_bytes(&data, index, CHUNK_SIZE);
        if !proxy.request_add_chunk(key, index, chunk) {
            return Err(CacheError::CannotSendRequest);
        }
        expect_add_ack(proxy, key).await?;
    }
    debug!(%key, bytes = total_bytes, chunks = total_chunks, "Added to cache");
    Ok(())
}

async fn download(proxy: &mut ClientProxy, key: CacheKey) -> Result<Bytes, CacheError> {
    if !proxy.request_get(key) {
        return Err(CacheError::CannotSendRequest);
    }
    let (total_bytes, total_chunks) = wait_for(proxy, |response| match response {
        ClientResponse::GetInfo {
            key: k,
            total_bytes,
            total_chunks,
        } if k == key => Some((total_bytes, total_chunks)),
        _ => None,
    })
    .await?;
    if total_bytes == 0 || total_chunks == 0 {
        return Err(CacheError::NotExistInCache);
    }

    let mut buf = BytesMut::with_capacity(total_bytes.min(64 << 20) as usize);
    for index in 0..total_chunks {
        if !proxy.request_get_chunk(key, index) {
            return Err(CacheError::CannotSendRequest);
        }
        let data = wait_for(proxy, |response| match response {
            ClientResponse::GetChunk {
                key: k,
                index: i,
                data,
            } if k == key && i == index => Some(data),
            _ => None,
        })
        .await?;
        if data.is_empty() {
            return Err(CacheError::Aborted);
        }
        buf.extend_from_slice(&data);
        if buf.len() as u64 > total_bytes {
            return Err(CacheError::CorruptedData(format!(
                "received more than the announced {total_bytes} bytes"
            )));
        }
    }
    if buf.len() as u64 != total_bytes {
        return Err(CacheError::CorruptedData(format!(
            "received {} of {total_bytes} bytes",
            buf.len()
        )));
    }
    debug!(%key, bytes = total_bytes, chunks = total_chunks, "Fetched from cache");
    Ok(buf.freeze())
}

/// Discard replies left over from an earlier, abandoned operation.
fn drain(proxy: &mut ClientProxy) {
    while let Some(event) = proxy.poll_event() {
        debug!(?event, "Discarding stale event");
    }
}

/// Drive the proxy until `matcher` accepts a response.
async fn wait_for<T>(
    proxy: &mut ClientProxy,
    mut matcher: impl FnMut(ClientResponse) -> Option<T>,
) -> Result<T, CacheError> {
    loop {
        match proxy.next_event().await {
            ClientEvent::Response(response) => {
                if let Some(result) = matcher(response) {
                    return Ok(result);
                }
            }
            ClientEvent::StateChanged(ConnectionState::Disconnected) => {
                return Err(CacheError::ConnectionLost);
            }
            ClientEvent::StateChanged(_) => {}
            ClientEvent::IncorrectPacket(e) => {
                warn!("Ignoring incorrect packet: {e}");
            }
        }
    }
}

async fn expect_add_ack(proxy: &mut ClientProxy, key: CacheKey) -> Result<(), CacheError> {
    let accepted = wait_for(proxy, |response| match response {
        ClientResponse::AddAck { key: k, accepted } if k == key => Some(accepted),
        _ => None,
    })
    .await?;
    if accepted {
        Ok(())
    } else {
        Err(CacheError::Rejected)
    }
}
