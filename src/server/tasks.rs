//! Per-transfer state held by the orchestrator.
//!
//! - [`AddTask`]: one client pushing one value in chunks
//! - [`GetTask`]: one key fetched from upstream and served to every
//!   subscriber that asked for it meanwhile
//! - [`RemoteRelayTask`]: one stored value being pushed to upstream

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::net::channel::ChannelId;
use crate::protocol::chunk;
use crate::protocol::packet::CHUNK_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Expected chunk {expected}, got {got}")]
    UnexpectedIndex { expected: u32, got: u32 },

    #[error("Chunk {index} is beyond the announced {total} chunks")]
    TooManyChunks { index: u32, total: u32 },

    #[error("Chunk {index} of {len} bytes does not fit the {remaining} bytes outstanding")]
    LengthMismatch { index: u32, len: usize, remaining: u64 },
}

/// Whether a transfer has all its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    Partial,
    Complete,
}

/// Chunked byte accumulator shared by adds and upstream fetches.
///
/// Chunks must arrive in order. A non-final chunk must be non-empty and
/// leave bytes outstanding; the final chunk must complete the total exactly.
#[derive(Debug)]
struct Assembly {
    total_bytes: u64,
    total_chunks: u32,
    chunks: Vec<Bytes>,
    received_bytes: u64,
}

impl Assembly {
    fn new(total_bytes: u64, total_chunks: u32) -> Self {
        Self {
            total_bytes,
            total_chunks,
            chunks: Vec::new(),
            received_bytes: 0,
        }
    }

    fn next_index(&self) -> u32 {
        self.chunks.len() as u32
    }

    fn accept(&mut self, index: u32, data: Bytes) -> Result<ChunkProgress, ChunkError> {
        let expected = self.next_index();
        if index >= self.total_chunks {
            return Err(ChunkError::TooManyChunks {
                index,
                total: self.total_chunks,
            });
        }
        if index != expected {
            return Err(ChunkError::UnexpectedIndex {
                expected,
                got: index,
            });
        }

        let remaining = self.total_bytes - self.received_bytes;
        let len = data.len() as u64;
        let is_last = index + 1 == self.total_chunks;
        let fits = if is_last {
            len == remaining
        } else {
            len > 0 && len < remaining
        };
        if !fits {
            return Err(ChunkError::LengthMismatch {
                index,
                len: data.len(),
                remaining,
            });
        }

        self.received_bytes += len;
        self.chunks.push(data);
        Ok(if is_last {
            ChunkProgress::Complete
        } else {
            ChunkProgress::Partial
        })
    }

    fn concat(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.received_bytes as usize);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

/// An in-progress client add.
#[derive(Debug)]
pub struct AddTask {
    assembly: Assembly,
}

impl AddTask {
    pub fn new(total_bytes: u64, total_chunks: u32) -> Self {
        Self {
            assembly: Assembly::new(total_bytes, total_chunks),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.assembly.total_bytes
    }

    pub fn received_bytes(&self) -> u64 {
        self.assembly.received_bytes
    }

    pub fn accept_chunk(&mut self, index: u32, data: Bytes) -> Result<ChunkProgress, ChunkError> {
        self.assembly.accept(index, data)
    }

    /// The reassembled serialized value.
    pub fn into_bytes(self) -> Bytes {
        self.assembly.concat()
    }
}

/// Where a get task stands with its data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetTaskState {
    /// Upstream `GetRequest` sent, totals unknown.
    WaitingUpstreamInfo,
    /// Totals known, chunks arriving from upstream.
    WaitingUpstreamChunk,
    /// Every chunk is held locally.
    Ready,
}

/// What one subscriber is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Has not received `GetInfo` yet.
    WaitingInfo,
    /// Asked for chunk `i` before it was available.
    WaitingChunk(u32),
    /// Idle between requests.
    Ready,
}

/// One key being served to subscribers.
#[derive(Debug)]
pub struct GetTask {
    state: GetTaskState,
    assembly: Assembly,
    pub subscribers: HashMap<ChannelId, SubscriberState>,
}

impl GetTask {
    /// A task that waits for upstream to answer.
    pub fn fetching() -> Self {
        Self {
            state: GetTaskState::WaitingUpstreamInfo,
            assembly: Assembly::new(0, 0),
            subscribers: HashMap::new(),
        }
    }

    pub fn state(&self) -> GetTaskState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GetTaskState::Ready
    }

    pub fn total_bytes(&self) -> u64 {
        self.assembly.total_bytes
    }

    pub fn total_chunks(&self) -> u32 {
        self.assembly.total_chunks
    }

    /// Whether the totals are known.
    pub fn has_info(&self) -> bool {
        self.state != GetTaskState::WaitingUpstreamInfo
    }

    /// Upstream answered `GetInfo`; chunks come next.
    pub fn set_info(&mut self, total_bytes: u64, total_chunks: u32) {
        self.assembly = Assembly::new(total_bytes, total_chunks);
        self.state = GetTaskState::WaitingUpstreamChunk;
    }

    /// Index of the next chunk to request from upstream.
    pub fn next_upstream_index(&self) -> u32 {
        self.assembly.next_index()
    }

    /// Store a chunk received from upstream.
    pub fn accept_chunk(&mut self, index: u32, data: Bytes) -> Result<ChunkProgress, ChunkError> {
        self.assembly.accept(index, data)
    }

    pub fn mark_ready(&mut self) {
        self.state = GetTaskState::Ready;
    }

    pub fn chunk(&self, index: u32) -> Option<Bytes> {
        self.assembly.chunks.get(index as usize).cloned()
    }

    /// The whole serialized value, once every chunk is present.
    pub fn data(&self) -> Bytes {
        self.assembly.concat()
    }

    pub fn subscribe(&mut self, channel: ChannelId, state: SubscriberState) {
        self.subscribers.insert(channel, state);
    }

    pub fn unsubscribe(&mut self, channel: ChannelId) -> Option<SubscriberState> {
        self.subscribers.remove(&channel)
    }

    /// Subscribers waiting for `GetInfo`.
    pub fn waiting_info(&self) -> Vec<ChannelId> {
        self.subscribers
            .iter()
            .filter(|(_, state)| **state == SubscriberState::WaitingInfo)
            .map(|(channel, _)| *channel)
            .collect()
    }

    /// Subscribers waiting for chunk `index`.
    pub fn waiting_chunk(&self, index: u32) -> Vec<ChannelId> {
        self.subscribers
            .iter()
            .filter(|(_, state)| **state == SubscriberState::WaitingChunk(index))
            .map(|(channel, _)| *channel)
            .collect()
    }

    /// A ready task nobody is reading from can be dropped.
    pub fn is_idle(&self) -> bool {
        self.is_ready() && self.subscribers.is_empty()
    }
}

/// A stored value being pushed to upstream, one chunk per acknowledgement.
#[derive(Debug)]
pub struct RemoteRelayTask {
    data: Bytes,
    total_chunks: u32,
    chunks_sent: u32,
}

impl RemoteRelayTask {
    pub fn new(data: Bytes) -> Self {
        let total_chunks = chunk::chunk_count(data.len() as u64, CHUNK_SIZE);
        Self {
            data,
            total_chunks,
            chunks_sent: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn chunks_sent(&self) -> u32 {
        self.chunks_sent
    }

    /// The next chunk to send, or `None` once all were sent.
    pub fn next_chunk(&mut self) -> Option<(u32, Bytes)> {
        if self.chunks_sent >= self.total_chunks {
            return None;
        }
        let index = self.chunks_sent;
        self.chunks_sent += 1;
        Some((index, chunk::get_chunk_bytes(&self.data, index, CHUNK_SIZE)))
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_sent >= self.total_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_task_accepts_in_order() {
        let mut task = AddTask::new(10, 3);
        assert_eq!(
            task.accept_chunk(0, Bytes::from_static(b"abcd")),
            Ok(ChunkProgress::Partial)
        );
        assert_eq!(
            task.accept_chunk(1, Bytes::from_static(b"efg")),
            Ok(ChunkProgress::Partial)
        );
        assert_eq!(
            task.accept_chunk(2, Bytes::from_static(b"hij")),
            Ok(ChunkProgress::Complete)
        );
        assert_eq!(task.received_bytes(), 10);
        assert_eq!(task.into_bytes(), Bytes::from_static(b"abcdefghij"));
    }

    #[test]
    fn test_add_task_rejects_wrong_index() {
        let mut task = AddTask::new(10, 2);
        assert_eq!(
            task.accept_chunk(1, Bytes::from_static(b"abcde")),
            Err(ChunkError::UnexpectedIndex { expected: 0, got: 1 })
        );
        assert!(matches!(
            task.accept_chunk(2, Bytes::from_static(b"abcde")),
            Err(ChunkError::TooManyChunks { index: 2, total: 2 })
        ));
    }

    #[test]
    fn test_add_task_length_rules() {
        // Empty non-final chunk.
        let mut task = AddTask::new(10, 2);
        assert!(matches!(
            task.accept_chunk(0, Bytes::new()),
            Err(ChunkError::LengthMismatch { .. })
        ));

        // Non-final chunk that consumes everything.
        let mut task = AddTask::new(4, 2);
        assert!(task.accept_chunk(0, Bytes::from_static(b"abcd")).is_err());

        // Final chunk short of the total.
        let mut task = AddTask::new(5, 1);
        assert!(task.accept_chunk(0, Bytes::from_static(b"abcd")).is_err());

        // Final chunk over the total.
        let mut task = AddTask::new(3, 1);
        assert!(task.accept_chunk(0, Bytes::from_static(b"abcd")).is_err());
    }

    #[test]
    fn test_fetching_task_progress() {
        let mut task = GetTask::fetching();
        let a = ChannelId::next();
        let b = ChannelId::next();
        task.subscribe(a, SubscriberState::WaitingInfo);
        task.subscribe(b, SubscriberState::WaitingChunk(1));
        assert!(!task.has_info());
        assert_eq!(task.waiting_info(), vec![a]);

        task.set_info(6, 2);
        assert_eq!(task.state(), GetTaskState::WaitingUpstreamChunk);
        assert_eq!(task.next_upstream_index(), 0);
        assert_eq!(
            task.accept_chunk(0, Bytes::from_static(b"abc")),
            Ok(ChunkProgress::Partial)
        );
        assert_eq!(task.next_upstream_index(), 1);
        assert_eq!(task.waiting_chunk(1), vec![b]);
        assert_eq!(
            task.accept_chunk(1, Bytes::from_static(b"def")),
            Ok(ChunkProgress::Complete)
        );
        task.mark_ready();
        assert!(task.is_ready());
        assert_eq!(task.chunk(0), Some(Bytes::from_static(b"abc")));
        assert!(task.chunk(2).is_none());
        assert_eq!(task.data(), Bytes::from_static(b"abcdef"));
        assert!(!task.is_idle());
        task.unsubscribe(a);
        task.unsubscribe(b);
        assert!(task.is_idle());
    }

    #[test]
    fn test_relay_task_walks_chunks() {
        let mut task = RemoteRelayTask::new(Bytes::from(vec![1u8; CHUNK_SIZE * 2 + 1]));
        assert_eq!(task.total_chunks(), 3);
        assert_eq!(task.next_chunk().map(|(i, d)| (i, d.len())), Some((0, CHUNK_SIZE)));
        assert_eq!(task.next_chunk().map(|(i, d)| (i, d.len())), Some((1, CHUNK_SIZE)));
        assert!(!task.is_complete());
        assert_eq!(task.next_chunk().map(|(i, d)| (i, d.len())), Some((2, 1)));
        assert!(task.is_complete());
        assert!(task.next_chunk().is_none());
    }
}
