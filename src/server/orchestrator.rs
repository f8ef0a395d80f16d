//! Server orchestrator: the state machine behind one cache server.
//!
//! Owns the store, the server proxy, the optional upstream client proxy,
//! and all in-flight transfers:
//! - Adds, keyed by (channel, key), reassembled chunk by chunk
//! - Upstream fetches, keyed by key, shared by every subscriber of that
//!   key; local hits are answered straight from the store
//! - Relays of locally added values to upstream, started on tick
//!
//! Everything runs on one task; handlers never block.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::key::CacheKey;
use crate::cache::store::Store;
use crate::cache::value::CacheValue;
use crate::client::proxy::{ClientEvent, ClientProxy, ConnectionState};
use crate::net::channel::ChannelId;
use crate::protocol::chunk;
use crate::protocol::packet::{ClientResponse, ServerRequest, CHUNK_SIZE};
use crate::server::metrics::ServerMetrics;
use crate::server::proxy::{ServerEvent, ServerProxy};
use crate::server::relay::RelayQueue;
use crate::server::tasks::{AddTask, ChunkProgress, GetTask, GetTaskState, RemoteRelayTask, SubscriberState};

/// One unit of work for the orchestrator.
#[derive(Debug)]
pub enum Input {
    Server(ServerEvent),
    Upstream(ClientEvent),
}

/// Point-in-time view of a server.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub node_name: String,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub items: usize,
    pub max_items: usize,
    pub clients: usize,
    pub add_tasks: usize,
    pub get_tasks: usize,
    pub relays_pending: usize,
    pub relays_in_flight: usize,
    /// `None` when no upstream is configured.
    pub upstream: Option<ConnectionState>,
}

pub struct Orchestrator {
    node_name: String,
    server: ServerProxy,
    upstream: Option<ClientProxy>,
    store: Store,
    add_tasks: HashMap<(ChannelId, CacheKey), AddTask>,
    get_tasks: HashMap<CacheKey, GetTask>,
    relay: RelayQueue,
    warmups: VecDeque<CacheKey>,
    metrics: Arc<ServerMetrics>,
}

impl Orchestrator {
    /// `upstream` is `Some` when this server chains to another one; the
    /// proxy may still be disconnected.
    pub fn new(
        node_name: String,
        server: ServerProxy,
        upstream: Option<ClientProxy>,
        store: Store,
        max_relays_in_flight: usize,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let orchestrator = Self {
            node_name,
            server,
            upstream,
            store,
            add_tasks: HashMap::new(),
            get_tasks: HashMap::new(),
            relay: RelayQueue::new(max_relays_in_flight),
            warmups: VecDeque::new(),
            metrics,
        };
        orchestrator.refresh_gauges();
        orchestrator
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn server(&self) -> &ServerProxy {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut ServerProxy {
        &mut self.server
    }

    pub fn upstream(&self) -> Option<&ClientProxy> {
        self.upstream.as_ref()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn is_upstream_connected(&self) -> bool {
        self.upstream.as_ref().is_some_and(|u| u.is_connected())
    }

    /// Start connecting the upstream proxy. No-op without an upstream.
    pub fn connect_upstream(&mut self, addr: &str) -> bool {
        match &mut self.upstream {
            Some(upstream) => {
                info!(%addr, "Connecting to upstream");
                upstream.connect(addr)
            }
            None => false,
        }
    }

    pub fn get_task(&self, key: &CacheKey) -> Option<&GetTask> {
        self.get_tasks.get(key)
    }

    pub fn add_task_count(&self) -> usize {
        self.add_tasks.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            node_name: self.node_name.clone(),
            used_bytes: self.store.used_bytes(),
            capacity_bytes: self.store.capacity_bytes(),
            items: self.store.len(),
            max_items: self.store.max_items(),
            clients: self.server.channel_count(),
            add_tasks: self.add_tasks.len(),
            get_tasks: self.get_tasks.len(),
            relays_pending: self.relay.pending_count(),
            relays_in_flight: self.relay.in_flight_count(),
            upstream: self.upstream.as_ref().map(|u| u.state()),
        }
    }

    /// Wait for the next event from either proxy.
    pub async fn next_input(&mut self) -> Input {
        match &mut self.upstream {
            Some(upstream) => tokio::select! {
                event = self.server.next_event() => Input::Server(event),
                event = upstream.next_event() => Input::Upstream(event),
            },
            None => Input::Server(self.server.next_event().await),
        }
    }

    /// Next already-queued event, without waiting.
    pub fn poll_input(&mut self) -> Option<Input> {
        if let Some(event) = self.server.poll_event() {
            return Some(Input::Server(event));
        }
        self.upstream
            .as_mut()
            .and_then(|u| u.poll_event())
            .map(Input::Upstream)
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Server(event) => self.on_server_event(event),
            Input::Upstream(event) => self.on_upstream_event(event),
        }
    }

    /// Close every connection and forget in-flight transfers.
    pub fn shutdown(&mut self) {
        self.server.disconnect();
        if let Some(upstream) = &mut self.upstream {
            upstream.disconnect();
        }
        self.add_tasks.clear();
        self.get_tasks.clear();
        self.relay.cancel_in_flight();
    }

    // --- Client side ---------------------------------------------------

    pub fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ChannelOpened { .. } => {
                self.metrics.clients.set(self.server.channel_count() as i64);
            }
            ServerEvent::Request { channel, request } => self.on_request(channel, request),
            ServerEvent::Malformed { channel, error } => {
                debug!(%channel, "Dropping malformed packet: {error}");
                self.metrics.malformed_packets.inc();
            }
            ServerEvent::ChannelClosed { channel, .. } => self.on_channel_closed(channel),
        }
    }

    fn on_request(&mut self, channel: ChannelId, request: ServerRequest) {
        self.metrics.record_request(request.packet_type());
        match request {
            ServerRequest::AddAnnounce {
                key,
                total_bytes,
                total_chunks,
            } => self.on_add_announce(channel, key, total_bytes, total_chunks),
            ServerRequest::AddChunk { key, index, data } => {
                self.on_add_chunk(channel, key, index, data)
            }
            ServerRequest::Get { key } => self.on_get(channel, key),
            ServerRequest::GetChunk { key, index } => self.on_get_chunk(channel, key, index),
            ServerRequest::Remove { key } => {
                let removed = self.store.remove(&key);
                self.drop_ready_task(key);
                debug!(%channel, %key, removed, "Remove");
                self.refresh_gauges();
                self.server.send_remove_ack(channel, key, removed);
            }
            ServerRequest::Clear => {
                info!(%channel, items = self.store.len(), "Clearing store");
                self.store.clear();
                let ready: Vec<CacheKey> = self
                    .get_tasks
                    .iter()
                    .filter(|(_, task)| task.is_ready())
                    .map(|(key, _)| *key)
                    .collect();
                for key in ready {
                    self.cancel_get_task(key);
                }
                self.refresh_gauges();
                self.server.send_clear_ack(channel, true);
            }
            ServerRequest::Warmup { key } => {
                self.store.update_access_token(&key);
            }
            ServerRequest::Status => {
                self.server.send_status_ack(channel);
            }
        }
    }

    fn on_channel_closed(&mut self, channel: ChannelId) {
        let adds_before = self.add_tasks.len();
        self.add_tasks.retain(|(owner, _), _| *owner != channel);
        for task in self.get_tasks.values_mut() {
            task.unsubscribe(channel);
        }
        self.get_tasks.retain(|_, task| !task.is_idle());

        let dropped = adds_before - self.add_tasks.len();
        if dropped > 0 {
            debug!(%channel, dropped, "Dropped unfinished adds");
        }
        self.metrics.clients.set(self.server.channel_count() as i64);
    }

    fn on_add_announce(&mut self, channel: ChannelId, key: CacheKey, total_bytes: u64, total_chunks: u32) {
        if self.add_tasks.remove(&(channel, key)).is_some() {
            warn!(%channel, %key, "Duplicate add announce, dropping transfer");
            self.reject_add(channel, key);
            return;
        }
        if total_bytes == 0 || total_chunks == 0 || u64::from(total_chunks) > total_bytes {
            warn!(%channel, %key, total_bytes, total_chunks, "Invalid add announce");
            self.reject_add(channel, key);
            return;
        }
        if total_bytes > self.store.capacity_bytes() {
            warn!(
                %channel,
                %key,
                total_bytes,
                capacity = self.store.capacity_bytes(),
                "Item exceeds store capacity"
            );
            self.reject_add(channel, key);
            return;
        }

        debug!(%channel, %key, total_bytes, total_chunks, "Add started");
        self.add_tasks
            .insert((channel, key), AddTask::new(total_bytes, total_chunks));
        self.server.send_add_ack(channel, key, true);
    }

    fn on_add_chunk(&mut self, channel: ChannelId, key: CacheKey, index: u32, data: Bytes) {
        let Some(task) = self.add_tasks.get_mut(&(channel, key)) else {
            warn!(%channel, %key, index, "Chunk without announce");
            self.reject_add(channel, key);
            return;
        };

        match task.accept_chunk(index, data) {
            Ok(ChunkProgress::Partial) => {
                self.server.send_add_ack(channel, key, true);
            }
            Ok(ChunkProgress::Complete) => {
                let Some(task) = self.add_tasks.remove(&(channel, key)) else {
                    return;
                };
                if self.complete_add(key, task.into_bytes()) {
                    self.server.send_add_ack(channel, key, true);
                } else {
                    self.reject_add(channel, key);
                }
            }
            Err(e) => {
                warn!(%channel, %key, "Add chunk rejected: {e}");
                self.add_tasks.remove(&(channel, key));
                self.reject_add(channel, key);
            }
        }
    }

    fn complete_add(&mut self, key: CacheKey, data: Bytes) -> bool {
        let mut value = match CacheValue::deserialize(&data) {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, "Added item is corrupt: {e}");
                return false;
            }
        };
        value.description_mut().append_adding_node(&self.node_name);
        let size = value.size();

        match self.store.insert(key, value) {
            Ok(evicted) => {
                info!(%key, size, evicted = evicted.len(), "Item added");
                self.metrics.items_added.inc();
                self.metrics.evictions.inc_by(evicted.len() as u64);
                self.drop_ready_task(key);
                if self.upstream.is_some() {
                    self.relay.schedule(key);
                }
                self.refresh_gauges();
                true
            }
            Err(e) => {
                warn!(%key, "Item not stored: {e}");
                false
            }
        }
    }

    fn reject_add(&self, channel: ChannelId, key: CacheKey) {
        self.metrics.adds_rejected.inc();
        self.server.send_add_ack(channel, key, false);
    }

    fn on_get(&mut self, channel: ChannelId, key: CacheKey) {
        if let Some(task) = self.get_tasks.get_mut(&key) {
            if task.has_info() {
                task.subscribe(channel, SubscriberState::Ready);
                self.server
                    .send_get_info(channel, key, task.total_bytes(), task.total_chunks());
            } else {
                task.subscribe(channel, SubscriberState::WaitingInfo);
            }
            debug!(%channel, %key, subscribers = task.subscribers.len(), "Joined get");
            self.warm(key);
            return;
        }

        match self.store.served_bytes(&key, &self.node_name) {
            Ok(Some(data)) => {
                let total_bytes = data.len() as u64;
                let total_chunks = chunk::chunk_count(total_bytes, CHUNK_SIZE);
                debug!(%channel, %key, bytes = total_bytes, "Local hit");
                self.metrics.hits.inc();
                self.warm(key);
                if self.upstream.is_some() {
                    self.relay.schedule(key);
                }
                self.server
                    .send_get_info(channel, key, total_bytes, total_chunks);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(%key, "Stored item cannot be served: {e}"),
        }

        if self.upstream.as_ref().is_some_and(|u| u.request_get(key)) {
            let mut task = GetTask::fetching();
            task.subscribe(channel, SubscriberState::WaitingInfo);
            self.get_tasks.insert(key, task);
            self.metrics.upstream_fetches.inc();
            debug!(%channel, %key, "Fetching from upstream");
            return;
        }

        debug!(%channel, %key, "Miss");
        self.metrics.misses.inc();
        self.server.send_get_info(channel, key, 0, 0);
    }

    fn on_get_chunk(&mut self, channel: ChannelId, key: CacheKey, index: u32) {
        let Some(task) = self.get_tasks.get_mut(&key) else {
            self.serve_stored_chunk(channel, key, index);
            return;
        };

        if let Some(data) = task.chunk(index) {
            if index + 1 >= task.total_chunks() {
                task.unsubscribe(channel);
            } else {
                task.subscribe(channel, SubscriberState::Ready);
            }
            self.server.send_get_chunk(channel, key, index, data);
        } else if task.is_ready() || (task.has_info() && index >= task.total_chunks()) {
            debug!(%channel, %key, index, chunks = task.total_chunks(), "Chunk out of range");
            task.unsubscribe(channel);
            self.server.send_get_chunk(channel, key, index, Bytes::new());
        } else {
            task.subscribe(channel, SubscriberState::WaitingChunk(index));
        }
        self.prune(key);
    }

    /// Serve a chunk of a stored item. Unknown items and out-of-range
    /// indices get an empty chunk (abort).
    fn serve_stored_chunk(&mut self, channel: ChannelId, key: CacheKey, index: u32) {
        let data = match self.store.served_bytes(&key, &self.node_name) {
            Ok(Some(data)) => chunk::get_chunk_bytes(&data, index, CHUNK_SIZE),
            Ok(None) => Bytes::new(),
            Err(e) => {
                warn!(%key, "Stored item cannot be served: {e}");
                Bytes::new()
            }
        };
        if data.is_empty() {
            debug!(%channel, %key, index, "Aborting chunk request");
        }
        self.server.send_get_chunk(channel, key, index, data);
    }

    /// Refresh the local access token and pass the warmup upstream.
    fn warm(&mut self, key: CacheKey) {
        self.store.update_access_token(&key);
        if self.upstream.is_some() && !self.warmups.contains(&key) {
            self.warmups.push_back(key);
        }
    }

    /// Forget a completed fetch so later readers go to the store.
    fn drop_ready_task(&mut self, key: CacheKey) {
        if self.get_tasks.get(&key).is_some_and(|t| t.is_ready()) {
            self.cancel_get_task(key);
        }
    }

    fn prune(&mut self, key: CacheKey) {
        if self.get_tasks.get(&key).is_some_and(|t| t.is_idle()) {
            self.get_tasks.remove(&key);
        }
    }

    /// Drop a get task, telling every waiting subscriber.
    fn cancel_get_task(&mut self, key: CacheKey) {
        let Some(task) = self.get_tasks.remove(&key) else {
            return;
        };
        for (channel, state) in task.subscribers {
            match state {
                SubscriberState::WaitingInfo => {
                    self.server.send_get_info(channel, key, 0, 0);
                }
                SubscriberState::WaitingChunk(index) => {
                    self.server.send_get_chunk(channel, key, index, Bytes::new());
                }
                SubscriberState::Ready => {}
            }
        }
    }

    // --- Upstream side -------------------------------------------------

    pub fn on_upstream_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::StateChanged(ConnectionState::Connected) => {
                info!("Upstream connected");
            }
            ClientEvent::StateChanged(ConnectionState::Disconnected) => {
                self.on_upstream_disconnected();
            }
            ClientEvent::StateChanged(ConnectionState::Connecting) => {}
            ClientEvent::Response(ClientResponse::GetInfo {
                key,
                total_bytes,
                total_chunks,
            }) => self.on_upstream_info(key, total_bytes, total_chunks),
            ClientEvent::Response(ClientResponse::GetChunk { key, index, data }) => {
                self.on_upstream_chunk(key, index, data)
            }
            ClientEvent::Response(ClientResponse::AddAck { key, accepted }) => {
                self.on_relay_ack(key, accepted)
            }
            ClientEvent::Response(other) => {
                debug!(?other, "Ignoring upstream response");
            }
            ClientEvent::IncorrectPacket(e) => {
                warn!("Incorrect packet from upstream: {e}");
            }
        }
    }

    fn on_upstream_disconnected(&mut self) {
        let pending: Vec<CacheKey> = self
            .get_tasks
            .iter()
            .filter(|(_, task)| !task.is_ready())
            .map(|(key, _)| *key)
            .collect();
        for key in &pending {
            self.cancel_get_task(*key);
        }
        let relays = self.relay.cancel_in_flight();
        self.warmups.clear();
        warn!(
            cancelled_gets = pending.len(),
            cancelled_relays = relays,
            "Upstream disconnected"
        );
    }

    fn on_upstream_info(&mut self, key: CacheKey, total_bytes: u64, total_chunks: u32) {
        let capacity = self.store.capacity_bytes();
        let Some(task) = self.get_tasks.get_mut(&key) else {
            debug!(%key, "Upstream info for unknown task");
            return;
        };
        if task.state() != GetTaskState::WaitingUpstreamInfo {
            debug!(%key, "Unexpected upstream info");
            return;
        }
        if total_bytes == 0 || total_chunks == 0 {
            debug!(%key, "Upstream miss");
            self.metrics.misses.inc();
            self.cancel_get_task(key);
            return;
        }
        if total_bytes > capacity || u64::from(total_chunks) > total_bytes {
            warn!(%key, total_bytes, total_chunks, "Unusable upstream item");
            self.cancel_get_task(key);
            return;
        }

        task.set_info(total_bytes, total_chunks);
        for channel in task.waiting_info() {
            task.subscribe(channel, SubscriberState::Ready);
            self.server
                .send_get_info(channel, key, total_bytes, total_chunks);
        }
        let out_of_range: Vec<(ChannelId, u32)> = task
            .subscribers
            .iter()
            .filter_map(|(channel, state)| match state {
                SubscriberState::WaitingChunk(index) if *index >= total_chunks => {
                    Some((*channel, *index))
                }
                _ => None,
            })
            .collect();
        for (channel, index) in out_of_range {
            task.unsubscribe(channel);
            self.server.send_get_chunk(channel, key, index, Bytes::new());
        }

        if !self.upstream.as_ref().is_some_and(|u| u.request_get_chunk(key, 0)) {
            self.cancel_get_task(key);
        }
    }

    fn on_upstream_chunk(&mut self, key: CacheKey, index: u32, data: Bytes) {
        let Some(task) = self.get_tasks.get_mut(&key) else {
            debug!(%key, index, "Upstream chunk for unknown task");
            return;
        };
        if task.state() != GetTaskState::WaitingUpstreamChunk {
            debug!(%key, index, "Unexpected upstream chunk");
            return;
        }
        if data.is_empty() {
            warn!(%key, index, "Upstream aborted transfer");
            self.cancel_get_task(key);
            return;
        }
        let progress = match task.accept_chunk(index, data.clone()) {
            Ok(progress) => progress,
            Err(e) => {
                warn!(%key, "Bad upstream chunk: {e}");
                self.cancel_get_task(key);
                return;
            }
        };

        let last = index + 1 == task.total_chunks();
        for channel in task.waiting_chunk(index) {
            if last {
                task.unsubscribe(channel);
            } else {
                task.subscribe(channel, SubscriberState::Ready);
            }
            self.server.send_get_chunk(channel, key, index, data.clone());
        }

        match progress {
            ChunkProgress::Partial => {
                let next = task.next_upstream_index();
                if !self.upstream.as_ref().is_some_and(|u| u.request_get_chunk(key, next)) {
                    self.cancel_get_task(key);
                }
            }
            ChunkProgress::Complete => {
                task.mark_ready();
                let data = task.data();
                self.finish_fetch(key, data);
            }
        }
    }

    fn finish_fetch(&mut self, key: CacheKey, data: Bytes) {
        let value = match CacheValue::deserialize(&data) {
            Ok(value) if value.is_valid() => value,
            Ok(_) => {
                warn!(%key, "Upstream item is inconsistent");
                self.cancel_get_task(key);
                return;
            }
            Err(e) => {
                warn!(%key, "Upstream item is corrupt: {e}");
                self.cancel_get_task(key);
                return;
            }
        };

        let size = value.size();
        match self.store.insert(key, value) {
            Ok(evicted) => {
                info!(%key, size, evicted = evicted.len(), "Item fetched from upstream");
                self.metrics.evictions.inc_by(evicted.len() as u64);
                self.refresh_gauges();
            }
            // The task still holds the data, so subscribers are served anyway.
            Err(e) => warn!(%key, "Fetched item not stored: {e}"),
        }
        self.prune(key);
    }

    fn on_relay_ack(&mut self, key: CacheKey, accepted: bool) {
        let Some(task) = self.relay.get_mut(&key) else {
            debug!(%key, "Add ack for unknown relay");
            return;
        };
        if !accepted {
            warn!(%key, sent = task.chunks_sent(), "Upstream refused relay");
            self.relay.complete(&key);
            self.metrics.relays_failed.inc();
            return;
        }

        match task.next_chunk() {
            Some((index, data)) => {
                if !self
                    .upstream
                    .as_ref()
                    .is_some_and(|u| u.request_add_chunk(key, index, data))
                {
                    self.relay.complete(&key);
                    self.metrics.relays_failed.inc();
                }
            }
            None => {
                debug!(%key, "Relay complete");
                self.relay.complete(&key);
                self.metrics.relays_completed.inc();
            }
        }
    }

    /// Periodic work: start queued relays and forward warmups.
    pub fn on_tick(&mut self) {
        self.refresh_gauges();
        if !self.is_upstream_connected() {
            return;
        }
        self.start_relays();
        self.flush_warmups();
    }

    fn start_relays(&mut self) {
        while let Some(key) = self.relay.next() {
            let data = match self.store.get(&key).map(|entry| entry.value.serialize()) {
                Some(Ok(data)) => data,
                Some(Err(e)) => {
                    warn!(%key, "Cannot relay item: {e}");
                    self.metrics.relays_failed.inc();
                    continue;
                }
                None => {
                    debug!(%key, "Relayed item no longer stored");
                    continue;
                }
            };

            let task = RemoteRelayTask::new(data);
            let announced = self.upstream.as_ref().is_some_and(|u| {
                u.request_add_announce(key, task.total_bytes(), task.total_chunks())
            });
            if !announced {
                self.metrics.relays_failed.inc();
                break;
            }
            debug!(%key, bytes = task.total_bytes(), chunks = task.total_chunks(), "Relay started");
            self.relay.start(key, task);
        }
    }

    fn flush_warmups(&mut self) {
        let Some(upstream) = &self.upstream else {
            return;
        };
        while let Some(key) = self.warmups.pop_front() {
            if !upstream.request_warmup(key) {
                break;
            }
        }
    }

    fn refresh_gauges(&self) {
        self.metrics.used_bytes.set(self.store.used_bytes() as i64);
        self.metrics.items.set(self.store.len() as i64);
    }
}
