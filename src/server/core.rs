//! Server lifecycle: startup, the event loop, autosave and shutdown.
//!
//! [`start`] loads the persisted store, binds the cache protocol listener,
//! connects the upstream (if configured), starts the optional admin API,
//! and spawns the event loop. The loop owns the [`Orchestrator`] and
//! multiplexes proxy events, the periodic tick and the shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::persist::StoreFile;
use crate::cache::store::{Store, StoreError};
use crate::client::proxy::{ClientEvent, ClientProxy, ConnectionState};
use crate::config::Config;
use crate::server::admin::{build_router, AdminState};
use crate::server::metrics::ServerMetrics;
use crate::server::orchestrator::{CacheStats, Input, Orchestrator};
use crate::server::proxy::ServerProxy;

/// A running server. Dropping the handle also stops the server, without
/// waiting for the final save.
pub struct ServerHandle {
    local_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    stats: watch::Receiver<CacheStats>,
    metrics: Arc<ServerMetrics>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ServerHandle {
    /// Address of the cache protocol listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Latest published stats (refreshed every tick).
    pub fn stats(&self) -> CacheStats {
        self.stats.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<CacheStats> {
        self.stats.clone()
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Stop the server and wait for the store to be saved.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.send_replace(true);
        self.task.await?
    }
}

/// Start a server with `config`.
pub async fn start(config: Config) -> anyhow::Result<ServerHandle> {
    let node_name = config.server.resolve_node_name();

    let store_file = StoreFile::new(&config.storage.root, config.storage.zstd_level);
    let mut store = Store::new(&config.storage);
    let restored = store.restore(store_file.load_or_empty().await);
    info!(
        node = %node_name,
        items = restored,
        used = store.used_bytes(),
        capacity = store.capacity_bytes(),
        "Store loaded"
    );

    let metrics = Arc::new(ServerMetrics::new()?);
    let mut server = ServerProxy::new();
    let local_addr = server.listen(&config.server.listen_addr()).await?;

    let upstream = config.upstream.as_ref().map(|_| ClientProxy::new());
    let max_relays = config
        .upstream
        .as_ref()
        .map_or(1, |u| u.max_relays_in_flight);
    let mut orchestrator = Orchestrator::new(
        node_name,
        server,
        upstream,
        store,
        max_relays,
        metrics.clone(),
    );
    if let Some(upstream) = &config.upstream {
        orchestrator.connect_upstream(&upstream.addr());
    }

    let (stats_tx, stats_rx) = watch::channel(orchestrator.stats());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr = match &config.server.admin_listen {
        Some(addr) => Some(
            spawn_admin(addr, stats_rx.clone(), metrics.clone(), shutdown_rx.clone()).await?,
        ),
        None => None,
    };

    let event_loop = EventLoop {
        orchestrator,
        store_file,
        config,
        stats: stats_tx,
        shutdown: shutdown_rx,
        save_task: None,
        last_save: Instant::now(),
        reconnect_at: None,
    };
    let task = tokio::spawn(event_loop.run());

    Ok(ServerHandle {
        local_addr,
        admin_addr,
        stats: stats_rx,
        metrics,
        shutdown: shutdown_tx,
        task,
    })
}

async fn spawn_admin(
    addr: &str,
    stats: watch::Receiver<CacheStats>,
    metrics: Arc<ServerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(Arc::new(AdminState {
        stats,
        metrics,
        start_time: Instant::now(),
    }));
    info!(addr = %local_addr, "Admin API listening");

    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!("Admin API failed: {e}");
        }
    });
    Ok(local_addr)
}

/// What woke the event loop.
enum Step {
    Input(Input),
    Tick,
    Stop,
}

struct EventLoop {
    orchestrator: Orchestrator,
    store_file: StoreFile,
    config: Config,
    stats: watch::Sender<CacheStats>,
    shutdown: watch::Receiver<bool>,
    save_task: Option<JoinHandle<Result<u64, StoreError>>>,
    last_save: Instant,
    reconnect_at: Option<Instant>,
}

impl EventLoop {
    async fn run(mut self) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.config.server.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let shutdown = &mut self.shutdown;
            let step = tokio::select! {
                input = self.orchestrator.next_input() => Step::Input(input),
                _ = tick.tick() => Step::Tick,
                // Also fires when the handle is dropped.
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => Step::Stop,
            };

            match step {
                Step::Input(input) => {
                    if matches!(
                        input,
                        Input::Upstream(ClientEvent::StateChanged(ConnectionState::Disconnected))
                    ) {
                        self.schedule_reconnect();
                    }
                    self.orchestrator.handle(input);
                }
                Step::Tick => self.on_tick(),
                Step::Stop => break,
            }
        }

        self.finish().await
    }

    fn on_tick(&mut self) {
        self.orchestrator.on_tick();
        self.maybe_reconnect();
        self.maybe_autosave();

        let stats = self.orchestrator.stats();
        self.stats.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }

    fn schedule_reconnect(&mut self) {
        let interval = self
            .config
            .upstream
            .as_ref()
            .and_then(|u| u.reconnect_interval());
        if let Some(interval) = interval {
            debug!(?interval, "Upstream reconnect scheduled");
            self.reconnect_at = Some(Instant::now() + interval);
        }
    }

    fn maybe_reconnect(&mut self) {
        let Some(at) = self.reconnect_at else {
            return;
        };
        if Instant::now() < at {
            return;
        }
        self.reconnect_at = None;
        if let Some(upstream) = &self.config.upstream {
            self.orchestrator.connect_upstream(&upstream.addr());
        }
    }

    fn maybe_autosave(&mut self) {
        if let Some(task) = self.save_task.take() {
            if !task.is_finished() {
                self.save_task = Some(task);
                return;
            }
            self.check_save(task.now_or_never());
        }

        let Some(interval) = self.config.storage.autosave_interval() else {
            return;
        };
        if self.last_save.elapsed() < interval || !self.orchestrator.store().is_dirty() {
            return;
        }

        let snapshot = self.orchestrator.store().snapshot();
        self.orchestrator.store_mut().mark_clean();
        self.last_save = Instant::now();
        debug!(items = snapshot.entries.len(), "Autosaving store");

        let file = self.store_file.clone();
        self.save_task = Some(tokio::spawn(async move { file.save(snapshot).await }));
    }

    fn check_save(&mut self, result: Option<Result<Result<u64, StoreError>, tokio::task::JoinError>>) {
        match result {
            Some(Ok(Ok(bytes))) => debug!(bytes, "Autosave complete"),
            Some(Ok(Err(e))) => {
                error!(path = %self.store_file.path().display(), "Autosave failed: {e}");
                self.orchestrator.store_mut().mark_dirty();
            }
            Some(Err(e)) => {
                error!("Autosave task failed: {e}");
                self.orchestrator.store_mut().mark_dirty();
            }
            None => {}
        }
    }

    async fn finish(mut self) -> anyhow::Result<()> {
        info!("Shutting down cache server");
        self.orchestrator.shutdown();

        if let Some(task) = self.save_task.take() {
            let result = task.await;
            self.check_save(Some(result));
        }
        if self.orchestrator.store().is_dirty() {
            let store = self.orchestrator.store();
            match self.store_file.save(store.snapshot()).await {
                Ok(bytes) => info!(bytes, items = store.len(), "Store saved"),
                Err(e) => {
                    warn!(path = %self.store_file.path().display(), "Final save failed: {e}");
                    return Err(e.into());
                }
            }
        }

        self.stats.send_replace(self.orchestrator.stats());
        Ok(())
    }
}
