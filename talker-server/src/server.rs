//! Server state and listeners.
//!
//! One [`Server`] owns both listening roles: the client listener where
//! humans connect, and the optional peer listener other servers dial. The
//! [`SharedState`] maps are written from a single task each and read from
//! client sessions, the same way the rest of the state is partitioned:
//! connection senders by their session tasks, the peer directory by the
//! mesh core, the route table by the topology observer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::config::ServerConfig;
use crate::connection;
use crate::error::BindError;
use crate::id::ServerId;
use crate::mesh::{self, MeshHandle};
use crate::observer::ObserverRegistry;
use crate::speech::SpeechObserver;
use crate::topo::{RouteTable, TopologyObserver};

/// Reactor shutdown grace: how long a stopping server waits for its
/// connections to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared between the mesh core, observers, and client sessions.
pub struct SharedState {
    pub config: ServerConfig,
    pub local_id: ServerId,
    /// session id -> sender for writing lines to that client.
    pub connections: Mutex<HashMap<String, mpsc::Sender<String>>>,
    /// UP peers, mirrored from the mesh core for `/peers` answers.
    pub peer_directory: Mutex<BTreeMap<ServerId, SocketAddr>>,
    /// Peer listener addresses already bound; makes `/peer-listen`
    /// idempotent per bind.
    pub peer_listeners: Mutex<HashSet<String>>,
    /// Replicated topology, written by the topology observer.
    pub route_table: Arc<Mutex<RouteTable>>,
}

impl SharedState {
    /// Write one line to every local client.
    pub fn tell_speakers(&self, line: &str) {
        let connections = self.connections.lock().unwrap();
        for (session_id, tx) in connections.iter() {
            if tx.try_send(line.to_string()).is_err() {
                tracing::warn!(%session_id, "client write queue full or closed");
            }
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

/// A started server: bound addresses plus handles for tests and for the
/// launcher's shutdown path.
pub struct ServerHandle {
    pub client_addr: SocketAddr,
    pub peer_addr: Option<SocketAddr>,
    pub state: Arc<SharedState>,
    pub mesh: MeshHandle,
    shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    /// Ask every task to stop: listeners stop accepting, connections
    /// close with SHUTDOWN.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for connections and peer links to drain, bounded by `grace`.
    pub async fn wait_drained(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let drained = self.state.connections.lock().unwrap().is_empty()
                && self.state.peer_directory.lock().unwrap().is_empty();
            if drained || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run until the operator interrupts, then shut down gracefully.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");
        handle.shutdown();
        handle.wait_drained(SHUTDOWN_GRACE).await;
        Ok(())
    }

    /// Bind all listeners and start every task. Tests call this with
    /// port 0 and read the bound addresses off the handle.
    pub async fn start(self) -> Result<ServerHandle> {
        let local_id = match &self.config.id {
            Some(hex) => ServerId::parse(hex)
                .ok_or_else(|| anyhow::anyhow!("--id must be 32 hex characters"))?,
            None => ServerId::random(),
        };
        tracing::info!(id = %local_id, "server identity");

        let client_listener = bind(&self.config.listen).await?;
        let client_addr = client_listener.local_addr()?;

        let peer_listener = match &self.config.peer_listen {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };
        let peer_addr = match &peer_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let route_table = Arc::new(Mutex::new(RouteTable::new()));
        let state = Arc::new(SharedState {
            local_id,
            connections: Mutex::new(HashMap::new()),
            peer_directory: Mutex::new(BTreeMap::new()),
            peer_listeners: Mutex::new(HashSet::new()),
            route_table: Arc::clone(&route_table),
            config: self.config.clone(),
        });

        // Registration order is dispatch order.
        let mut registry = ObserverRegistry::new();
        registry.register(Box::new(SpeechObserver::new(Arc::clone(&state))));
        registry.register(Box::new(TopologyObserver::new(
            local_id,
            route_table,
            Duration::from_secs(self.config.stale_secs),
        )));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mesh = mesh::spawn(
            local_id,
            self.config.seen_capacity,
            self.config.max_record_len,
            registry,
            Arc::clone(&state),
            shutdown_rx,
        );

        // Forward the operator's stop into the mesh core.
        {
            let mesh = mesh.clone();
            tokio::spawn(async move {
                mesh.shutdown_signal().await;
                mesh.signal_shutdown().await;
            });
        }

        // Refresh timer: periodic peer-set re-broadcast and stale pruning.
        {
            let mesh = mesh.clone();
            let period = Duration::from_secs(self.config.refresh_secs.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // skip the immediate first tick
                loop {
                    tokio::select! {
                        _ = mesh.shutdown_signal() => break,
                        _ = interval.tick() => mesh.tick().await,
                    }
                }
            });
        }

        if let (Some(listener), Some(requested)) = (peer_listener, &self.config.peer_listen) {
            let bound = listener.local_addr()?;
            state.peer_listeners.lock().unwrap().insert(requested.clone());
            tokio::spawn(mesh::run_peer_listener(listener, mesh.clone()));
            tracing::info!(addr = %bound, "peer listener ready");
        }

        // Dial the configured peers. Failures are logged, not retried.
        for peer in &self.config.peers {
            let mesh = mesh.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                match mesh.connect_peer(&peer).await {
                    Ok(addr) => tracing::info!(%addr, "dialed peer"),
                    Err(e) => tracing::warn!(peer = %peer, "failed to dial peer: {e}"),
                }
            });
        }

        // Client accept loop.
        {
            let state = Arc::clone(&state);
            let mesh = mesh.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = mesh.shutdown_signal() => break,
                        accepted = client_listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                let state = Arc::clone(&state);
                                let mesh = mesh.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = connection::handle(stream, state, mesh).await {
                                        tracing::error!("connection error: {e}");
                                    }
                                });
                            }
                            Err(e) => tracing::error!("client accept error: {e}"),
                        },
                    }
                }
                tracing::debug!("client listener stopped");
            });
        }
        tracing::info!(addr = %client_addr, "client listener ready");

        Ok(ServerHandle {
            client_addr,
            peer_addr,
            state,
            mesh,
            shutdown: shutdown_tx,
        })
    }
}

async fn bind(addr: &str) -> Result<TcpListener, BindError> {
    TcpListener::bind(addr).await.map_err(|source| BindError {
        addr: addr.to_string(),
        source,
    })
}
