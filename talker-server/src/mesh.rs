//! The mesh hub: peer links and reliable flooding.
//!
//! Servers connect to each other over plain TCP, forming a possibly-cyclic
//! graph. Each link starts with a `HELLO` exchange binding the connection
//! to the remote's server id; after that both sides exchange `MSG` records.
//! Broadcasts flood the graph: every server forwards a datagram to all of
//! its `UP` links except the one it arrived on, and a bounded seen-set
//! drops the copies that loop back. Together those two rules terminate the
//! flood on any graph.
//!
//! All mesh state lives in a single core task fed by a command channel.
//! Peer links get one reader task (framed lines in, commands out) and one
//! writer task (queued lines out); neither touches shared state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration};
use tokio_util::codec::FramedRead;

use crate::connection::{finish_writer, spawn_line_writer};
use crate::error::CloseReason;
use crate::framing::{FramingError, LineCodec};
use crate::id::{MessageId, ServerId};
use crate::observer::{ObserverCtx, ObserverRegistry, Outgoing, PeerInfo};
use crate::seen::SeenSet;
use crate::server::SharedState;
use crate::wire::{Hello, MeshDatagram, PROTOCOL_VERSION};

/// HELLO must complete within this window of TCP establishment.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound line queue depth per peer link.
const PEER_QUEUE: usize = 256;

/// Which side opened the connection. Relevant only for the duplicate-link
/// tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Instructions for the mesh core task.
pub(crate) enum Command {
    Broadcast {
        kind: String,
        payload: Vec<u8>,
        ttl: Option<u32>,
        recipient: Option<ServerId>,
    },
    PeerUp {
        link: LinkEntry,
        accepted: oneshot::Sender<bool>,
    },
    PeerRecord {
        link_id: u64,
        remote: ServerId,
        line: bytes::Bytes,
    },
    PeerGone {
        link_id: u64,
        remote: ServerId,
        reason: CloseReason,
    },
    ClosePeer {
        remote: ServerId,
        reason: CloseReason,
    },
    Tick,
    Shutdown,
}

/// One `UP` peer link, as the core sees it.
pub(crate) struct LinkEntry {
    pub link_id: u64,
    pub remote: ServerId,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub tx: mpsc::Sender<String>,
    pub close_tx: mpsc::Sender<CloseReason>,
}

/// Cheap handle for talking to the mesh core from anywhere.
#[derive(Clone)]
pub struct MeshHandle {
    local_id: ServerId,
    cmd: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
    max_record_len: usize,
}

impl MeshHandle {
    pub fn local_id(&self) -> ServerId {
        self.local_id
    }

    /// Flood a datagram to the whole mesh. Local observers are notified
    /// before the datagram reaches any peer link.
    pub async fn broadcast(
        &self,
        kind: &str,
        payload: Vec<u8>,
        ttl: Option<u32>,
        recipient: Option<ServerId>,
    ) {
        let _ = self
            .cmd
            .send(Command::Broadcast {
                kind: kind.to_string(),
                payload,
                ttl,
                recipient,
            })
            .await;
    }

    /// Orderly close of one direct peer link.
    pub async fn close_peer(&self, remote: ServerId) {
        let _ = self
            .cmd
            .send(Command::ClosePeer {
                remote,
                reason: CloseReason::Shutdown,
            })
            .await;
    }

    /// Dial an outbound peer. Returns once the TCP connect succeeds; the
    /// handshake continues in the background and failures are logged, not
    /// retried.
    pub async fn connect_peer(&self, addr: &str) -> Result<SocketAddr> {
        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr()?;
        self.attach_transport(stream, peer_addr, Direction::Outbound);
        Ok(peer_addr)
    }

    /// Run the peer protocol over an arbitrary transport. This is the seam
    /// the in-memory tests use in place of OS sockets.
    pub fn attach_transport<S>(&self, stream: S, addr: SocketAddr, direction: Direction)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tokio::spawn(run_peer_link(stream, addr, direction, self.clone()));
    }

    pub(crate) async fn tick(&self) {
        let _ = self.cmd.send(Command::Tick).await;
    }

    pub(crate) async fn signal_shutdown(&self) {
        let _ = self.cmd.send(Command::Shutdown).await;
    }

    /// Resolves when the operator has asked the server to stop.
    pub(crate) async fn shutdown_signal(&self) {
        let mut rx = self.shutdown.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Start the mesh core task and return its handle.
pub(crate) fn spawn(
    local_id: ServerId,
    seen_capacity: usize,
    max_record_len: usize,
    registry: ObserverRegistry,
    state: Arc<SharedState>,
    shutdown: watch::Receiver<bool>,
) -> MeshHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(1024);
    let core = MeshCore {
        local_id,
        counter: 0,
        seen: SeenSet::new(seen_capacity),
        peers: HashMap::new(),
        registry,
        state,
    };
    tokio::spawn(run_mesh(core, cmd_rx));
    MeshHandle {
        local_id,
        cmd: cmd_tx,
        shutdown,
        max_record_len,
    }
}

struct MeshCore {
    local_id: ServerId,
    counter: u64,
    seen: SeenSet,
    peers: HashMap<ServerId, LinkEntry>,
    registry: ObserverRegistry,
    state: Arc<SharedState>,
}

async fn run_mesh(mut core: MeshCore, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Broadcast {
                kind,
                payload,
                ttl,
                recipient,
            } => core.originate(kind, payload, ttl, recipient),
            Command::PeerUp { link, accepted } => core.on_peer_up(link, accepted),
            Command::PeerRecord {
                link_id,
                remote,
                line,
            } => core.on_peer_record(link_id, remote, &line),
            Command::PeerGone {
                link_id,
                remote,
                reason,
            } => core.on_peer_gone(link_id, remote, reason),
            Command::ClosePeer { remote, reason } => core.close_peer(&remote, reason),
            Command::Tick => core.on_tick(),
            Command::Shutdown => {
                core.shutdown();
                break;
            }
        }
    }
    tracing::debug!("mesh core task finished");
}

impl MeshCore {
    fn next_id(&mut self) -> MessageId {
        self.counter += 1;
        MessageId {
            origin: self.local_id,
            counter: self.counter,
        }
    }

    /// Originate a broadcast: fresh id, record it as seen, notify local
    /// observers, then enqueue onto every `UP` link.
    fn originate(
        &mut self,
        kind: String,
        payload: Vec<u8>,
        ttl: Option<u32>,
        recipient: Option<ServerId>,
    ) {
        let datagram = MeshDatagram {
            id: self.next_id(),
            kind,
            ttl,
            recipient,
            reply_to: None,
            payload,
        };
        self.seen.insert(datagram.id);
        self.dispatch(None, &datagram);
        self.forward(&datagram, None);
    }

    /// Send a datagram on exactly one link. Still gets a fresh id in the
    /// seen-set so an echo cannot re-trigger observers. Local observers
    /// are not notified.
    fn unicast(&mut self, peer: ServerId, kind: String, payload: Vec<u8>, ttl: Option<u32>) {
        let datagram = MeshDatagram {
            id: self.next_id(),
            kind,
            ttl,
            recipient: None,
            reply_to: None,
            payload,
        };
        self.seen.insert(datagram.id);
        match self.peers.get(&peer) {
            Some(link) => send_line(&link.tx, datagram.encode(), &peer),
            None => tracing::debug!(peer = %peer, "unicast target is no longer a direct peer"),
        }
    }

    fn forward(&mut self, datagram: &MeshDatagram, except: Option<u64>) {
        if self.peers.is_empty() {
            return;
        }
        let line = datagram.encode();
        for (remote, link) in &self.peers {
            if Some(link.link_id) == except {
                continue;
            }
            send_line(&link.tx, line.clone(), remote);
        }
    }

    fn dispatch(&mut self, from: Option<&PeerInfo>, datagram: &MeshDatagram) {
        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(self.local_id, &mut outgoing);
        self.registry.notify(&mut ctx, from, datagram);
        self.apply_outgoing(outgoing);
    }

    /// Apply sends queued by observers during a dispatch. Queueing them
    /// keeps observer callbacks re-entrant: a broadcast made from inside a
    /// notification simply lands here.
    fn apply_outgoing(&mut self, outgoing: Vec<Outgoing>) {
        for action in outgoing {
            match action {
                Outgoing::Broadcast { kind, payload, ttl } => {
                    self.originate(kind, payload, ttl, None)
                }
                Outgoing::Unicast {
                    peer,
                    kind,
                    payload,
                    ttl,
                } => self.unicast(peer, kind, payload, ttl),
            }
        }
    }

    /// The receive path: dedup, forward with split-horizon, then notify.
    fn on_peer_record(&mut self, link_id: u64, remote: ServerId, line: &[u8]) {
        // Only the currently-registered link for a remote feeds the mesh;
        // a superseded duplicate may still have records in flight.
        let from = match self.peers.get(&remote) {
            Some(link) if link.link_id == link_id => PeerInfo {
                id: remote,
                addr: link.addr,
            },
            _ => {
                tracing::trace!(peer = %remote, "record from a superseded link, dropped");
                return;
            }
        };

        let datagram = match MeshDatagram::decode(line) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::warn!(peer = %remote, error = %e, "malformed peer record");
                self.close_peer(&remote, CloseReason::Malformed);
                return;
            }
        };

        if !self.seen.insert(datagram.id) {
            tracing::trace!(id = %datagram.id, "duplicate datagram suppressed");
            return;
        }

        // Forward first, never back on the arriving link. A ttl of zero
        // stops the flood here but observers still hear about it.
        match datagram.ttl {
            Some(0) => {}
            _ => {
                let mut onward = datagram.clone();
                if let Some(ttl) = onward.ttl {
                    onward.ttl = Some(ttl - 1);
                }
                self.forward(&onward, Some(link_id));
            }
        }

        self.dispatch(Some(&from), &datagram);
    }

    fn on_peer_up(&mut self, link: LinkEntry, accepted: oneshot::Sender<bool>) {
        let replaced = match self.peers.get(&link.remote) {
            None => false,
            Some(existing) => {
                if !keep_new_link(self.local_id, link.remote, existing.direction, link.direction) {
                    tracing::info!(
                        peer = %link.remote,
                        reason = %CloseReason::DuplicatePeer,
                        "rejecting duplicate peer link"
                    );
                    let _ = accepted.send(false);
                    return;
                }
                let _ = existing.close_tx.try_send(CloseReason::DuplicatePeer);
                true
            }
        };

        let info = PeerInfo {
            id: link.remote,
            addr: link.addr,
        };
        tracing::info!(
            peer = %link.remote,
            addr = %link.addr,
            direction = ?link.direction,
            replaced,
            "peer link up"
        );
        self.state
            .peer_directory
            .lock()
            .unwrap()
            .insert(link.remote, link.addr);
        self.peers.insert(link.remote, link);
        let _ = accepted.send(true);

        // A replacement keeps the same remote in the peer set, so
        // observers only hear about genuinely new peers.
        if !replaced {
            let mut outgoing = Vec::new();
            let mut ctx = ObserverCtx::new(self.local_id, &mut outgoing);
            self.registry.peer_up(&mut ctx, &info);
            self.apply_outgoing(outgoing);
        }
    }

    fn on_peer_gone(&mut self, link_id: u64, remote: ServerId, reason: CloseReason) {
        // Generation check: a replacement link may own this remote now.
        let addr = match self.peers.get(&remote) {
            Some(link) if link.link_id == link_id => link.addr,
            _ => return,
        };
        self.peers.remove(&remote);
        self.state.peer_directory.lock().unwrap().remove(&remote);
        tracing::info!(peer = %remote, %reason, "peer link removed");

        let info = PeerInfo { id: remote, addr };
        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(self.local_id, &mut outgoing);
        self.registry.peer_down(&mut ctx, &info);
        self.apply_outgoing(outgoing);
    }

    fn close_peer(&mut self, remote: &ServerId, reason: CloseReason) {
        if let Some(link) = self.peers.get(remote) {
            let _ = link.close_tx.try_send(reason);
        }
    }

    fn on_tick(&mut self) {
        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(self.local_id, &mut outgoing);
        self.registry.tick(&mut ctx);
        self.apply_outgoing(outgoing);
    }

    fn shutdown(&mut self) {
        for link in self.peers.values() {
            let _ = link.close_tx.try_send(CloseReason::Shutdown);
        }
        self.peers.clear();
        self.state.peer_directory.lock().unwrap().clear();
    }
}

/// Duplicate-link tie-break. Same direction: the established link wins.
/// Opposite directions: the endpoint with the lower server id keeps its
/// outbound link, so both ends independently pick the same survivor.
fn keep_new_link(
    local: ServerId,
    remote: ServerId,
    existing: Direction,
    new: Direction,
) -> bool {
    if existing == new {
        return false;
    }
    let keep_outbound = local < remote;
    (new == Direction::Outbound) == keep_outbound
}

fn send_line(tx: &mpsc::Sender<String>, line: String, peer: &ServerId) {
    if tx.try_send(line).is_err() {
        tracing::warn!(peer = %peer, "peer write queue full or closed, dropping record");
    }
}

/// Accept loop for one peer listener.
pub(crate) async fn run_peer_listener(listener: TcpListener, handle: MeshHandle) {
    loop {
        tokio::select! {
            _ = handle.shutdown_signal() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "inbound peer connection");
                    handle.attach_transport(stream, addr, Direction::Inbound);
                }
                Err(e) => tracing::error!("peer accept error: {e}"),
            },
        }
    }
}

/// Drive one peer link from TCP establishment to teardown.
async fn run_peer_link<S>(stream: S, addr: SocketAddr, direction: Direction, handle: MeshHandle)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    static LINK_IDS: AtomicU64 = AtomicU64::new(0);
    let link_id = LINK_IDS.fetch_add(1, Ordering::Relaxed);

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut records = FramedRead::new(read_half, LineCodec::new(handle.max_record_len));

    // HELLO goes out immediately; the remote's must arrive in time.
    let hello = Hello {
        server_id: handle.local_id,
        version: PROTOCOL_VERSION,
    };
    if let Err(e) = write_half
        .write_all(format!("{}\r\n", hello.encode()).as_bytes())
        .await
    {
        tracing::warn!(%addr, "failed to send HELLO: {e}");
        return;
    }

    let remote = match timeout(HANDSHAKE_TIMEOUT, records.next()).await {
        Err(_) => {
            tracing::warn!(%addr, reason = %CloseReason::HandshakeTimeout, "peer link closed");
            return;
        }
        Ok(None) => {
            tracing::info!(%addr, "peer disconnected during handshake");
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!(%addr, "handshake read error: {e}");
            return;
        }
        Ok(Some(Ok(line))) => match Hello::decode(&line) {
            Err(e) => {
                tracing::warn!(%addr, reason = %CloseReason::Malformed, "bad HELLO: {e}");
                return;
            }
            Ok(h) if h.version != PROTOCOL_VERSION => {
                tracing::warn!(
                    %addr,
                    version = h.version,
                    reason = %CloseReason::Protocol,
                    "incompatible peer protocol version"
                );
                return;
            }
            Ok(h) if h.server_id == handle.local_id => {
                tracing::warn!(%addr, reason = %CloseReason::Protocol, "refusing self-connect");
                return;
            }
            Ok(h) => h.server_id,
        },
    };

    // Handshake done; register with the core. The tie-break may turn this
    // link away if the remote is already connected.
    let (write_tx, write_rx) = mpsc::channel::<String>(PEER_QUEUE);
    let (close_tx, mut close_rx) = mpsc::channel::<CloseReason>(1);
    let writer = spawn_line_writer(write_rx, write_half);
    let (accepted_tx, accepted_rx) = oneshot::channel();
    let entry = LinkEntry {
        link_id,
        remote,
        addr,
        direction,
        tx: write_tx,
        close_tx,
    };
    if handle
        .cmd
        .send(Command::PeerUp {
            link: entry,
            accepted: accepted_tx,
        })
        .await
        .is_err()
    {
        writer.abort();
        return;
    }
    if !accepted_rx.await.unwrap_or(false) {
        tracing::info!(peer = %remote, %addr, reason = %CloseReason::DuplicatePeer, "peer link closed");
        finish_writer(writer).await;
        return;
    }

    let reason;
    loop {
        tokio::select! {
            closed = close_rx.recv() => {
                reason = closed.unwrap_or(CloseReason::Io);
                break;
            }
            record = records.next() => match record {
                None => {
                    reason = CloseReason::Io;
                    break;
                }
                Some(Err(FramingError::Oversize(limit))) => {
                    tracing::warn!(peer = %remote, limit, "oversize peer record");
                    reason = CloseReason::Oversize;
                    break;
                }
                Some(Err(FramingError::Io(e))) => {
                    tracing::warn!(peer = %remote, "peer read error: {e}");
                    reason = CloseReason::Io;
                    break;
                }
                Some(Ok(line)) => {
                    if handle
                        .cmd
                        .send(Command::PeerRecord { link_id, remote, line })
                        .await
                        .is_err()
                    {
                        reason = CloseReason::Shutdown;
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(peer = %remote, %addr, %reason, "peer link closed");
    let _ = handle
        .cmd
        .send(Command::PeerGone {
            link_id,
            remote,
            reason,
        })
        .await;
    finish_writer(writer).await;
}
