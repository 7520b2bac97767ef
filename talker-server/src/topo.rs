//! Topology tracking over the mesh.
//!
//! Every server maintains a fully-replicated view of the peer graph. The
//! `I-AM` datagram a server sends on each fresh link bootstraps discovery;
//! after that, each server floods a versioned `PEER-SET` record of its
//! direct peers whenever that set changes, and periodically as a refresh.
//! Collating those records gives an eventually-consistent map of who is
//! connected to whom, from which the reachable-server set falls out by
//! breadth-first search.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::id::ServerId;
use crate::observer::{MeshObserver, ObserverCtx, PeerInfo};
use crate::wire::MeshDatagram;

/// Sent on a fresh link to assert direct reachability. Carries `ttl=0` so
/// it is never forwarded: a relayed `I-AM` would claim adjacency two hops
/// away.
pub const I_AM: &str = "I-AM";

/// Versioned direct-peer listing, flooded to the whole mesh.
pub const PEER_SET: &str = "PEER-SET";

/// One origin's claimed direct-peer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSetEntry {
    pub peers: BTreeSet<ServerId>,
    pub version: u64,
    pub refreshed: Instant,
}

/// Outcome of applying a received `PEER-SET` to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// First record for this origin.
    Inserted,
    /// Newer version superseded the stored entry.
    Replaced,
    /// Same version, same peers; only the staleness clock moved.
    Refreshed,
    /// Older than the stored version; ignored.
    Stale,
    /// Same version but different peers. The origin is misbehaving;
    /// the stored entry wins.
    Collision,
}

/// The replicated peer-graph state, keyed by originating server.
/// Entries for other servers change only through [`RouteTable::apply`];
/// the local entry is maintained by the topology observer.
#[derive(Default)]
pub struct RouteTable {
    entries: HashMap<ServerId, PeerSetEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a received `(version, peers)` claim for `origin`. Versions are
    /// monotonic per origin: an entry is never replaced by an older one.
    pub fn apply(
        &mut self,
        origin: ServerId,
        version: u64,
        peers: BTreeSet<ServerId>,
        now: Instant,
    ) -> Applied {
        match self.entries.get_mut(&origin) {
            None => {
                self.entries.insert(
                    origin,
                    PeerSetEntry {
                        peers,
                        version,
                        refreshed: now,
                    },
                );
                Applied::Inserted
            }
            Some(entry) if version > entry.version => {
                *entry = PeerSetEntry {
                    peers,
                    version,
                    refreshed: now,
                };
                Applied::Replaced
            }
            Some(entry) if version == entry.version => {
                if entry.peers == peers {
                    entry.refreshed = now;
                    Applied::Refreshed
                } else {
                    Applied::Collision
                }
            }
            Some(_) => Applied::Stale,
        }
    }

    /// Install or update the local server's own entry.
    pub fn set_local(
        &mut self,
        local: ServerId,
        version: u64,
        peers: BTreeSet<ServerId>,
        now: Instant,
    ) {
        self.entries.insert(
            local,
            PeerSetEntry {
                peers,
                version,
                refreshed: now,
            },
        );
    }

    /// Breadth-first search over claimed peer edges, starting at `from`.
    pub fn reachable(&self, from: ServerId) -> BTreeSet<ServerId> {
        let mut reached = BTreeSet::new();
        let mut frontier = vec![from];
        reached.insert(from);
        while let Some(node) = frontier.pop() {
            if let Some(entry) = self.entries.get(&node) {
                for peer in &entry.peers {
                    if reached.insert(*peer) {
                        frontier.push(*peer);
                    }
                }
            }
        }
        reached
    }

    /// Drop entries that have gone `ttl` without a refresh, keeping the
    /// local entry. Returns the pruned origins.
    pub fn prune_stale(&mut self, keep: ServerId, ttl: Duration, now: Instant) -> Vec<ServerId> {
        let mut pruned = Vec::new();
        self.entries.retain(|origin, entry| {
            if *origin == keep || now.duration_since(entry.refreshed) < ttl {
                true
            } else {
                pruned.push(*origin);
                false
            }
        });
        pruned
    }

    pub fn get(&self, origin: &ServerId) -> Option<&PeerSetEntry> {
        self.entries.get(origin)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn encode_peer_set(version: u64, peers: &BTreeSet<ServerId>) -> Vec<u8> {
    let ids: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
    format!("{version}|{}", ids.join(";")).into_bytes()
}

fn parse_peer_set(payload: &[u8]) -> Option<(u64, BTreeSet<ServerId>)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (version, ids) = text.split_once('|')?;
    let version = version.parse().ok()?;
    let mut peers = BTreeSet::new();
    for id in ids.split(';').filter(|s| !s.is_empty()) {
        peers.insert(ServerId::parse(id)?);
    }
    Some((version, peers))
}

/// Subscribes to `I-AM` and `PEER-SET`; owns the local peer-set version
/// counter and the route table. The table sits behind a mutex purely so
/// client sessions can answer `/reachable`; it is only ever written from
/// the mesh core task.
pub struct TopologyObserver {
    local_id: ServerId,
    table: Arc<Mutex<RouteTable>>,
    direct: BTreeMap<ServerId, Option<SocketAddr>>,
    version: u64,
    stale_after: Duration,
}

impl TopologyObserver {
    pub fn new(local_id: ServerId, table: Arc<Mutex<RouteTable>>, stale_after: Duration) -> Self {
        table
            .lock()
            .unwrap()
            .set_local(local_id, 0, BTreeSet::new(), Instant::now());
        Self {
            local_id,
            table,
            direct: BTreeMap::new(),
            version: 0,
            stale_after,
        }
    }

    fn direct_ids(&self) -> BTreeSet<ServerId> {
        self.direct.keys().copied().collect()
    }

    /// The local peer set changed: bump the version and flood it.
    fn bump_and_announce(&mut self, ctx: &mut ObserverCtx<'_>) {
        self.version += 1;
        self.announce(ctx);
    }

    /// Flood the current peer set at the current version. Recipients that
    /// already hold this version treat it as a refresh.
    fn announce(&mut self, ctx: &mut ObserverCtx<'_>) {
        let peers = self.direct_ids();
        self.table
            .lock()
            .unwrap()
            .set_local(self.local_id, self.version, peers.clone(), Instant::now());
        ctx.broadcast(PEER_SET, encode_peer_set(self.version, &peers));
    }

    fn recv_i_am(&mut self, ctx: &mut ObserverCtx<'_>, link: &PeerInfo, datagram: &MeshDatagram) {
        if datagram.id.origin != link.id {
            tracing::warn!(
                origin = %datagram.id.origin,
                link = %link.id,
                "I-AM origin does not match the link it arrived on, ignoring"
            );
            return;
        }
        if self.direct.contains_key(&link.id) {
            tracing::debug!(peer = %link.id, "I-AM from already-known peer");
        } else {
            self.direct.insert(link.id, Some(link.addr));
            self.bump_and_announce(ctx);
        }
    }

    fn recv_peer_set(&mut self, ctx: &mut ObserverCtx<'_>, datagram: &MeshDatagram) {
        let Some((version, peers)) = parse_peer_set(&datagram.payload) else {
            tracing::warn!(origin = %datagram.id.origin, "unparseable PEER-SET payload, ignoring");
            return;
        };
        let applied =
            self.table
                .lock()
                .unwrap()
                .apply(datagram.id.origin, version, peers, Instant::now());
        match applied {
            Applied::Inserted => {
                // A server we had never heard of joined the network; flood
                // our own peer set so it learns about us in turn.
                tracing::info!(origin = %datagram.id.origin, "new server in topology");
                self.announce(ctx);
            }
            Applied::Collision => {
                tracing::warn!(
                    origin = %datagram.id.origin,
                    version,
                    "VERSION_COLLISION: same version, different peer set"
                );
            }
            Applied::Replaced | Applied::Refreshed | Applied::Stale => {}
        }
    }
}

impl MeshObserver for TopologyObserver {
    fn interests(&self) -> &[&'static str] {
        &[I_AM, PEER_SET]
    }

    fn on_datagram(
        &mut self,
        ctx: &mut ObserverCtx<'_>,
        from: Option<&PeerInfo>,
        datagram: &MeshDatagram,
    ) {
        if datagram.id.origin == self.local_id {
            return;
        }
        match datagram.kind.as_str() {
            I_AM => {
                if let Some(link) = from {
                    self.recv_i_am(ctx, link, datagram);
                }
            }
            PEER_SET => self.recv_peer_set(ctx, datagram),
            _ => {}
        }
    }

    fn peer_up(&mut self, ctx: &mut ObserverCtx<'_>, peer: &PeerInfo) {
        ctx.unicast(peer.id, I_AM, Vec::new(), Some(0));
        self.direct.insert(peer.id, Some(peer.addr));
        self.bump_and_announce(ctx);
    }

    fn peer_down(&mut self, ctx: &mut ObserverCtx<'_>, peer: &PeerInfo) {
        if self.direct.remove(&peer.id).is_some() {
            self.bump_and_announce(ctx);
        }
    }

    fn tick(&mut self, ctx: &mut ObserverCtx<'_>) {
        let pruned = self.table.lock().unwrap().prune_stale(
            self.local_id,
            self.stale_after,
            Instant::now(),
        );
        for origin in pruned {
            tracing::info!(%origin, "pruned stale topology entry");
        }
        self.announce(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MessageId;
    use crate::observer::Outgoing;

    fn ids(n: usize) -> Vec<ServerId> {
        (0..n).map(|_| ServerId::random()).collect()
    }

    fn entry(version: u64, peers: &[ServerId]) -> (u64, BTreeSet<ServerId>) {
        (version, peers.iter().copied().collect())
    }

    #[test]
    fn apply_is_monotonic_per_origin() {
        let now = Instant::now();
        let all = ids(3);
        let (origin, a, b) = (all[0], all[1], all[2]);
        let mut table = RouteTable::new();

        let (v, peers) = entry(2, &[a]);
        assert_eq!(table.apply(origin, v, peers, now), Applied::Inserted);

        let (v, peers) = entry(1, &[b]);
        assert_eq!(table.apply(origin, v, peers, now), Applied::Stale);
        assert_eq!(table.get(&origin).unwrap().peers, [a].into());

        let (v, peers) = entry(3, &[b]);
        assert_eq!(table.apply(origin, v, peers, now), Applied::Replaced);
        assert_eq!(table.get(&origin).unwrap().version, 3);
    }

    #[test]
    fn same_version_same_peers_is_a_refresh() {
        let t0 = Instant::now();
        let all = ids(2);
        let (origin, a) = (all[0], all[1]);
        let mut table = RouteTable::new();

        let (v, peers) = entry(1, &[a]);
        table.apply(origin, v, peers.clone(), t0);
        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(table.apply(origin, v, peers, t1), Applied::Refreshed);
        assert_eq!(table.get(&origin).unwrap().refreshed, t1);
    }

    #[test]
    fn same_version_different_peers_is_a_collision() {
        let now = Instant::now();
        let all = ids(3);
        let (origin, a, b) = (all[0], all[1], all[2]);
        let mut table = RouteTable::new();

        let (v, peers) = entry(1, &[a]);
        table.apply(origin, v, peers, now);
        let (v, peers) = entry(1, &[b]);
        assert_eq!(table.apply(origin, v, peers, now), Applied::Collision);
        // The stored entry is untouched.
        assert_eq!(table.get(&origin).unwrap().peers, [a].into());
    }

    #[test]
    fn applying_the_same_record_twice_is_a_noop() {
        let now = Instant::now();
        let all = ids(2);
        let (origin, a) = (all[0], all[1]);
        let mut table = RouteTable::new();

        let (v, peers) = entry(1, &[a]);
        table.apply(origin, v, peers.clone(), now);
        let before = table.get(&origin).unwrap().clone();
        table.apply(origin, v, peers, now);
        assert_eq!(*table.get(&origin).unwrap(), before);
    }

    #[test]
    fn reachable_walks_the_line() {
        let now = Instant::now();
        let all = ids(3);
        let (a, b, c) = (all[0], all[1], all[2]);
        let mut table = RouteTable::new();
        table.set_local(a, 1, [b].into(), now);
        table.apply(b, 1, [a, c].into(), now);
        table.apply(c, 1, [b].into(), now);

        assert_eq!(table.reachable(a), [a, b, c].into());

        // Sever b-c: reachability contracts even though c's entry remains.
        table.apply(b, 2, [a].into(), now);
        assert_eq!(table.reachable(a), [a, b].into());
        assert!(table.get(&c).is_some());
    }

    #[test]
    fn reachable_ignores_unknown_edges() {
        let now = Instant::now();
        let all = ids(3);
        let (a, b, c) = (all[0], all[1], all[2]);
        let mut table = RouteTable::new();
        table.set_local(a, 1, [b].into(), now);
        // b claims c but c has no entry; it still counts as reachable.
        table.apply(b, 1, [c].into(), now);
        assert_eq!(table.reachable(a), [a, b, c].into());
    }

    #[test]
    fn prune_drops_only_stale_non_local_entries() {
        let t0 = Instant::now();
        let all = ids(3);
        let (local, fresh, stale) = (all[0], all[1], all[2]);
        let mut table = RouteTable::new();
        table.set_local(local, 1, BTreeSet::new(), t0);
        table.apply(stale, 1, BTreeSet::new(), t0);
        let t1 = t0 + Duration::from_secs(200);
        table.apply(fresh, 1, BTreeSet::new(), t1);

        let t2 = t0 + Duration::from_secs(301);
        let pruned = table.prune_stale(local, Duration::from_secs(300), t2);
        assert_eq!(pruned, vec![stale]);
        assert!(table.get(&local).is_some());
        assert!(table.get(&fresh).is_some());
    }

    #[test]
    fn peer_set_payload_roundtrip() {
        let peers: BTreeSet<ServerId> = ids(3).into_iter().collect();
        let payload = encode_peer_set(7, &peers);
        assert_eq!(parse_peer_set(&payload), Some((7, peers)));

        let empty = encode_peer_set(2, &BTreeSet::new());
        assert_eq!(parse_peer_set(&empty), Some((2, BTreeSet::new())));

        assert!(parse_peer_set(b"not-a-peer-set").is_none());
    }

    // ── Observer behaviour ──────────────────────────────────────────

    fn peer_info(id: ServerId) -> PeerInfo {
        PeerInfo {
            id,
            addr: "127.0.0.1:1".parse().unwrap(),
        }
    }

    fn peer_set_datagram(origin: ServerId, version: u64, peers: &[ServerId]) -> MeshDatagram {
        MeshDatagram {
            id: MessageId { origin, counter: 1 },
            kind: PEER_SET.to_string(),
            ttl: None,
            recipient: None,
            reply_to: None,
            payload: encode_peer_set(version, &peers.iter().copied().collect()),
        }
    }

    #[test]
    fn peer_up_sends_i_am_and_floods_peer_set() {
        let local = ServerId::random();
        let remote = ServerId::random();
        let table = Arc::new(Mutex::new(RouteTable::new()));
        let mut topo = TopologyObserver::new(local, table.clone(), Duration::from_secs(300));

        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(local, &mut outgoing);
        topo.peer_up(&mut ctx, &peer_info(remote));

        assert!(matches!(
            &outgoing[0],
            Outgoing::Unicast { peer, kind, ttl: Some(0), .. }
                if *peer == remote && kind == I_AM
        ));
        assert!(matches!(
            &outgoing[1],
            Outgoing::Broadcast { kind, .. } if kind == PEER_SET
        ));
        assert_eq!(table.lock().unwrap().get(&local).unwrap().peers, [remote].into());
    }

    #[test]
    fn peer_down_bumps_version_and_empties_set() {
        let local = ServerId::random();
        let remote = ServerId::random();
        let table = Arc::new(Mutex::new(RouteTable::new()));
        let mut topo = TopologyObserver::new(local, table.clone(), Duration::from_secs(300));

        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(local, &mut outgoing);
        topo.peer_up(&mut ctx, &peer_info(remote));
        topo.peer_down(&mut ctx, &peer_info(remote));

        let table = table.lock().unwrap();
        let entry = table.get(&local).unwrap();
        assert_eq!(entry.version, 2);
        assert!(entry.peers.is_empty());
    }

    #[test]
    fn new_origin_triggers_an_introduction() {
        let local = ServerId::random();
        let stranger = ServerId::random();
        let table = Arc::new(Mutex::new(RouteTable::new()));
        let mut topo = TopologyObserver::new(local, table.clone(), Duration::from_secs(300));

        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(local, &mut outgoing);
        topo.on_datagram(&mut ctx, None, &peer_set_datagram(stranger, 1, &[]));
        assert!(matches!(
            &outgoing[0],
            Outgoing::Broadcast { kind, .. } if kind == PEER_SET
        ));

        // A second record from the same origin is no longer news.
        outgoing.clear();
        let mut ctx = ObserverCtx::new(local, &mut outgoing);
        topo.on_datagram(&mut ctx, None, &peer_set_datagram(stranger, 2, &[]));
        assert!(outgoing.is_empty());
    }

    #[test]
    fn own_datagrams_are_ignored() {
        let local = ServerId::random();
        let table = Arc::new(Mutex::new(RouteTable::new()));
        let mut topo = TopologyObserver::new(local, table.clone(), Duration::from_secs(300));

        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(local, &mut outgoing);
        topo.on_datagram(&mut ctx, None, &peer_set_datagram(local, 99, &[]));
        assert!(outgoing.is_empty());
        assert_eq!(table.lock().unwrap().get(&local).unwrap().version, 0);
    }
}
