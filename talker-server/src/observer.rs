//! In-process subscribers to mesh datagrams.
//!
//! Observers are registered once at startup and dispatched from the mesh
//! core task only, so implementations never need interior synchronisation
//! for their own state. Callbacks must not block; anything they want to
//! send goes through [`ObserverCtx`], which queues the action for the core
//! to apply once the current dispatch completes. That queueing is what
//! makes it safe for a callback to broadcast while a broadcast is being
//! dispatched.

use std::net::SocketAddr;

use crate::id::ServerId;
use crate::wire::MeshDatagram;

/// A direct peer, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: ServerId,
    pub addr: SocketAddr,
}

/// Mesh sends queued by an observer during dispatch.
#[derive(Debug)]
pub enum Outgoing {
    Broadcast {
        kind: String,
        payload: Vec<u8>,
        ttl: Option<u32>,
    },
    Unicast {
        peer: ServerId,
        kind: String,
        payload: Vec<u8>,
        ttl: Option<u32>,
    },
}

/// Handed to observers on every callback.
pub struct ObserverCtx<'a> {
    local_id: ServerId,
    outgoing: &'a mut Vec<Outgoing>,
}

impl<'a> ObserverCtx<'a> {
    pub(crate) fn new(local_id: ServerId, outgoing: &'a mut Vec<Outgoing>) -> Self {
        Self { local_id, outgoing }
    }

    pub fn local_id(&self) -> ServerId {
        self.local_id
    }

    /// Queue a broadcast to the whole mesh (local observers included).
    pub fn broadcast(&mut self, kind: &str, payload: Vec<u8>) {
        self.outgoing.push(Outgoing::Broadcast {
            kind: kind.to_string(),
            payload,
            ttl: None,
        });
    }

    /// Queue a datagram for exactly one direct peer.
    pub fn unicast(&mut self, peer: ServerId, kind: &str, payload: Vec<u8>, ttl: Option<u32>) {
        self.outgoing.push(Outgoing::Unicast {
            peer,
            kind: kind.to_string(),
            payload,
            ttl,
        });
    }
}

/// A subscriber keyed on datagram type tags.
pub trait MeshObserver: Send {
    /// Type tags this observer wants, matched exactly.
    fn interests(&self) -> &[&'static str];

    /// Opt in to skipping datagrams addressed to some other server.
    /// Generic observers see every datagram of their type regardless of
    /// the recipient field.
    fn recipient_filtered(&self) -> bool {
        false
    }

    /// Called at most once per message id per server. `from` is the link
    /// the datagram arrived on, or `None` for locally originated ones.
    fn on_datagram(
        &mut self,
        ctx: &mut ObserverCtx<'_>,
        from: Option<&PeerInfo>,
        datagram: &MeshDatagram,
    );

    /// A peer link reached UP.
    fn peer_up(&mut self, _ctx: &mut ObserverCtx<'_>, _peer: &PeerInfo) {}

    /// A peer link closed.
    fn peer_down(&mut self, _ctx: &mut ObserverCtx<'_>, _peer: &PeerInfo) {}

    /// Periodic housekeeping, driven by the mesh core timer.
    fn tick(&mut self, _ctx: &mut ObserverCtx<'_>) {}
}

/// Ordered set of observers; dispatch follows registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<Box<dyn MeshObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Box<dyn MeshObserver>) {
        self.observers.push(observer);
    }

    pub fn notify(
        &mut self,
        ctx: &mut ObserverCtx<'_>,
        from: Option<&PeerInfo>,
        datagram: &MeshDatagram,
    ) {
        let addressed_elsewhere = datagram
            .recipient
            .is_some_and(|to| to != ctx.local_id());
        for observer in &mut self.observers {
            if !observer.interests().contains(&datagram.kind.as_str()) {
                continue;
            }
            if addressed_elsewhere && observer.recipient_filtered() {
                continue;
            }
            observer.on_datagram(ctx, from, datagram);
        }
    }

    pub fn peer_up(&mut self, ctx: &mut ObserverCtx<'_>, peer: &PeerInfo) {
        for observer in &mut self.observers {
            observer.peer_up(ctx, peer);
        }
    }

    pub fn peer_down(&mut self, ctx: &mut ObserverCtx<'_>, peer: &PeerInfo) {
        for observer in &mut self.observers {
            observer.peer_down(ctx, peer);
        }
    }

    pub fn tick(&mut self, ctx: &mut ObserverCtx<'_>) {
        for observer in &mut self.observers {
            observer.tick(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MessageId;

    struct Recorder {
        tag: &'static str,
        filtered: bool,
        log: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
        name: &'static str,
    }

    impl MeshObserver for Recorder {
        fn interests(&self) -> &[&'static str] {
            std::slice::from_ref(&self.tag)
        }

        fn recipient_filtered(&self) -> bool {
            self.filtered
        }

        fn on_datagram(
            &mut self,
            _ctx: &mut ObserverCtx<'_>,
            _from: Option<&PeerInfo>,
            _datagram: &MeshDatagram,
        ) {
            self.log.lock().unwrap().push(self.name.to_string());
        }
    }

    fn datagram(kind: &str, recipient: Option<ServerId>) -> MeshDatagram {
        MeshDatagram {
            id: MessageId {
                origin: ServerId::random(),
                counter: 1,
            },
            kind: kind.to_string(),
            ttl: None,
            recipient,
            reply_to: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn dispatch_matches_tag_in_registration_order() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = ObserverRegistry::new();
        registry.register(Box::new(Recorder {
            tag: "A",
            filtered: false,
            log: log.clone(),
            name: "first",
        }));
        registry.register(Box::new(Recorder {
            tag: "B",
            filtered: false,
            log: log.clone(),
            name: "other",
        }));
        registry.register(Box::new(Recorder {
            tag: "A",
            filtered: false,
            log: log.clone(),
            name: "second",
        }));

        let local = ServerId::random();
        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(local, &mut outgoing);
        registry.notify(&mut ctx, None, &datagram("A", None));

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn recipient_filter_skips_only_opted_in_observers() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = ObserverRegistry::new();
        registry.register(Box::new(Recorder {
            tag: "A",
            filtered: true,
            log: log.clone(),
            name: "filtered",
        }));
        registry.register(Box::new(Recorder {
            tag: "A",
            filtered: false,
            log: log.clone(),
            name: "generic",
        }));

        let local = ServerId::random();
        let elsewhere = ServerId::random();
        let mut outgoing = Vec::new();
        let mut ctx = ObserverCtx::new(local, &mut outgoing);

        registry.notify(&mut ctx, None, &datagram("A", Some(elsewhere)));
        assert_eq!(*log.lock().unwrap(), vec!["generic"]);

        log.lock().unwrap().clear();
        registry.notify(&mut ctx, None, &datagram("A", Some(local)));
        assert_eq!(*log.lock().unwrap(), vec!["filtered", "generic"]);
    }
}
