//! # A line-oriented talker server with a peer mesh.
//!
//! Each server instance listens in two roles: a *client* role where humans
//! (or netcat) send lines of speech and slash commands, and a *peer* role
//! where other servers connect to exchange mesh datagrams. Utterances are
//! flooded across the whole peer graph with duplicate suppression, so every
//! client on every reachable server sees every line exactly once.
//!
//! Architecture:
//!
//! ```text
//!  client TCP ──► connection ──┐                       ┌──► peer link (writer)
//!  client TCP ──► connection ──┤    ┌────────────┐     ├──► peer link (writer)
//!                              ├───►│ mesh core  │◄────┤
//!  peer link (reader) ─────────┤    │ task       │     │  SeenSet, RouteTable,
//!  peer link (reader) ─────────┘    └────────────┘     │  observers, peer set
//!                                        │
//!                                        ▼
//!                              observers: speech fan-out to local
//!                              clients, topology tracking
//! ```
//!
//! All mesh state (the peer-link set, the duplicate-suppression cache, the
//! route table, the observer registry) is owned by a single task and mutated
//! only there; every other task talks to it over a command channel.

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod id;
pub mod mesh;
pub mod observer;
pub mod seen;
pub mod server;
pub mod speech;
pub mod topo;
pub mod wire;
