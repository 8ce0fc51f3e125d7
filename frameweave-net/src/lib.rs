// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! `frameweave-net`: the networking substrate of the frameweave parallel
//! rendering framework.
//!
//! ## Overview
//!
//! A cluster is a peer-to-peer network of [node::LocalNode]s, one per
//! process. Exactly one node per process is *listening*; remote peers are
//! tracked as [node::Peer]s which are either connected or launched-but-not-
//! yet-connected. All cluster state above the byte-stream level is built
//! from a small set of primitives:
//!
//! 1. [connection::Connection] - a reliable, ordered, bidirectional byte
//!    pipe (TCP socket or local socket pair) carrying length-prefixed
//!    [packet::Packet]s
//! 2. [connection_set::ConnectionSet] - wait-for-any-event multiplexing
//!    over a dynamic set of connections
//! 3. [session::Session] - a naming scope for versioned, replicated
//!    [object::Object]s with master/slave instancing
//! 4. [barrier::Barrier] - an N-party cluster barrier built as a
//!    distributed object
//! 5. [requests::RequestCache] - one-shot request/reply matching for
//!    split-phase commands
//! 6. [launch::Launcher] - spawns remote render processes through a
//!    parameterised shell command
//!
//! The render and server hierarchies of the framework live in the
//! `frameweave` and `frameweave-server` crates and are ordinary users of
//! this substrate.

#![warn(missing_docs)]

use std::fmt::Display;

pub mod barrier;
pub mod connection;
pub mod connection_set;
pub mod error;
pub mod launch;
pub mod node;
pub mod object;
pub mod packet;
pub mod requests;
pub mod session;

pub use error::NetError;

/// A result whose error is a [NetError]
pub type NetResult<T> = Result<T, NetError>;

// ========================= Identifiers ========================= //

/// Globally unique node identifier, generated once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u128);

impl NodeId {
    /// The all-zero id, never assigned to a live node
    pub const ZERO: NodeId = NodeId(0);

    /// Generate a fresh, globally unique node identifier
    pub fn generate() -> Self {
        NodeId(rand::random::<u128>())
    }

    /// Is this a real node id?
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Session identifier, unique within the serving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Sentinel for "no session", used on the wire for map-by-name requests
    pub const INVALID: SessionId = SessionId(u32::MAX);

    /// Is this a real session id?
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object identifier, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Sentinel for "no object"
    pub const INVALID: ObjectId = ObjectId(u32::MAX);

    /// Is this a real object id?
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing version counter of a distributed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version(pub u32);

impl Version {
    /// The version of an object which has never been committed
    pub const NONE: Version = Version(0);

    /// The next version after this one. Versions do not wrap within a
    /// session.
    pub fn next(&self) -> Version {
        Version(self.0 + 1)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Request identifier handed out by a [requests::RequestCache]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u32);

impl RequestId {
    /// Sentinel for "no pending request"
    pub const INVALID: RequestId = RequestId(u32::MAX);

    /// Is this a real request id?
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The default TCP listener port, overridable with `EQ_DEFAULT_PORT`
pub fn default_port() -> u16 {
    static PORT: once_cell::sync::Lazy<u16> = once_cell::sync::Lazy::new(|| {
        std::env::var("EQ_DEFAULT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4242)
    });
    *PORT
}
