// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Error types of the networking substrate

use std::fmt::Display;

use crate::{NodeId, ObjectId, RequestId, SessionId};

/// Errors surfaced by the networking substrate.
///
/// The variants follow the failure classes of the system: connect-time
/// failures, protocol violations, liveness violations (timeouts) and
/// request-level failures reported by a peer.
#[derive(Debug)]
pub enum NetError {
    /// An underlying socket operation failed
    Io(std::io::Error),
    /// The connect handshake with a peer did not complete
    HandshakeFailed(String),
    /// A peer could not be reached on any of its connection descriptions
    Unreachable(NodeId),
    /// A launched process did not connect back within its launch timeout
    LaunchTimeout(NodeId),
    /// A received packet could not be decoded
    MalformedPacket(String),
    /// A packet carried a command unknown to its dispatch table
    UnknownCommand {
        /// The wire datatype of the offending packet
        datatype: u32,
        /// The unrecognised command value
        command: u32,
    },
    /// A packet referenced a session not mapped on this node
    NoSuchSession(SessionId),
    /// A packet referenced an object not attached to its session
    NoSuchObject(SessionId, ObjectId),
    /// A slave observed a version regression or gap on a mapped object
    VersionSkew {
        /// The object with inconsistent versions
        object: ObjectId,
        /// The version the slave holds
        have: crate::Version,
        /// The version that arrived
        got: crate::Version,
    },
    /// A barrier was not released within the enter deadline
    BarrierTimeout(ObjectId),
    /// A pending request was served with a failure by the remote side
    RequestFailed {
        /// The failed request
        request: RequestId,
        /// Human-readable reason recorded by the failing entity
        reason: String,
    },
    /// A blocking operation exceeded its deadline
    Timeout,
    /// The peer or channel went away while an operation was in flight
    Closed,
}

impl NetError {
    /// Request failure with a reason, preserving an existing reason when
    /// the error already is one.
    pub fn request_failed(request: RequestId, reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            request,
            reason: reason.into(),
        }
    }
}

impl Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "i/o error: {err}"),
            Self::HandshakeFailed(reason) => write!(f, "connect handshake failed: {reason}"),
            Self::Unreachable(node) => write!(f, "node {node} is unreachable"),
            Self::LaunchTimeout(node) => {
                write!(f, "node {node} did not connect back before the launch timeout")
            }
            Self::MalformedPacket(reason) => write!(f, "malformed packet: {reason}"),
            Self::UnknownCommand { datatype, command } => {
                write!(f, "unknown command {command} for datatype {datatype}")
            }
            Self::NoSuchSession(id) => write!(f, "session {id} is not mapped on this node"),
            Self::NoSuchObject(session, object) => {
                write!(f, "object {object} is not attached to session {session}")
            }
            Self::VersionSkew { object, have, got } => write!(
                f,
                "version skew on object {object}: have {have}, received {got}"
            ),
            Self::BarrierTimeout(id) => write!(f, "barrier {id} enter timed out"),
            Self::RequestFailed { request, reason } => {
                write!(f, "request {request} failed: {reason}")
            }
            Self::Timeout => write!(f, "operation timed out"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
