// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Render-node error types

use std::fmt::Display;

use frameweave_net::NetError;

/// Errors surfaced by the render-node library
#[derive(Debug)]
pub enum ClientError {
    /// A networking substrate operation failed
    Net(NetError),
    /// The window system refused a resource (context, framebuffer)
    WindowSystem(String),
    /// A command body could not be decoded
    BadCommand(String),
    /// An entity was addressed that this process does not host
    NoSuchEntity(frameweave_net::ObjectId),
    /// A user callback reported failure
    Callback(String),
}

impl Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Net(err) => write!(f, "{err}"),
            Self::WindowSystem(reason) => write!(f, "window system error: {reason}"),
            Self::BadCommand(reason) => write!(f, "malformed command: {reason}"),
            Self::NoSuchEntity(id) => write!(f, "no entity with object id {id} on this node"),
            Self::Callback(reason) => write!(f, "callback failed: {reason}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Net(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NetError> for ClientError {
    fn from(value: NetError) -> Self {
        Self::Net(value)
    }
}
