// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Server error types

use std::fmt::Display;

use frameweave_net::NetError;

/// Errors surfaced by the server library
#[derive(Debug)]
pub enum ServerError {
    /// A networking substrate operation failed
    Net(NetError),
    /// The configuration is not runnable as described
    InvalidConfig(String),
    /// An entity failed to initialise; the message aggregates the
    /// diagnostics reported by the render side
    InitFailed(String),
    /// A frame did not complete on every used node
    FrameFailed {
        /// The failed frame
        frame: u32,
        /// Aggregated diagnostics
        reason: String,
    },
    /// A render node was lost while the config was running
    NodeLost(String),
}

impl Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Net(err) => write!(f, "{err}"),
            Self::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            Self::InitFailed(reason) => write!(f, "initialisation failed: {reason}"),
            Self::FrameFailed { frame, reason } => {
                write!(f, "frame {frame} failed: {reason}")
            }
            Self::NodeLost(name) => write!(f, "render node '{name}' was lost"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Net(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NetError> for ServerError {
    fn from(value: NetError) -> Self {
        Self::Net(value)
    }
}
