// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! `frameweave-server`: the server side of the frameweave parallel
//! rendering framework.
//!
//! The server owns the canonical configuration and choreographs
//! per-frame execution across the cluster:
//!
//! * [spec] - declarative description of the node / pipe / window /
//!   channel tree and the compound decomposition
//! * [config::Config] - the frame-pipeline controller: initialises the
//!   hierarchy across the cluster, drives one update per frame with a
//!   configured latency window, and tears everything down again
//! * [compound] - how destination channels are composed from source
//!   channels (sort-first viewports, sort-last ranges, readback and
//!   assembly)
//! * [swap] - groups windows into swap-locked equivalence classes
//!   backed by cluster barriers
//! * [server::Server] - the listening process hosting config sessions

#![warn(missing_docs)]

pub mod channel;
pub mod compound;
pub mod config;
pub mod error;
pub mod node;
pub mod pipe;
pub mod server;
pub mod spec;
pub mod swap;
pub mod window;

pub use error::ServerError;

/// A result whose error is a [ServerError]
pub type ServerResult<T> = Result<T, ServerError>;

/// Lifecycle state of a server-side hierarchy entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityState {
    /// Constructed, not initialised
    #[default]
    Stopped,
    /// Init started, reply outstanding
    Initialising,
    /// Initialised and rendering
    Running,
    /// Exit started or entity failed
    Stopping,
}
