// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! `frameweave`: the render-node library of the frameweave parallel
//! rendering framework.
//!
//! A render process hosts a four-level execution hierarchy mirroring the
//! server-side configuration:
//!
//! * [node::RenderNode] - this host's share of the cluster; owns pipes,
//!   the frame-data and barrier caches and the frame transmitter
//! * [pipe::Pipe] - one GPU (or display connection); a dedicated task
//!   serialises every window and channel callback of the pipe
//! * [window::Window] - an OS window plus GL context behind the
//!   [window_system::SystemWindow] capability trait
//! * [channel::Channel] - a viewport within a window, the unit of draw
//!
//! Applications implement the handler traits ([node::NodeHandler],
//! [pipe::PipeHandler], [window::WindowHandler],
//! [channel::ChannelHandler]) and hand a [client::NodeFactory] to
//! [client::Client::run], which connects to the server, maps the config
//! session and executes dispatched tasks until the server shuts the
//! process down.

#![warn(missing_docs)]

pub mod channel;
pub mod client;
pub mod commands;
pub mod error;
pub mod frame_data;
pub mod image;
pub mod node;
pub mod pipe;
pub mod types;
pub mod window;
pub mod window_system;

pub use error::ClientError;

/// A result whose error is a [ClientError]
pub type ClientResult<T> = Result<T, ClientError>;

/// The well-known name of the configuration session
pub const CONFIG_SESSION: &str = "config";

/// Is per-channel debug tinting enabled (`EQ_TAINT_CHANNELS`)?
pub fn taint_channels() -> bool {
    static TAINT: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
        std::env::var("EQ_TAINT_CHANNELS")
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false)
    });
    *TAINT
}
