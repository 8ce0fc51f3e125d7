// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Declarative configuration of a cluster.
//!
//! A [ConfigSpec] is what the configuration-file parser produces and
//! what programmatic configurations build by hand: the node / pipe /
//! window / channel tree plus the compound decomposition. The running
//! counterparts live in [crate::config].

use frameweave::types::{PixelViewport, ThreadModel};
use frameweave_net::connection::ConnectionDescription;

use crate::compound::Compound;

/// A whole cluster configuration
#[derive(Debug, Clone)]
pub struct ConfigSpec {
    /// Frames in flight beyond the current one; 1 keeps up to two
    /// frames outstanding
    pub latency: u32,
    /// The cluster machines
    pub nodes: Vec<NodeSpec>,
    /// How destination channels are composed from source channels
    pub compounds: Vec<Compound>,
}

impl Default for ConfigSpec {
    fn default() -> Self {
        Self {
            latency: 1,
            nodes: Vec::new(),
            compounds: Vec::new(),
        }
    }
}

/// One cluster machine, running one render process
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Diagnostic name
    pub name: String,
    /// How to reach (and launch) the render process
    pub descriptions: Vec<ConnectionDescription>,
    /// Local frame synchronisation model
    pub thread_model: ThreadModel,
    /// The GPUs of this machine
    pub pipes: Vec<PipeSpec>,
}

impl NodeSpec {
    /// A node with a single description
    pub fn new(name: impl Into<String>, description: ConnectionDescription) -> Self {
        Self {
            name: name.into(),
            descriptions: vec![description],
            thread_model: ThreadModel::default(),
            pipes: Vec::new(),
        }
    }
}

/// One GPU or display connection
#[derive(Debug, Clone)]
pub struct PipeSpec {
    /// Diagnostic name
    pub name: String,
    /// GPU / display index
    pub device: u32,
    /// The windows driven by this pipe
    pub windows: Vec<WindowSpec>,
}

impl PipeSpec {
    /// A pipe on device 0
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: 0,
            windows: Vec::new(),
        }
    }
}

/// One OS window plus GL context
#[derive(Debug, Clone)]
pub struct WindowSpec {
    /// Diagnostic name
    pub name: String,
    /// Requested geometry
    pub pvp: PixelViewport,
    /// The viewports of this window
    pub channels: Vec<ChannelSpec>,
}

impl WindowSpec {
    /// A window with a default 800x600 geometry
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pvp: PixelViewport {
                x: 0,
                y: 0,
                w: 800,
                h: 600,
            },
            channels: Vec::new(),
        }
    }
}

/// One viewport within a window, the unit of draw
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Name referenced by compounds; unique within the config
    pub name: String,
}

impl ChannelSpec {
    /// A named channel
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
