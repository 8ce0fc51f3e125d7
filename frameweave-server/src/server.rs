// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The server process: a listening cluster node hosting config
//! sessions.

use std::sync::Arc;

use frameweave_net::connection::ConnectionDescription;
use frameweave_net::node::{ListenOptions, LocalNode};

use crate::config::Config;
use crate::spec::ConfigSpec;
use crate::ServerResult;

/// A frameweave server
pub struct Server {
    local: Arc<LocalNode>,
}

impl Server {
    /// Start listening. Render nodes find the server through the
    /// resulting listener description, which the launcher embeds into
    /// their command lines.
    pub async fn listen(options: ListenOptions) -> ServerResult<Self> {
        let local = LocalNode::listen(options).await?;
        Ok(Self { local })
    }

    /// The server's cluster node
    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local
    }

    /// A description render processes can use to reach this server
    pub fn listener_description(&self) -> ConnectionDescription {
        self.local.listener_description()
    }

    /// Instantiate a configuration on this server
    pub fn new_config(&self, spec: ConfigSpec) -> ServerResult<Config> {
        Config::new(self.local.clone(), spec)
    }

    /// Stop the server's cluster node
    pub async fn shutdown(self) {
        self.local.stop();
        self.local.wait_stopped().await;
    }
}
