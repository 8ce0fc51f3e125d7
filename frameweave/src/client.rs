// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The render client: process entry point of a render node.
//!
//! [Client::run] connects to the server (dialling back through the
//! launcher's client args, or directly for in-process render nodes),
//! maps the configuration session and then serves entity-creation
//! commands until the server shuts the process down or the connection
//! is lost.

use std::collections::HashMap;
use std::sync::Arc;

use frameweave_net::connection::ConnectionDescription;
use frameweave_net::node::{ListenOptions, LocalNode};
use frameweave_net::object::EntityCommand;
use frameweave_net::{NetError, ObjectId};
use tokio::sync::mpsc;

use crate::channel::{ChannelHandler, ChannelView};
use crate::commands::ClientCommand;
use crate::node::{spawn_node, NodeHandler, NodeServices};
use crate::pipe::PipeHandler;
use crate::window::WindowHandler;
use crate::window_system::{HeadlessWindow, SystemWindow};
use crate::{ClientError, ClientResult};

/// Creates the application's handler instances as the server
/// instantiates the hierarchy on this process
pub trait NodeFactory: Send + Sync + 'static {
    /// The node-level handler
    fn create_node(&self) -> Box<dyn NodeHandler>;

    /// A pipe-level handler
    fn create_pipe(&self) -> Box<dyn PipeHandler>;

    /// A window system plus window-level handler
    fn create_window(&self) -> (Box<dyn SystemWindow>, Box<dyn WindowHandler>);

    /// A channel-level handler carrying the application's draw code
    fn create_channel(&self) -> Box<dyn ChannelHandler>;
}

/// No-op handlers over a headless window; the default for tests and
/// benchmark configurations
pub struct DefaultFactory;

struct DefaultNode;
#[async_trait::async_trait]
impl NodeHandler for DefaultNode {}

struct DefaultPipe;
impl PipeHandler for DefaultPipe {}

struct DefaultWindow;
impl WindowHandler for DefaultWindow {}

struct DefaultChannel;
impl ChannelHandler for DefaultChannel {
    fn frame_draw(&mut self, _view: &mut ChannelView<'_>) -> ClientResult<()> {
        Ok(())
    }
}

impl NodeFactory for DefaultFactory {
    fn create_node(&self) -> Box<dyn NodeHandler> {
        Box::new(DefaultNode)
    }
    fn create_pipe(&self) -> Box<dyn PipeHandler> {
        Box::new(DefaultPipe)
    }
    fn create_window(&self) -> (Box<dyn SystemWindow>, Box<dyn WindowHandler>) {
        (Box::<HeadlessWindow>::default(), Box::new(DefaultWindow))
    }
    fn create_channel(&self) -> Box<dyn ChannelHandler> {
        Box::new(DefaultChannel)
    }
}

/// How the client reaches its server
#[derive(Debug, Clone)]
pub enum ConnectMode {
    /// Dial back using the launcher's client args
    /// (`listenerAddress#requestID`), resolving the server's pending
    /// connect
    Back(String),
    /// Connect directly, for render nodes started by hand or living in
    /// the server process
    Direct(ConnectionDescription),
}

/// Options of [Client::run]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How to reach the server
    pub mode: ConnectMode,
    /// Listener options of this process's node
    pub listen: ListenOptions,
    /// Name of the configuration session to map
    pub session: String,
}

impl ClientOptions {
    /// Options for a launched render process (`--eq-client ARGS`)
    pub fn from_client_args(args: impl Into<String>) -> Self {
        Self {
            mode: ConnectMode::Back(args.into()),
            listen: ListenOptions::default(),
            session: crate::CONFIG_SESSION.into(),
        }
    }

    /// Options for a render node connecting to a known server address
    pub fn direct(description: ConnectionDescription) -> Self {
        Self {
            mode: ConnectMode::Direct(description),
            listen: ListenOptions::default(),
            session: crate::CONFIG_SESSION.into(),
        }
    }
}

/// The render-client main loop
pub struct Client;

impl Client {
    /// Run a render node until the server shuts it down. Returns `Ok`
    /// on a clean shutdown and an error on connection loss or a failed
    /// start.
    pub async fn run(options: ClientOptions, factory: Arc<dyn NodeFactory>) -> ClientResult<()> {
        let local = LocalNode::listen(options.listen.clone()).await?;
        let server = match &options.mode {
            ConnectMode::Back(args) => local.connect_back(args).await?,
            ConnectMode::Direct(description) => {
                local.connect_peer(vec![description.clone()]).await?
            }
        };
        let session = local.map_session(&server, &options.session).await?;
        tracing::info!(
            "Render client up, session '{}' mapped as {}",
            options.session,
            session.id()
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_command_handler(tx);

        let mut disconnects = local.subscribe_disconnects();
        let mut nodes: HashMap<ObjectId, Arc<NodeServices>> = HashMap::new();
        let server_id = server.node_id();

        let result = loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break Ok(()) };
                    match Self::handle(&local, &session, &factory, &mut nodes, command) {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(err) => {
                            tracing::error!("Client command failed: {err}");
                        }
                    }
                }
                node = disconnects.recv() => {
                    if let Ok(node) = node {
                        if node == server_id {
                            tracing::error!("Connection to the server lost");
                            break Err(ClientError::Net(NetError::Closed));
                        }
                    }
                }
            }
        };

        nodes.clear();
        local.stop();
        local.wait_stopped().await;
        result
    }

    /// Returns `Ok(true)` when the server asked the process to exit
    fn handle(
        local: &Arc<LocalNode>,
        session: &Arc<frameweave_net::session::Session>,
        factory: &Arc<dyn NodeFactory>,
        nodes: &mut HashMap<ObjectId, Arc<NodeServices>>,
        command: EntityCommand,
    ) -> ClientResult<bool> {
        match ClientCommand::decode(command.command, command.body)? {
            ClientCommand::CreateNode { node, inbox } => {
                tracing::info!("Creating render node entity {node}");
                let services = spawn_node(
                    local.clone(),
                    session.clone(),
                    node,
                    inbox,
                    factory.clone(),
                );
                nodes.insert(node, services);
                Ok(false)
            }
            ClientCommand::DestroyNode { node } => {
                nodes.remove(&node);
                session.detach_object(node);
                Ok(false)
            }
            ClientCommand::Exit => {
                tracing::info!("Server requested client exit");
                Ok(true)
            }
        }
    }
}
