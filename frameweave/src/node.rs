// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Render-node entities: one per process, owning the pipes.
//!
//! The node task drains the node command queue: entity creation, config
//! init/exit, frame start and the end-of-frame synchronisation whose
//! behaviour is governed by the configured [ThreadModel]. Shared node
//! services (frame-data cache, barrier cache, frame-image pool and the
//! transmitter) live in [NodeServices] and are used by all pipe tasks
//! of the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use frameweave_net::barrier::Barrier;
use frameweave_net::node::LocalNode;
use frameweave_net::object::{EntityCommand, SharedObject};
use frameweave_net::session::Session;
use frameweave_net::{NetError, NetResult, NodeId, ObjectId, Version};
use tokio::sync::{mpsc, watch};

use crate::client::NodeFactory;
use crate::commands::{family, CommandFamily, EntityStub, NodeCommand};
use crate::frame_data::FrameData;
use crate::image::{ImagePool, TransmitTask};
use crate::pipe::{spawn_pipe, PipeHandle};
use crate::types::ThreadModel;
use crate::ClientResult;

/// End-of-frame synchronisation deadline per node
const FRAME_FINISH_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for mapping frame data or barriers on first use
const MAP_TIMEOUT: Duration = Duration::from_secs(10);
/// Depth of the transmitter queue; readback stalls when transport
/// falls this far behind
const TRANSMIT_QUEUE_DEPTH: usize = 16;

/// Application callbacks of a render node
#[async_trait]
pub trait NodeHandler: Send {
    /// Initialise node-wide state (load data, start services)
    async fn config_init(&mut self, _init_id: u32) -> ClientResult<()> {
        Ok(())
    }

    /// Release node-wide state
    async fn config_exit(&mut self) {}

    /// A new frame begins on this node
    async fn frame_start(&mut self, _frame: u32) {}

    /// The frame's local synchronisation point was reached
    async fn frame_finish(&mut self, _frame: u32) {}
}

/// Shared services of one render process
pub struct NodeServices {
    server: NodeId,
    frame_data: tokio::sync::Mutex<HashMap<ObjectId, SharedObject<FrameData>>>,
    barriers: tokio::sync::Mutex<HashMap<ObjectId, Barrier>>,
    images: ImagePool,
    transmit_tx: mpsc::Sender<TransmitTask>,
    errors: Mutex<Vec<String>>,
    current_frame: watch::Sender<u32>,
}

impl NodeServices {
    /// The frame-image pool of this process
    pub fn images(&self) -> &ImagePool {
        &self.images
    }

    /// Record a failure for the next end-of-frame report
    pub fn record_error(&self, message: String) {
        self.errors
            .lock()
            .expect("error list poisoned")
            .push(message);
    }

    fn drain_errors(&self) -> Vec<String> {
        std::mem::take(&mut *self.errors.lock().expect("error list poisoned"))
    }

    /// Wait until frame `frame` was started on this node
    pub async fn wait_frame_started(&self, frame: u32) {
        let mut rx = self.current_frame.subscribe();
        let _ = rx.wait_for(|f| *f >= frame).await;
    }

    /// The mapped frame-data replica for `id`, mapping it on first use
    pub(crate) async fn frame_data(
        &self,
        session: &Arc<Session>,
        id: ObjectId,
    ) -> NetResult<SharedObject<FrameData>> {
        let mut cache = self.frame_data.lock().await;
        if let Some(data) = cache.get(&id) {
            return Ok(data.clone());
        }
        let data = SharedObject::new(FrameData::default());
        session.map_object(&data, id, MAP_TIMEOUT).await?;
        cache.insert(id, data.clone());
        Ok(data)
    }

    /// The mapped barrier replica for `id` at (or beyond) `version`,
    /// mapping it on first use
    pub(crate) async fn barrier(
        &self,
        session: &Arc<Session>,
        id: ObjectId,
        version: Version,
    ) -> NetResult<Barrier> {
        let barrier = {
            let mut cache = self.barriers.lock().await;
            match cache.get(&id) {
                Some(barrier) => barrier.clone(),
                None => {
                    let barrier = Barrier::map(session, id, MAP_TIMEOUT).await?;
                    cache.insert(id, barrier.clone());
                    barrier
                }
            }
        };
        barrier.sync_version(version, MAP_TIMEOUT).await?;
        Ok(barrier)
    }

    /// Queue a readback image for transmission
    pub(crate) async fn transmit(&self, task: TransmitTask) -> NetResult<()> {
        self.transmit_tx
            .send(task)
            .await
            .map_err(|_| NetError::Closed)
    }
}

/// Instantiate the render-node entity: attaches the node and inbox
/// objects, starts the transmitter and the node task
pub(crate) fn spawn_node(
    local: Arc<LocalNode>,
    session: Arc<Session>,
    node_oid: ObjectId,
    inbox_oid: ObjectId,
    factory: Arc<dyn NodeFactory>,
) -> Arc<NodeServices> {
    let server = session.server_node();
    let (transmit_tx, transmit_rx) = mpsc::channel(TRANSMIT_QUEUE_DEPTH);
    let (current_frame, _) = watch::channel(0);
    let services = Arc::new(NodeServices {
        server,
        frame_data: tokio::sync::Mutex::new(HashMap::new()),
        barriers: tokio::sync::Mutex::new(HashMap::new()),
        images: ImagePool::new(),
        transmit_tx,
        errors: Mutex::new(Vec::new()),
        current_frame,
    });

    // transmitter: ships readback frames to destination nodes, opening
    // peer connections on demand
    tokio::spawn(run_transmitter(
        local.clone(),
        session.clone(),
        services.clone(),
        transmit_rx,
    ));

    // frame inbox: deposits inbound images into the pool without
    // touching the node queue
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let inbox_stub = SharedObject::new(EntityStub);
    session.attach_object(&inbox_stub, inbox_oid, Some(inbox_tx));
    tokio::spawn(run_inbox(services.clone(), inbox_rx));

    let (tx, rx) = mpsc::unbounded_channel();
    let node_stub = SharedObject::new(EntityStub);
    session.attach_object(&node_stub, node_oid, Some(tx));

    let runtime = NodeRuntime {
        id: node_oid,
        name: String::new(),
        thread_model: ThreadModel::default(),
        session,
        server,
        services: services.clone(),
        factory: factory.clone(),
        handler: factory.create_node(),
        pipes: HashMap::new(),
        active_pipes: Vec::new(),
    };
    tokio::spawn(runtime.run(rx));

    services
}

async fn run_transmitter(
    local: Arc<LocalNode>,
    session: Arc<Session>,
    services: Arc<NodeServices>,
    mut rx: mpsc::Receiver<TransmitTask>,
) {
    while let Some(task) = rx.recv().await {
        // open the peer connection on demand; all frame transport
        // between render nodes is peer-to-peer
        if task.dest_node != local.node_id() {
            let connected = local
                .peer(task.dest_node)
                .map(|p| p.is_connected())
                .unwrap_or(false);
            if !connected {
                if let Err(err) = local.connect_node(services.server, task.dest_node).await {
                    tracing::error!("Cannot reach {} for frame transport: {err}", task.dest_node);
                    services.record_error(format!("frame transport: {err}"));
                    continue;
                }
            }
        }
        let command = NodeCommand::FrameImage {
            channel: task.dest_channel,
            frame: task.frame,
            pvp: task.image.pvp,
            pixels: task.image.pixels,
        };
        if let Err(err) = command.send(&session, task.dest_node, task.dest_inbox) {
            tracing::error!("Frame transport to {} failed: {err}", task.dest_node);
            services.record_error(format!("frame transport: {err}"));
        }
    }
}

async fn run_inbox(services: Arc<NodeServices>, mut rx: mpsc::UnboundedReceiver<EntityCommand>) {
    while let Some(command) = rx.recv().await {
        match NodeCommand::decode(command.command, command.body) {
            Ok(NodeCommand::FrameImage {
                channel,
                frame,
                pvp,
                pixels,
            }) => {
                services
                    .images
                    .insert(channel, frame, crate::image::ImageFrame { pvp, pixels });
            }
            Ok(other) => {
                tracing::warn!("Frame inbox received {:?}, dropping", other.command());
            }
            Err(err) => tracing::warn!("Frame inbox decode error: {err}"),
        }
    }
}

struct NodeRuntime {
    id: ObjectId,
    name: String,
    thread_model: ThreadModel,
    session: Arc<Session>,
    server: NodeId,
    services: Arc<NodeServices>,
    factory: Arc<dyn NodeFactory>,
    handler: Box<dyn NodeHandler>,
    pipes: HashMap<ObjectId, PipeHandle>,
    active_pipes: Vec<ObjectId>,
}

impl NodeRuntime {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EntityCommand>) {
        tracing::debug!("Node entity {} task up", self.id);
        while let Some(command) = rx.recv().await {
            match family(command.command) {
                Ok(CommandFamily::Node) => {
                    match NodeCommand::decode(command.command, command.body) {
                        Ok(decoded) => {
                            if let Err(err) = self.handle(decoded).await {
                                tracing::error!("Node entity {} error: {err}", self.id);
                                self.services.record_error(err.to_string());
                            }
                        }
                        Err(err) => tracing::warn!("Node command decode error: {err}"),
                    }
                }
                _ => tracing::warn!(
                    "Node entity {} received foreign command {:#x}",
                    self.id,
                    command.command
                ),
            }
        }
        tracing::debug!("Node entity {} task down", self.id);
    }

    async fn handle(&mut self, command: NodeCommand) -> ClientResult<()> {
        match command {
            NodeCommand::CreatePipe { pipe } => {
                let handle = spawn_pipe(
                    pipe,
                    self.session.clone(),
                    self.server,
                    self.services.clone(),
                    self.factory.clone(),
                    self.factory.create_pipe(),
                );
                self.pipes.insert(pipe, handle);
            }
            NodeCommand::DestroyPipe { pipe } => {
                self.pipes.remove(&pipe);
                self.session.detach_object(pipe);
            }
            NodeCommand::ConfigInit {
                request,
                init_id,
                name,
                thread_model,
            } => {
                self.name = name;
                self.thread_model = thread_model;
                tracing::info!(
                    "Node '{}' init, thread model {:?}",
                    self.name,
                    self.thread_model
                );
                let (result, reason) = match self.handler.config_init(init_id).await {
                    Ok(()) => (true, String::new()),
                    Err(err) => (false, err.to_string()),
                };
                NodeCommand::ConfigInitReply {
                    request,
                    result,
                    reason,
                }
                .send(&self.session, self.server, self.id)?;
            }
            NodeCommand::ConfigExit { request } => {
                self.handler.config_exit().await;
                self.pipes.clear();
                NodeCommand::ConfigExitReply {
                    request,
                    result: true,
                }
                .send(&self.session, self.server, self.id)?;
            }
            NodeCommand::FrameStart {
                frame,
                frame_data,
                version: _,
                active_pipes,
            } => {
                // make sure the replica exists before pipes race to it
                self.services
                    .frame_data(&self.session, frame_data)
                    .await?;
                self.active_pipes = active_pipes;
                self.handler.frame_start(frame).await;
                self.services.current_frame.send_replace(frame);
            }
            NodeCommand::FrameFinish { request, frame } => {
                let result = self.sync_frame(frame).await;
                self.handler.frame_finish(frame).await;
                let errors = self.services.drain_errors();
                let (result, reason) = match (result, errors.is_empty()) {
                    (Ok(()), true) => (true, String::new()),
                    (Ok(()), false) => (false, errors.join("; ")),
                    (Err(err), _) => {
                        let mut all = errors;
                        all.push(err.to_string());
                        (false, all.join("; "))
                    }
                };
                if !result {
                    // one frame is skipped after a failure; stale
                    // readback images must not leak into the next one
                    self.services.images.discard_through(frame);
                }
                NodeCommand::FrameFinishReply {
                    request,
                    frame,
                    result,
                    reason,
                }
                .send(&self.session, self.server, self.id)?;
            }
            NodeCommand::FrameImage { .. } => {
                tracing::warn!("Frame image on the node queue, expected on the inbox");
            }
            NodeCommand::ConfigInitReply { .. }
            | NodeCommand::ConfigExitReply { .. }
            | NodeCommand::FrameFinishReply { .. } => {
                tracing::warn!("Node entity {} received a reply command, dropping", self.id);
            }
        }
        Ok(())
    }

    /// Local end-of-frame synchronisation per the thread model
    async fn sync_frame(&mut self, frame: u32) -> ClientResult<()> {
        let deadline = tokio::time::Instant::now() + FRAME_FINISH_TIMEOUT;
        let active = self.active_pipes.clone();
        match self.thread_model {
            ThreadModel::Async => {}
            ThreadModel::DrawSync => {
                for id in &active {
                    if let Some(pipe) = self.pipes.get_mut(id) {
                        wait_watch(&mut pipe.drawn, frame, deadline).await?;
                    }
                }
            }
            ThreadModel::LocalSync => {
                for id in &active {
                    if let Some(pipe) = self.pipes.get_mut(id) {
                        wait_watch(&mut pipe.finished, frame, deadline).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn wait_watch(
    rx: &mut watch::Receiver<u32>,
    frame: u32,
    deadline: tokio::time::Instant,
) -> ClientResult<()> {
    match tokio::time::timeout_at(deadline, rx.wait_for(|f| *f >= frame)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(NetError::Closed.into()),
        Err(_) => Err(NetError::Timeout.into()),
    }
}
