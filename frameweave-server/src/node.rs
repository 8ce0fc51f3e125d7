// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Server-side node controllers.
//!
//! A [ServerNode] tracks one render process: its connection (or launch)
//! state, its entity object ids and the init/exit and per-frame
//! synchronisation with the process. Connecting is split-phase so the
//! whole cluster is launched in parallel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use frameweave::commands::NodeCommand;
use frameweave::types::ThreadModel;
use frameweave_net::connection::ConnectionDescription;
use frameweave_net::node::{LocalNode, Peer, PendingConnect};
use frameweave_net::{NodeId, ObjectId, RequestId};

use crate::config::SendCtx;
use crate::pipe::ServerPipe;
use crate::spec::NodeSpec;
use crate::{EntityState, ServerError, ServerResult};

/// The server-side mirror of one render process
pub struct ServerNode {
    name: String,
    descriptions: Vec<ConnectionDescription>,
    thread_model: ThreadModel,
    pipes: Vec<Arc<ServerPipe>>,
    oid: Mutex<ObjectId>,
    inbox_oid: Mutex<ObjectId>,
    peer: Mutex<Option<Arc<Peer>>>,
    state: Mutex<EntityState>,
    used: AtomicU32,
    pending: Mutex<Option<RequestId>>,
    error: Mutex<String>,
    failed_frames: AtomicU32,
}

impl ServerNode {
    pub(crate) fn new(spec: &NodeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            descriptions: spec.descriptions.clone(),
            thread_model: spec.thread_model,
            pipes: spec.pipes.iter().map(|p| Arc::new(ServerPipe::new(p))).collect(),
            oid: Mutex::new(ObjectId::INVALID),
            inbox_oid: Mutex::new(ObjectId::INVALID),
            peer: Mutex::new(None),
            state: Mutex::new(EntityState::Stopped),
            used: AtomicU32::new(0),
            pending: Mutex::new(None),
            error: Mutex::new(String::new()),
            failed_frames: AtomicU32::new(0),
        }
    }

    /// The node's configured name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's local synchronisation model
    pub fn thread_model(&self) -> ThreadModel {
        self.thread_model
    }

    /// The node's entity object id
    pub fn id(&self) -> ObjectId {
        *self.oid.lock().expect("node oid lock poisoned")
    }

    /// The node's frame-inbox object id
    pub fn inbox_id(&self) -> ObjectId {
        *self.inbox_oid.lock().expect("node inbox lock poisoned")
    }

    pub(crate) fn set_ids(&self, oid: ObjectId, inbox: ObjectId) {
        *self.oid.lock().expect("node oid lock poisoned") = oid;
        *self.inbox_oid.lock().expect("node inbox lock poisoned") = inbox;
    }

    /// The node's pipes
    pub fn pipes(&self) -> &[Arc<ServerPipe>] {
        &self.pipes
    }

    /// The connected render process, when up
    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.lock().expect("node peer lock poisoned").clone()
    }

    /// The render process's cluster node id, [NodeId::ZERO] while not
    /// connected
    pub fn node_id(&self) -> NodeId {
        self.peer()
            .map(|p| p.node_id())
            .unwrap_or(NodeId::ZERO)
    }

    /// Pre-attach an already-connected peer, e.g. a render node running
    /// in the server process. Connect and launch are skipped for it.
    pub fn attach_peer(&self, peer: Arc<Peer>) {
        *self.peer.lock().expect("node peer lock poisoned") = Some(peer);
    }

    /// The node's lifecycle state
    pub fn state(&self) -> EntityState {
        *self.state.lock().expect("node state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: EntityState) {
        *self.state.lock().expect("node state lock poisoned") = state;
    }

    /// Is any pipe of this node used?
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn set_used(&self, used: u32) {
        self.used.store(used, Ordering::Relaxed);
    }

    /// Is the node usable for the next frame?
    pub fn is_active(&self) -> bool {
        self.is_used() && self.state() == EntityState::Running
    }

    /// The last failure reported for this node
    pub fn error_message(&self) -> String {
        self.error.lock().expect("node error lock poisoned").clone()
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        *self.error.lock().expect("node error lock poisoned") = message.into();
    }

    /// Count a frame failure; two consecutive failures stop the node
    pub(crate) fn count_frame_failure(&self) -> bool {
        let failures = self.failed_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= 2 {
            self.set_state(EntityState::Stopping);
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_frame_failures(&self) {
        self.failed_frames.store(0, Ordering::Relaxed);
    }

    // ========================= Connect ========================= //

    /// Start connecting (and launching) the render process
    pub(crate) fn init_connect(&self, local: &Arc<LocalNode>) -> Option<PendingConnect> {
        if self.peer().map(|p| p.is_connected()).unwrap_or(false) {
            return None;
        }
        Some(local.init_connect(self.descriptions.clone(), true))
    }

    /// Join the connect started by [ServerNode::init_connect]
    pub(crate) async fn sync_connect(
        &self,
        local: &Arc<LocalNode>,
        pending: Option<PendingConnect>,
    ) -> ServerResult<()> {
        let Some(pending) = pending else {
            return Ok(());
        };
        match local.sync_connect(pending).await {
            Ok(peer) => {
                tracing::info!("Render node '{}' connected as {}", self.name, peer.node_id());
                self.attach_peer(peer);
                Ok(())
            }
            Err(err) => {
                self.set_error(format!("connect failed: {err}"));
                self.set_state(EntityState::Stopping);
                Err(ServerError::InitFailed(format!(
                    "node '{}': {err}",
                    self.name
                )))
            }
        }
    }

    // ========================= Init / exit ========================= //

    pub(crate) fn start_init(&self, ctx: &SendCtx<'_>, init_id: u32) -> ServerResult<()> {
        self.set_state(EntityState::Initialising);
        let request = ctx.requests.register();
        *self.pending.lock().expect("node pending lock poisoned") = Some(request);
        NodeCommand::ConfigInit {
            request,
            init_id,
            name: self.name.clone(),
            thread_model: self.thread_model,
        }
        .send(ctx.session, ctx.node, self.id())?;

        for pipe in &self.pipes {
            if pipe.is_used() {
                NodeCommand::CreatePipe { pipe: pipe.id() }.send(
                    ctx.session,
                    ctx.node,
                    self.id(),
                )?;
                pipe.start_init(ctx)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn sync_init(&self, ctx: &SendCtx<'_>) -> bool {
        let mut success = true;
        for pipe in &self.pipes {
            if pipe.is_used() && !pipe.sync_init(ctx).await {
                self.set_error(format!(
                    "pipe '{}': {}",
                    pipe.name(),
                    pipe.error_message()
                ));
                success = false;
            }
        }
        match self.take_pending() {
            Some(request) => match ctx.requests.wait_timeout(request, ctx.timeout).await {
                Ok(value) if value.is_success() && success => {
                    self.set_state(EntityState::Running);
                    true
                }
                Ok(_) => {
                    self.set_state(EntityState::Stopping);
                    false
                }
                Err(err) => {
                    self.set_error(err.to_string());
                    self.set_state(EntityState::Stopping);
                    false
                }
            },
            None => success,
        }
    }

    pub(crate) fn start_exit(&self, ctx: &SendCtx<'_>) -> ServerResult<()> {
        self.set_state(EntityState::Stopping);
        for pipe in &self.pipes {
            if pipe.state() != EntityState::Stopped {
                pipe.start_exit(ctx)?;
            }
        }
        let request = ctx.requests.register();
        *self.pending.lock().expect("node pending lock poisoned") = Some(request);
        NodeCommand::ConfigExit { request }.send(ctx.session, ctx.node, self.id())?;
        Ok(())
    }

    pub(crate) async fn sync_exit(&self, ctx: &SendCtx<'_>) -> bool {
        let mut success = true;
        for pipe in &self.pipes {
            if pipe.state() == EntityState::Stopping && !pipe.sync_exit(ctx, self.id()).await {
                success = false;
            }
        }
        if let Some(request) = self.take_pending() {
            success &= ctx
                .requests
                .wait_timeout(request, ctx.timeout)
                .await
                .map(|v| v.is_success())
                .unwrap_or(false);
        }
        self.set_state(EntityState::Stopped);
        success
    }

    fn take_pending(&self) -> Option<RequestId> {
        self.pending
            .lock()
            .expect("node pending lock poisoned")
            .take()
    }
}
