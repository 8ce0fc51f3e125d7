// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The frame-pipeline controller.
//!
//! A [Config] is the running counterpart of a [ConfigSpec]: it connects
//! (and launches) the render nodes, instantiates and initialises the
//! hierarchy across the cluster, then drives one update per frame.
//!
//! Frames are latency-pipelined: [Config::start_frame] transmits the
//! whole task stream of frame `f` without blocking, and
//! [Config::finish_frame] only waits once more than `latency` frames
//! are outstanding, so up to `latency + 1` frames are in flight. A
//! failed frame is skipped and the next one proceeds; two consecutive
//! failures stop the affected node and re-plan its swap groups.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use frameweave::commands::{
    family, ChannelCommand, ClientCommand, CommandFamily, EntityStub, NodeCommand, PipeCommand,
    WindowCommand,
};
use frameweave::frame_data::FrameData;
use frameweave::types::RenderContext;
use frameweave_net::node::LocalNode;
use frameweave_net::object::{EntityCommand, SharedObject};
use frameweave_net::requests::{RequestCache, RequestValue};
use frameweave_net::session::Session;
use frameweave_net::{NodeId, ObjectId, RequestId, Version};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::compound::{Compound, TaskOp, TaskPlan};
use crate::node::ServerNode;
use crate::spec::ConfigSpec;
use crate::swap::{SwapCycle, SwapPlanner};
use crate::window::ServerWindow;
use crate::{EntityState, ServerError, ServerResult};

/// Default deadline for init/exit replies and frame completion
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Send context of one render node, shared by the entity controllers
pub(crate) struct SendCtx<'a> {
    /// The config session
    pub session: &'a Arc<Session>,
    /// The render process to address
    pub node: NodeId,
    /// The server's request cache
    pub requests: &'a RequestCache,
    /// Reply deadline
    pub timeout: Duration,
}

struct FrameSync {
    frame: u32,
    pending: Vec<(Arc<ServerNode>, RequestId)>,
}

/// A running cluster configuration
pub struct Config {
    local: Arc<LocalNode>,
    session: Arc<Session>,
    nodes: Vec<Arc<ServerNode>>,
    compounds: Vec<Compound>,
    latency: u32,
    timeout: Duration,
    frame_data: SharedObject<FrameData>,
    frame_data_oid: ObjectId,
    planner: SwapPlanner,
    state: EntityState,
    current_frame: u32,
    finished_frame: u32,
    in_flight: VecDeque<FrameSync>,
    tasks: Vec<JoinHandle<()>>,
}

impl Config {
    /// Build the server-side hierarchy of a spec. Entity objects are
    /// registered in a session named [frameweave::CONFIG_SESSION] on
    /// `local`.
    pub fn new(local: Arc<LocalNode>, spec: ConfigSpec) -> ServerResult<Self> {
        let session = local.new_session(frameweave::CONFIG_SESSION);

        let frame_data = SharedObject::new(FrameData::default());
        let frame_data_oid = session.register_object(&frame_data)?;

        let nodes: Vec<Arc<ServerNode>> = spec
            .nodes
            .iter()
            .map(|n| Arc::new(ServerNode::new(n)))
            .collect();

        let mut config = Self {
            local,
            session,
            nodes,
            compounds: spec.compounds,
            latency: spec.latency,
            timeout: DEFAULT_TIMEOUT,
            frame_data,
            frame_data_oid,
            planner: SwapPlanner::new(),
            state: EntityState::Stopped,
            current_frame: 0,
            finished_frame: 0,
            in_flight: VecDeque::new(),
            tasks: Vec::new(),
        };
        config.register_entities()?;
        Ok(config)
    }

    /// The shared per-frame parameters, mastered here and replicated to
    /// every render node
    pub fn frame_data(&self) -> &SharedObject<FrameData> {
        &self.frame_data
    }

    /// The config session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The configured latency window
    pub fn latency(&self) -> u32 {
        self.latency
    }

    /// The highest frame number issued so far
    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    /// The highest frame number completed so far
    pub fn finished_frame(&self) -> u32 {
        self.finished_frame
    }

    /// The node controllers of this config
    pub fn nodes(&self) -> &[Arc<ServerNode>] {
        &self.nodes
    }

    /// The swap planner of this config
    pub fn planner(&self) -> &SwapPlanner {
        &self.planner
    }

    /// Override the init/frame deadline, mostly for tests
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn ctx<'a>(&'a self, node: &Arc<ServerNode>) -> SendCtx<'a> {
        SendCtx {
            session: &self.session,
            node: node.node_id(),
            requests: self.local.requests(),
            timeout: self.timeout,
        }
    }

    // ========================= Registration ========================= //

    /// Register every entity as a session object and wire its replies
    /// onto the reply task
    fn register_entities(&mut self) -> ServerResult<()> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut windows: HashMap<ObjectId, Arc<ServerWindow>> = HashMap::new();

        for node in &self.nodes {
            let oid = self.register_entity(&reply_tx)?;
            let inbox = self.register_entity(&reply_tx)?;
            node.set_ids(oid, inbox);
            for pipe in node.pipes() {
                pipe.set_id(self.register_entity(&reply_tx)?);
                for window in pipe.windows() {
                    window.set_id(self.register_entity(&reply_tx)?);
                    windows.insert(window.id(), window.clone());
                    for channel in window.channels() {
                        channel.set_id(self.register_entity(&reply_tx)?);
                    }
                }
            }
        }

        let local = self.local.clone();
        self.tasks
            .push(tokio::spawn(run_replies(local, windows, reply_rx)));
        Ok(())
    }

    fn register_entity(
        &self,
        sink: &mpsc::UnboundedSender<EntityCommand>,
    ) -> ServerResult<ObjectId> {
        let stub = SharedObject::new(EntityStub);
        let id = self.session.register_object(&stub)?;
        self.session.set_command_sink(id, sink.clone());
        Ok(id)
    }

    // ========================= Activation ========================= //

    /// Propagate compound channel usage up the tree and validate the
    /// result
    fn activate(&self) -> ServerResult<()> {
        let used: BTreeSet<String> = self
            .compounds
            .iter()
            .flat_map(|c| c.used_channels())
            .collect();

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            let mut node_used = 0;
            for pipe in node.pipes() {
                let mut pipe_used = 0;
                for window in pipe.windows() {
                    let mut window_used = 0;
                    for channel in window.channels() {
                        let count = u32::from(used.contains(channel.name()));
                        channel.set_used(count);
                        window_used += count;
                        seen.insert(channel.name().to_string());
                    }
                    window.set_used(window_used);
                    pipe_used += window_used;
                }
                pipe.set_used(pipe_used);
                if pipe_used > 0 {
                    for window in pipe.windows() {
                        if window.channels().is_empty() {
                            return Err(ServerError::InitFailed(format!(
                                "window '{}' has no channels",
                                window.name()
                            )));
                        }
                    }
                }
                node_used += pipe_used;
            }
            node.set_used(node_used);
        }

        for name in &used {
            if !seen.contains(name) {
                return Err(ServerError::InvalidConfig(format!(
                    "compound references unknown channel '{name}'"
                )));
            }
        }
        if used.is_empty() {
            return Err(ServerError::InvalidConfig(
                "no compound references any channel".into(),
            ));
        }
        Ok(())
    }

    // ========================= Init / exit ========================= //

    /// Connect, launch and initialise the cluster. On success the
    /// config is running and frames can be issued.
    pub async fn init(&mut self, init_id: u32) -> ServerResult<()> {
        self.activate()?;
        self.state = EntityState::Initialising;

        // bring all nodes up in parallel
        let pendings: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.is_used())
            .map(|n| (n.clone(), n.init_connect(&self.local)))
            .collect();
        let connects = futures::future::join_all(pendings.into_iter().map(|(node, pending)| {
            let local = self.local.clone();
            async move { node.sync_connect(&local, pending).await }
        }))
        .await;
        for result in connects {
            result?;
        }

        self.watch_disconnects();

        // instantiate and initialise top-down, sync bottom-up
        for node in self.nodes.iter().filter(|n| n.is_used()) {
            ClientCommand::CreateNode {
                node: node.id(),
                inbox: node.inbox_id(),
            }
            .send(&self.session, node.node_id())?;
            node.start_init(&self.ctx(node), init_id)?;
        }
        let this: &Config = self;
        let results = futures::future::join_all(
            this.nodes
                .iter()
                .filter(|n| n.is_used())
                .map(|node| async move { (node, node.sync_init(&this.ctx(node)).await) }),
        )
        .await;
        let failures: Vec<String> = results
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(node, _)| format!("node '{}': {}", node.name(), node.error_message()))
            .collect();
        if !failures.is_empty() {
            self.state = EntityState::Stopping;
            return Err(ServerError::InitFailed(failures.join("; ")));
        }

        self.planner
            .plan(&self.session, &self.compounds, &self.nodes)?;
        self.state = EntityState::Running;
        tracing::info!("Config initialised with {} nodes", self.nodes.len());
        Ok(())
    }

    /// Exit the cluster: drain outstanding frames, run config exits and
    /// shut the render processes down
    pub async fn exit(&mut self) -> ServerResult<()> {
        let _ = self.finish_all_frames().await;
        self.state = EntityState::Stopping;

        let running: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.is_used() && n.peer().map(|p| p.is_connected()).unwrap_or(false))
            .cloned()
            .collect();
        for node in &running {
            node.start_exit(&self.ctx(node))?;
        }
        let mut success = true;
        for node in &running {
            success &= node.sync_exit(&self.ctx(node)).await;
        }
        for node in &running {
            ClientCommand::DestroyNode { node: node.id() }
                .send(&self.session, node.node_id())
                .ok();
            ClientCommand::Exit.send(&self.session, node.node_id()).ok();
        }

        self.state = EntityState::Stopped;
        if success {
            Ok(())
        } else {
            Err(ServerError::InitFailed("config exit failed".into()))
        }
    }

    /// Fail frame-finish requests of nodes whose connection drops, so
    /// the controller does not sit out the whole frame deadline
    fn watch_disconnects(&mut self) {
        let mut rx = self.local.subscribe_disconnects();
        let nodes = self.nodes.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Ok(lost) = rx.recv().await {
                for node in &nodes {
                    if node.node_id() == lost {
                        tracing::error!("CONNECTION_LOST: render node '{}'", node.name());
                        node.set_error("CONNECTION_LOST");
                        node.set_state(EntityState::Stopping);
                    }
                }
            }
        }));
    }

    // ========================= Frames ========================= //

    /// Issue frame `current + 1`: commit the frame data, open the swap
    /// cycle and transmit the task stream of every active node. Returns
    /// the new frame number without blocking.
    pub fn start_frame(&mut self) -> ServerResult<u32> {
        if self.state != EntityState::Running {
            return Err(ServerError::InvalidConfig(
                "config is not running".into(),
            ));
        }
        let frame = self.current_frame + 1;
        let version = self.frame_data.commit()?;
        debug_assert_eq!(version, Version(frame), "frame data version tracks frames");
        let cycle = self.planner.commit_cycle()?;
        let plans: Vec<TaskPlan> = self
            .compounds
            .iter()
            .flat_map(|c| c.plan_tasks())
            .collect();

        let mut sync = FrameSync {
            frame,
            pending: Vec::new(),
        };
        for node in &self.nodes {
            if !node.is_active() {
                continue;
            }
            let request = self.local.requests().register();
            if let Err(err) = self.update_node(node, frame, version, &plans, &cycle, request) {
                tracing::error!("Frame {frame} update of '{}' failed: {err}", node.name());
                self.local
                    .requests()
                    .serve_error(request, format!("frame update failed: {err}"));
            }
            sync.pending.push((node.clone(), request));
        }
        self.in_flight.push_back(sync);
        self.current_frame = frame;
        Ok(frame)
    }

    /// The whole per-frame task stream of one node, in pipe-queue order
    fn update_node(
        &self,
        node: &Arc<ServerNode>,
        frame: u32,
        version: Version,
        plans: &[TaskPlan],
        cycle: &SwapCycle,
        request: RequestId,
    ) -> ServerResult<()> {
        let session = &self.session;
        let target = node.node_id();

        let active_pipes: Vec<ObjectId> = node
            .pipes()
            .iter()
            .filter(|p| p.is_used())
            .map(|p| p.id())
            .collect();
        NodeCommand::FrameStart {
            frame,
            frame_data: self.frame_data_oid,
            version,
            active_pipes,
        }
        .send(session, target, node.id())?;

        for pipe in node.pipes().iter().filter(|p| p.is_used()) {
            PipeCommand::FrameStart {
                frame,
                frame_data: self.frame_data_oid,
                version,
            }
            .send(session, target, pipe.id())?;
            let make_current = pipe.used_windows() > 1;

            // draw phase
            for window in pipe.windows().iter().filter(|w| w.is_used()) {
                WindowCommand::StartFrame {
                    frame,
                    make_current,
                }
                .send(session, target, window.id())?;
                for channel in window.channels().iter().filter(|c| c.is_used()) {
                    for task in plans.iter().filter(|t| t.channel == channel.name()) {
                        let context = self.render_context(frame, version, window, task);
                        match &task.op {
                            TaskOp::Clear => ChannelCommand::FrameClear { context }
                                .send(session, target, channel.id())?,
                            TaskOp::Draw => ChannelCommand::FrameDraw { context }
                                .send(session, target, channel.id())?,
                            TaskOp::Readback { .. } | TaskOp::Assemble { .. } => {}
                        }
                    }
                }
            }
            PipeCommand::FrameDrawFinish { frame }.send(session, target, pipe.id())?;

            // transport, compositing and swap phase
            for window in pipe.windows().iter().filter(|w| w.is_used()) {
                for channel in window.channels().iter().filter(|c| c.is_used()) {
                    for task in plans.iter().filter(|t| t.channel == channel.name()) {
                        let context = self.render_context(frame, version, window, task);
                        match &task.op {
                            TaskOp::Readback { dest } => {
                                let (dest_node, dest_channel) =
                                    self.find_channel(dest).ok_or_else(|| {
                                        ServerError::InvalidConfig(format!(
                                            "readback destination '{dest}' not found"
                                        ))
                                    })?;
                                ChannelCommand::FrameReadback {
                                    context,
                                    dest_node: dest_node.node_id(),
                                    dest_inbox: dest_node.inbox_id(),
                                    dest_channel: dest_channel.id(),
                                }
                                .send(session, target, channel.id())?;
                            }
                            TaskOp::Assemble { expected } => {
                                ChannelCommand::FrameAssemble {
                                    context,
                                    expected: *expected,
                                }
                                .send(session, target, channel.id())?;
                            }
                            TaskOp::Clear | TaskOp::Draw => {}
                        }
                    }
                }

                if let Some((barrier, barrier_version)) = window
                    .swap_group()
                    .and_then(|group| cycle.get(&group).copied())
                {
                    // finish before the barrier so the swap lock covers
                    // completed work
                    WindowCommand::Finish.send(session, target, window.id())?;
                    WindowCommand::Barrier {
                        barrier,
                        version: barrier_version,
                    }
                    .send(session, target, window.id())?;
                }
                WindowCommand::Swap.send(session, target, window.id())?;
                WindowCommand::EndFrame { frame }.send(session, target, window.id())?;
            }
            PipeCommand::FrameTasksFinish { frame }.send(session, target, pipe.id())?;
        }

        NodeCommand::FrameFinish { request, frame }.send(session, target, node.id())?;
        Ok(())
    }

    fn render_context(
        &self,
        frame: u32,
        version: Version,
        window: &Arc<ServerWindow>,
        task: &TaskPlan,
    ) -> RenderContext {
        let mut window_pvp = window.pixel_viewport();
        window_pvp.x = 0;
        window_pvp.y = 0;
        RenderContext {
            frame_number: frame,
            frame_version: version,
            pvp: task.viewport.apply_to(&window_pvp),
            vp: task.viewport,
            range: task.range,
        }
    }

    fn find_channel(&self, name: &str) -> Option<(Arc<ServerNode>, Arc<crate::channel::ServerChannel>)> {
        for node in &self.nodes {
            for pipe in node.pipes() {
                for window in pipe.windows() {
                    if let Some(channel) = window.channel_by_name(name) {
                        return Some((node.clone(), channel));
                    }
                }
            }
        }
        None
    }

    /// Block until at most `latency` frames remain outstanding; returns
    /// the highest finished frame number. A failed frame surfaces as
    /// [ServerError::FrameFailed] after the bookkeeping (failure
    /// counting, swap re-planning) is done.
    pub async fn finish_frame(&mut self) -> ServerResult<u32> {
        let mut first_error = None;
        while self.in_flight.len() as u32 > self.latency {
            if let Err(err) = self.collect_oldest().await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(self.finished_frame),
        }
    }

    /// Drain every outstanding frame
    pub async fn finish_all_frames(&mut self) -> ServerResult<u32> {
        let mut first_error = None;
        while !self.in_flight.is_empty() {
            if let Err(err) = self.collect_oldest().await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(self.finished_frame),
        }
    }

    async fn collect_oldest(&mut self) -> ServerResult<()> {
        let Some(sync) = self.in_flight.pop_front() else {
            return Ok(());
        };
        let requests = self.local.requests();
        let mut failures = Vec::new();
        for (node, request) in &sync.pending {
            // a lost node cannot reply; fail its request up front
            let connected = node.peer().map(|p| p.is_connected()).unwrap_or(false);
            if !connected {
                requests.serve_error(*request, node.error_message());
            }
            match requests.wait_timeout(*request, self.timeout).await {
                Ok(value) if value.is_success() => node.reset_frame_failures(),
                Ok(_) => failures.push((node.clone(), "frame failed".to_string())),
                Err(err) => failures.push((node.clone(), err.to_string())),
            }
        }
        self.finished_frame = sync.frame;

        if failures.is_empty() {
            return Ok(());
        }
        let mut reasons = Vec::new();
        for (node, reason) in failures {
            tracing::warn!("Frame {} failed on '{}': {reason}", sync.frame, node.name());
            node.set_error(reason.clone());
            if node.count_frame_failure() {
                tracing::error!(
                    "Two consecutive frame failures, stopping node '{}'",
                    node.name()
                );
            }
            reasons.push(format!("node '{}': {reason}", node.name()));
        }
        // nodes may have dropped out; the next cycle runs with the
        // surviving participants
        self.planner
            .plan(&self.session, &self.compounds, &self.nodes)?;
        Err(ServerError::FrameFailed {
            frame: sync.frame,
            reason: reasons.join("; "),
        })
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ========================= Reply routing ========================= //

/// Serve entity replies arriving from the render nodes: resolve the
/// pending request, record diagnostics and adopt realised window
/// geometry
async fn run_replies(
    local: Arc<LocalNode>,
    windows: HashMap<ObjectId, Arc<ServerWindow>>,
    mut rx: mpsc::UnboundedReceiver<EntityCommand>,
) {
    while let Some(command) = rx.recv().await {
        let served = match family(command.command) {
            Ok(CommandFamily::Node) => {
                match NodeCommand::decode(command.command, command.body) {
                    Ok(NodeCommand::ConfigInitReply {
                        request,
                        result,
                        reason,
                    }) => Some((request, result, reason)),
                    Ok(NodeCommand::ConfigExitReply { request, result }) => {
                        Some((request, result, String::new()))
                    }
                    Ok(NodeCommand::FrameFinishReply {
                        request,
                        result,
                        reason,
                        ..
                    }) => Some((request, result, reason)),
                    Ok(other) => {
                        tracing::warn!("Unexpected node command {:#x} at the server", other.command());
                        None
                    }
                    Err(err) => {
                        tracing::warn!("Reply decode error: {err}");
                        None
                    }
                }
            }
            Ok(CommandFamily::Pipe) => {
                match PipeCommand::decode(command.command, command.body) {
                    Ok(PipeCommand::ConfigInitReply {
                        request,
                        result,
                        reason,
                    }) => Some((request, result, reason)),
                    Ok(PipeCommand::ConfigExitReply { request, result }) => {
                        Some((request, result, String::new()))
                    }
                    Ok(other) => {
                        tracing::warn!("Unexpected pipe command {:#x} at the server", other.command());
                        None
                    }
                    Err(err) => {
                        tracing::warn!("Reply decode error: {err}");
                        None
                    }
                }
            }
            Ok(CommandFamily::Window) => {
                match WindowCommand::decode(command.command, command.body) {
                    Ok(WindowCommand::ConfigInitReply {
                        request,
                        result,
                        pvp,
                        reason,
                    }) => {
                        if let Some(window) = windows.get(&command.object) {
                            window.set_pixel_viewport(pvp);
                        }
                        Some((request, result, reason))
                    }
                    Ok(WindowCommand::ConfigExitReply { request, result }) => {
                        Some((request, result, String::new()))
                    }
                    Ok(other) => {
                        tracing::warn!("Unexpected window command {:#x} at the server", other.command());
                        None
                    }
                    Err(err) => {
                        tracing::warn!("Reply decode error: {err}");
                        None
                    }
                }
            }
            Ok(CommandFamily::Channel) => {
                match ChannelCommand::decode(command.command, command.body) {
                    Ok(ChannelCommand::ConfigInitReply {
                        request,
                        result,
                        reason,
                    }) => Some((request, result, reason)),
                    Ok(ChannelCommand::ConfigExitReply { request, result }) => {
                        Some((request, result, String::new()))
                    }
                    Ok(other) => {
                        tracing::warn!("Unexpected channel command {:#x} at the server", other.command());
                        None
                    }
                    Err(err) => {
                        tracing::warn!("Reply decode error: {err}");
                        None
                    }
                }
            }
            _ => {
                tracing::warn!("Unroutable reply command {:#x}", command.command);
                None
            }
        };

        if let Some((request, result, reason)) = served {
            if result {
                local.requests().serve(request, RequestValue::Bool(true));
            } else if reason.is_empty() {
                local.requests().serve(request, RequestValue::Bool(false));
            } else {
                local.requests().serve_error(request, reason);
            }
        }
    }
}
