// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Pipes: one GPU or display connection, one task.
//!
//! The pipe task serialises every window and channel callback of its
//! pipe, so a GL context is only ever touched from one task. Commands
//! arrive on the pipe's queue in connection order: frame start, window
//! start, channel tasks, swap handling, frame finish. Before the first
//! channel task of a frame runs, the task blocks until the frame-data
//! replica has reached the frame's version.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use frameweave_net::object::EntityCommand;
use frameweave_net::session::Session;
use frameweave_net::{NodeId, ObjectId};
use tokio::sync::{mpsc, watch};

use crate::client::NodeFactory;
use crate::commands::{family, ChannelCommand, CommandFamily, PipeCommand, WindowCommand};
use crate::image::TransmitTask;
use crate::node::NodeServices;
use crate::types::PixelViewport;
use crate::window::Window;
use crate::ClientResult;

/// Waiting for the frame data of a frame is bounded by the frame
/// deadline
const FRAME_DATA_TIMEOUT: Duration = Duration::from_secs(10);
/// A swap barrier not releasing within this deadline fails the frame
const BARRIER_TIMEOUT: Duration = Duration::from_secs(10);
/// Waiting for input frames during assembly
const ASSEMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Application callbacks of a pipe, run on the pipe's task
pub trait PipeHandler: Send {
    /// Acquire the display connection / GPU
    fn config_init(&mut self, _device: u32) -> ClientResult<()> {
        Ok(())
    }

    /// Release the display connection
    fn config_exit(&mut self) {}

    /// Frame begin on this pipe, after the frame data became available
    fn frame_start(&mut self, _frame: u32) {}
}

/// The node-side handle of a running pipe task
pub(crate) struct PipeHandle {
    pub(crate) drawn: watch::Receiver<u32>,
    pub(crate) finished: watch::Receiver<u32>,
}

pub(crate) fn spawn_pipe(
    id: ObjectId,
    session: Arc<Session>,
    server: NodeId,
    services: Arc<NodeServices>,
    factory: Arc<dyn NodeFactory>,
    handler: Box<dyn PipeHandler>,
) -> PipeHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (drawn_tx, drawn) = watch::channel(0);
    let (finished_tx, finished) = watch::channel(0);

    let runtime = PipeRuntime {
        id,
        session: session.clone(),
        server,
        services,
        factory,
        handler,
        tx: tx.clone(),
        windows: HashMap::new(),
        channel_owner: HashMap::new(),
        drawn_tx,
        finished_tx,
        frame_data: None,
    };
    // route the pipe's own commands onto its queue
    let stub = frameweave_net::object::SharedObject::new(crate::commands::EntityStub);
    session.attach_object(&stub, id, Some(tx));
    tokio::spawn(runtime.run(rx));

    PipeHandle { drawn, finished }
}

struct PipeRuntime {
    id: ObjectId,
    session: Arc<Session>,
    server: NodeId,
    services: Arc<NodeServices>,
    factory: Arc<dyn NodeFactory>,
    handler: Box<dyn PipeHandler>,
    tx: mpsc::UnboundedSender<EntityCommand>,
    windows: HashMap<ObjectId, Window>,
    channel_owner: HashMap<ObjectId, ObjectId>,
    drawn_tx: watch::Sender<u32>,
    finished_tx: watch::Sender<u32>,
    frame_data: Option<frameweave_net::object::SharedObject<crate::frame_data::FrameData>>,
}

impl PipeRuntime {
    /// Attach a window or channel entity so its commands land on this
    /// pipe's queue
    fn attach_entity(&self, id: ObjectId) {
        let stub = frameweave_net::object::SharedObject::new(crate::commands::EntityStub);
        self.session.attach_object(&stub, id, Some(self.tx.clone()));
    }

    fn current_frame_data(
        &self,
    ) -> ClientResult<frameweave_net::object::SharedObject<crate::frame_data::FrameData>> {
        self.frame_data
            .clone()
            .ok_or_else(|| crate::ClientError::Callback("no frame started on this pipe".into()))
    }
}

impl PipeRuntime {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EntityCommand>) {
        tracing::debug!("Pipe {} task up", self.id);
        while let Some(command) = rx.recv().await {
            if let Err(err) = self.handle(command).await {
                tracing::error!("Pipe {} task error: {err}", self.id);
                self.services.record_error(format!("pipe {}: {err}", self.id));
            }
        }
        for window in self.windows.values_mut() {
            window.config_exit();
        }
        tracing::debug!("Pipe {} task down", self.id);
    }

    async fn handle(&mut self, command: EntityCommand) -> ClientResult<()> {
        match family(command.command)? {
            CommandFamily::Pipe => {
                let decoded = PipeCommand::decode(command.command, command.body)?;
                self.handle_pipe(decoded).await
            }
            CommandFamily::Window => {
                let decoded = WindowCommand::decode(command.command, command.body)?;
                self.handle_window(command.object, decoded).await
            }
            CommandFamily::Channel => {
                let decoded = ChannelCommand::decode(command.command, command.body)?;
                self.handle_channel(command.object, decoded).await
            }
            other => {
                tracing::warn!("Pipe {} received {other:?} command, dropping", self.id);
                Ok(())
            }
        }
    }

    async fn handle_pipe(&mut self, command: PipeCommand) -> ClientResult<()> {
        match command {
            PipeCommand::CreateWindow { window } => {
                let (system, handler) = self.factory.create_window();
                self.windows
                    .insert(window, Window::new(window, system, handler));
                self.attach_entity(window);
            }
            PipeCommand::DestroyWindow { window } => {
                if let Some(mut window_entity) = self.windows.remove(&window) {
                    window_entity.config_exit();
                    self.channel_owner.retain(|_, owner| *owner != window);
                }
                self.session.detach_object(window);
            }
            PipeCommand::ConfigInit {
                request,
                device,
                name,
            } => {
                tracing::info!("Pipe {} ('{name}') init on device {device}", self.id);
                let (result, reason) = match self.handler.config_init(device) {
                    Ok(()) => (true, String::new()),
                    Err(err) => (false, err.to_string()),
                };
                PipeCommand::ConfigInitReply {
                    request,
                    result,
                    reason,
                }
                .send(&self.session, self.server, self.id)?;
            }
            PipeCommand::ConfigExit { request } => {
                self.handler.config_exit();
                PipeCommand::ConfigExitReply {
                    request,
                    result: true,
                }
                .send(&self.session, self.server, self.id)?;
            }
            PipeCommand::FrameStart {
                frame,
                frame_data,
                version,
            } => {
                let data = self.services.frame_data(&self.session, frame_data).await?;
                data.wait_for_version_timeout(version, FRAME_DATA_TIMEOUT)
                    .await?;
                self.frame_data = Some(data);
                self.handler.frame_start(frame);
            }
            PipeCommand::FrameDrawFinish { frame } => {
                self.drawn_tx.send_replace(frame);
            }
            PipeCommand::FrameTasksFinish { frame } => {
                self.finished_tx.send_replace(frame);
            }
            PipeCommand::ConfigInitReply { .. }
            | PipeCommand::ConfigExitReply { .. } => {
                tracing::warn!("Pipe {} received a reply command, dropping", self.id);
            }
        }
        Ok(())
    }

    async fn handle_window(
        &mut self,
        window: ObjectId,
        command: WindowCommand,
    ) -> ClientResult<()> {
        match command {
            WindowCommand::CreateChannel { channel } => {
                let handler = self.factory.create_channel();
                self.window_mut(window)?.add_channel(channel, handler);
                self.channel_owner.insert(channel, window);
                self.attach_entity(channel);
            }
            WindowCommand::DestroyChannel { channel } => {
                if let Ok(entity) = self.window_mut(window) {
                    entity.remove_channel(channel);
                }
                self.channel_owner.remove(&channel);
                self.session.detach_object(channel);
            }
            WindowCommand::ConfigInit { request, pvp, name } => {
                let reply = match self.window_mut(window)?.config_init(name, pvp) {
                    Ok(realised) => WindowCommand::ConfigInitReply {
                        request,
                        result: true,
                        pvp: realised,
                        reason: String::new(),
                    },
                    Err(err) => WindowCommand::ConfigInitReply {
                        request,
                        result: false,
                        pvp: PixelViewport::default(),
                        reason: err.to_string(),
                    },
                };
                reply.send(&self.session, self.server, window)?;
            }
            WindowCommand::ConfigExit { request } => {
                if let Ok(entity) = self.window_mut(window) {
                    entity.config_exit();
                }
                WindowCommand::ConfigExitReply {
                    request,
                    result: true,
                }
                .send(&self.session, self.server, window)?;
            }
            WindowCommand::StartFrame {
                frame,
                make_current,
            } => {
                self.window_mut(window)?.start_frame(frame, make_current)?;
            }
            WindowCommand::EndFrame { frame } => {
                self.window_mut(window)?.end_frame(frame);
            }
            WindowCommand::Finish => {
                self.window_mut(window)?.finish();
            }
            WindowCommand::Barrier { barrier, version } => {
                // the swap lock: block this pipe until every window of
                // the group entered the frame's barrier cycle
                let barrier = self
                    .services
                    .barrier(&self.session, barrier, version)
                    .await?;
                barrier.enter_at(version, BARRIER_TIMEOUT).await?;
            }
            WindowCommand::Swap => {
                self.window_mut(window)?.swap()?;
            }
            WindowCommand::ConfigInitReply { .. } | WindowCommand::ConfigExitReply { .. } => {
                tracing::warn!("Pipe {} received a reply command, dropping", self.id);
            }
        }
        Ok(())
    }

    async fn handle_channel(
        &mut self,
        channel: ObjectId,
        command: ChannelCommand,
    ) -> ClientResult<()> {
        let window = *self
            .channel_owner
            .get(&channel)
            .ok_or(crate::ClientError::NoSuchEntity(channel))?;
        match command {
            ChannelCommand::ConfigInit { request, name } => {
                let (result, reason) = match self
                    .window_mut(window)?
                    .channel_config_init(channel, name)
                {
                    Ok(()) => (true, String::new()),
                    Err(err) => (false, err.to_string()),
                };
                ChannelCommand::ConfigInitReply {
                    request,
                    result,
                    reason,
                }
                .send(&self.session, self.server, channel)?;
            }
            ChannelCommand::ConfigExit { request } => {
                let result = self.window_mut(window)?.channel_config_exit(channel).is_ok();
                ChannelCommand::ConfigExitReply { request, result }.send(
                    &self.session,
                    self.server,
                    channel,
                )?;
            }
            ChannelCommand::FrameClear { context } => {
                // draw against a snapshot so a delta for a pipelined
                // later frame never blocks behind the draw
                let frame_data = self.current_frame_data()?.with(|fd| fd.clone());
                self.window_mut(window)?
                    .channel_clear(channel, &context, &frame_data)?;
            }
            ChannelCommand::FrameDraw { context } => {
                let frame_data = self.current_frame_data()?.with(|fd| fd.clone());
                self.window_mut(window)?
                    .channel_draw(channel, &context, &frame_data)?;
            }
            ChannelCommand::FrameReadback {
                context,
                dest_node,
                dest_inbox,
                dest_channel,
            } => {
                let frame_data = self.current_frame_data()?.with(|fd| fd.clone());
                let image = self
                    .window_mut(window)?
                    .channel_readback(channel, &context, &frame_data)?;
                let task = TransmitTask {
                    dest_node,
                    dest_inbox,
                    dest_channel,
                    frame: context.frame_number,
                    image,
                };
                // bounded queue: back-pressure throttles readback ahead
                // of transmission
                self.services.transmit(task).await?;
            }
            ChannelCommand::FrameAssemble { context, expected } => {
                let frames = self
                    .services
                    .images()
                    .wait_images(
                        channel,
                        context.frame_number,
                        expected as usize,
                        ASSEMBLE_TIMEOUT,
                    )
                    .await?;
                let frame_data = self.current_frame_data()?.with(|fd| fd.clone());
                self.window_mut(window)?
                    .channel_assemble(channel, &context, &frame_data, &frames)?;
            }
            ChannelCommand::ConfigInitReply { .. } | ChannelCommand::ConfigExitReply { .. } => {
                tracing::warn!("Pipe {} received a reply command, dropping", self.id);
            }
        }
        Ok(())
    }

    fn window_mut(&mut self, id: ObjectId) -> ClientResult<&mut Window> {
        self.windows
            .get_mut(&id)
            .ok_or(crate::ClientError::NoSuchEntity(id))
    }
}
