// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The command sets of the render hierarchy.
//!
//! Hierarchy entities are session objects; their control traffic rides
//! on custom object commands (and one session-level set for entity
//! creation, handled by the client before node entities exist). Every
//! enum here encodes into an opaque command body carried by the
//! substrate's packet framing.
//!
//! Command values are grouped per entity so a queue serving several
//! entities can route on the value alone: client `0x80..`, node `0x90..`,
//! pipe `0xa0..`, window `0xb0..`, channel `0xc0..`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use frameweave_net::object::Object;
use frameweave_net::packet::{put_string, take_string};
use frameweave_net::session::Session;
use frameweave_net::{NetError, NetResult, NodeId, ObjectId, RequestId, Version};

use crate::types::{PixelViewport, RenderContext, ThreadModel};

/// Placeholder instance data for hierarchy entities; their state flows
/// through commands, not through versioned deltas
pub struct EntityStub;

impl Object for EntityStub {
    fn instance_data(&self) -> Bytes {
        Bytes::new()
    }
    fn apply_instance(&mut self, _data: Bytes) -> NetResult<()> {
        Ok(())
    }
}

/// Which entity a command value addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    /// Session-level client commands
    Client,
    /// Render-node entity commands
    Node,
    /// Pipe entity commands
    Pipe,
    /// Window entity commands
    Window,
    /// Channel entity commands
    Channel,
}

/// Classify a command value
pub fn family(command: u32) -> NetResult<CommandFamily> {
    match command {
        0x80..=0x8f => Ok(CommandFamily::Client),
        0x90..=0x9f => Ok(CommandFamily::Node),
        0xa0..=0xaf => Ok(CommandFamily::Pipe),
        0xb0..=0xbf => Ok(CommandFamily::Window),
        0xc0..=0xcf => Ok(CommandFamily::Channel),
        other => Err(NetError::UnknownCommand {
            datatype: 0,
            command: other,
        }),
    }
}

fn take_u32(buf: &mut Bytes) -> NetResult<u32> {
    if buf.remaining() < 4 {
        return Err(NetError::MalformedPacket("truncated command field".into()));
    }
    Ok(buf.get_u32_le())
}

fn take_u128(buf: &mut Bytes) -> NetResult<u128> {
    if buf.remaining() < 16 {
        return Err(NetError::MalformedPacket("truncated command field".into()));
    }
    Ok(buf.get_u128_le())
}

fn put_object_list(buf: &mut BytesMut, objects: &[ObjectId]) {
    buf.put_u32_le(objects.len() as u32);
    for object in objects {
        buf.put_u32_le(object.0);
    }
}

fn take_object_list(buf: &mut Bytes) -> NetResult<Vec<ObjectId>> {
    let count = take_u32(buf)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(ObjectId(take_u32(buf)?));
    }
    Ok(out)
}

// ========================= Client commands ========================= //

const CMD_CLIENT_CREATE_NODE: u32 = 0x80;
const CMD_CLIENT_DESTROY_NODE: u32 = 0x81;
const CMD_CLIENT_EXIT: u32 = 0x82;

/// Session-level commands handled by the render client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Instantiate the render-node entity for this process
    CreateNode {
        /// Object id of the node entity
        node: ObjectId,
        /// Object id of the node's frame-image inbox
        inbox: ObjectId,
    },
    /// Tear down the render-node entity
    DestroyNode {
        /// Object id of the node entity
        node: ObjectId,
    },
    /// Shut the client process down cleanly
    Exit,
}

impl ClientCommand {
    /// The wire command value
    pub fn command(&self) -> u32 {
        match self {
            Self::CreateNode { .. } => CMD_CLIENT_CREATE_NODE,
            Self::DestroyNode { .. } => CMD_CLIENT_DESTROY_NODE,
            Self::Exit => CMD_CLIENT_EXIT,
        }
    }

    /// Encode the command body
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::CreateNode { node, inbox } => {
                buf.put_u32_le(node.0);
                buf.put_u32_le(inbox.0);
            }
            Self::DestroyNode { node } => buf.put_u32_le(node.0),
            Self::Exit => {}
        }
        buf.freeze()
    }

    /// Decode from a command value and body
    pub fn decode(command: u32, mut body: Bytes) -> NetResult<Self> {
        let buf = &mut body;
        match command {
            CMD_CLIENT_CREATE_NODE => Ok(Self::CreateNode {
                node: ObjectId(take_u32(buf)?),
                inbox: ObjectId(take_u32(buf)?),
            }),
            CMD_CLIENT_DESTROY_NODE => Ok(Self::DestroyNode {
                node: ObjectId(take_u32(buf)?),
            }),
            CMD_CLIENT_EXIT => Ok(Self::Exit),
            other => Err(NetError::UnknownCommand {
                datatype: 0,
                command: other,
            }),
        }
    }

    /// Send as a session-level command
    pub fn send(&self, session: &Arc<Session>, to: NodeId) -> NetResult<()> {
        session.send_command(to, self.command(), self.encode_body())
    }
}

// ========================= Node commands ========================= //

const CMD_NODE_CREATE_PIPE: u32 = 0x90;
const CMD_NODE_DESTROY_PIPE: u32 = 0x91;
const CMD_NODE_CONFIG_INIT: u32 = 0x92;
const CMD_NODE_CONFIG_INIT_REPLY: u32 = 0x93;
const CMD_NODE_CONFIG_EXIT: u32 = 0x94;
const CMD_NODE_CONFIG_EXIT_REPLY: u32 = 0x95;
const CMD_NODE_FRAME_START: u32 = 0x96;
const CMD_NODE_FRAME_FINISH: u32 = 0x97;
const CMD_NODE_FRAME_FINISH_REPLY: u32 = 0x98;
const CMD_NODE_FRAME_IMAGE: u32 = 0x99;

/// Commands addressed to a render-node entity (or its frame inbox)
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    /// Instantiate a pipe entity
    CreatePipe {
        /// Object id of the pipe entity
        pipe: ObjectId,
    },
    /// Tear down a pipe entity
    DestroyPipe {
        /// Object id of the pipe entity
        pipe: ObjectId,
    },
    /// Run the node's `config_init` callback
    ConfigInit {
        /// Pending request on the server
        request: RequestId,
        /// Application-defined initialisation token
        init_id: u32,
        /// The node's configured name
        name: String,
        /// The node's local synchronisation model
        thread_model: ThreadModel,
    },
    /// Reply to [NodeCommand::ConfigInit]
    ConfigInitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
        /// Failure diagnostics, empty on success
        reason: String,
    },
    /// Run the node's `config_exit` callback
    ConfigExit {
        /// Pending request on the server
        request: RequestId,
    },
    /// Reply to [NodeCommand::ConfigExit]
    ConfigExitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
    },
    /// A new frame begins on this node
    FrameStart {
        /// The frame number
        frame: u32,
        /// The frame-data object to render against
        frame_data: ObjectId,
        /// The frame-data version of this frame
        version: Version,
        /// The pipes with tasks in this frame
        active_pipes: Vec<ObjectId>,
    },
    /// End-of-frame synchronisation point
    FrameFinish {
        /// Pending request on the server
        request: RequestId,
        /// The frame number
        frame: u32,
    },
    /// Reply to [NodeCommand::FrameFinish]
    FrameFinishReply {
        /// The request being served
        request: RequestId,
        /// The finished frame
        frame: u32,
        /// Frame success on this node
        result: bool,
        /// Failure diagnostics, empty on success
        reason: String,
    },
    /// A readback image for a channel hosted on this node, sent by a
    /// peer's transmitter to the node's frame inbox
    FrameImage {
        /// The destination channel
        channel: ObjectId,
        /// The frame the image belongs to
        frame: u32,
        /// Source area of the image
        pvp: PixelViewport,
        /// Raw pixel data
        pixels: Bytes,
    },
}

impl NodeCommand {
    /// The wire command value
    pub fn command(&self) -> u32 {
        match self {
            Self::CreatePipe { .. } => CMD_NODE_CREATE_PIPE,
            Self::DestroyPipe { .. } => CMD_NODE_DESTROY_PIPE,
            Self::ConfigInit { .. } => CMD_NODE_CONFIG_INIT,
            Self::ConfigInitReply { .. } => CMD_NODE_CONFIG_INIT_REPLY,
            Self::ConfigExit { .. } => CMD_NODE_CONFIG_EXIT,
            Self::ConfigExitReply { .. } => CMD_NODE_CONFIG_EXIT_REPLY,
            Self::FrameStart { .. } => CMD_NODE_FRAME_START,
            Self::FrameFinish { .. } => CMD_NODE_FRAME_FINISH,
            Self::FrameFinishReply { .. } => CMD_NODE_FRAME_FINISH_REPLY,
            Self::FrameImage { .. } => CMD_NODE_FRAME_IMAGE,
        }
    }

    /// Encode the command body
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::CreatePipe { pipe } | Self::DestroyPipe { pipe } => buf.put_u32_le(pipe.0),
            Self::ConfigInit {
                request,
                init_id,
                name,
                thread_model,
            } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(*init_id);
                thread_model.encode(&mut buf);
                put_string(&mut buf, name);
            }
            Self::ConfigInitReply {
                request,
                result,
                reason,
            } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
                put_string(&mut buf, reason);
            }
            Self::ConfigExit { request } => buf.put_u32_le(request.0),
            Self::ConfigExitReply { request, result } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
            }
            Self::FrameStart {
                frame,
                frame_data,
                version,
                active_pipes,
            } => {
                buf.put_u32_le(*frame);
                buf.put_u32_le(frame_data.0);
                buf.put_u32_le(version.0);
                put_object_list(&mut buf, active_pipes);
            }
            Self::FrameFinish { request, frame } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(*frame);
            }
            Self::FrameFinishReply {
                request,
                frame,
                result,
                reason,
            } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(*frame);
                buf.put_u32_le(u32::from(*result));
                put_string(&mut buf, reason);
            }
            Self::FrameImage {
                channel,
                frame,
                pvp,
                pixels,
            } => {
                buf.put_u32_le(channel.0);
                buf.put_u32_le(*frame);
                pvp.encode(&mut buf);
                buf.put_u64_le(pixels.len() as u64);
                buf.put_slice(pixels);
            }
        }
        buf.freeze()
    }

    /// Decode from a command value and body
    pub fn decode(command: u32, mut body: Bytes) -> NetResult<Self> {
        let buf = &mut body;
        match command {
            CMD_NODE_CREATE_PIPE => Ok(Self::CreatePipe {
                pipe: ObjectId(take_u32(buf)?),
            }),
            CMD_NODE_DESTROY_PIPE => Ok(Self::DestroyPipe {
                pipe: ObjectId(take_u32(buf)?),
            }),
            CMD_NODE_CONFIG_INIT => Ok(Self::ConfigInit {
                request: RequestId(take_u32(buf)?),
                init_id: take_u32(buf)?,
                thread_model: ThreadModel::decode(buf)?,
                name: take_string(buf)?,
            }),
            CMD_NODE_CONFIG_INIT_REPLY => Ok(Self::ConfigInitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
                reason: take_string(buf)?,
            }),
            CMD_NODE_CONFIG_EXIT => Ok(Self::ConfigExit {
                request: RequestId(take_u32(buf)?),
            }),
            CMD_NODE_CONFIG_EXIT_REPLY => Ok(Self::ConfigExitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
            }),
            CMD_NODE_FRAME_START => Ok(Self::FrameStart {
                frame: take_u32(buf)?,
                frame_data: ObjectId(take_u32(buf)?),
                version: Version(take_u32(buf)?),
                active_pipes: take_object_list(buf)?,
            }),
            CMD_NODE_FRAME_FINISH => Ok(Self::FrameFinish {
                request: RequestId(take_u32(buf)?),
                frame: take_u32(buf)?,
            }),
            CMD_NODE_FRAME_FINISH_REPLY => Ok(Self::FrameFinishReply {
                request: RequestId(take_u32(buf)?),
                frame: take_u32(buf)?,
                result: take_u32(buf)? != 0,
                reason: take_string(buf)?,
            }),
            CMD_NODE_FRAME_IMAGE => {
                let channel = ObjectId(take_u32(buf)?);
                let frame = take_u32(buf)?;
                let pvp = PixelViewport::decode(buf)?;
                if buf.remaining() < 8 {
                    return Err(NetError::MalformedPacket("truncated image".into()));
                }
                let len = buf.get_u64_le() as usize;
                if buf.remaining() < len {
                    return Err(NetError::MalformedPacket("truncated image pixels".into()));
                }
                let pixels = buf.split_to(len);
                Ok(Self::FrameImage {
                    channel,
                    frame,
                    pvp,
                    pixels,
                })
            }
            other => Err(NetError::UnknownCommand {
                datatype: 0,
                command: other,
            }),
        }
    }

    /// Send to the entity object `object` on node `to`
    pub fn send(&self, session: &Arc<Session>, to: NodeId, object: ObjectId) -> NetResult<()> {
        session.send_object_command(to, object, self.command(), self.encode_body())
    }
}

// ========================= Pipe commands ========================= //

const CMD_PIPE_CREATE_WINDOW: u32 = 0xa0;
const CMD_PIPE_DESTROY_WINDOW: u32 = 0xa1;
const CMD_PIPE_CONFIG_INIT: u32 = 0xa2;
const CMD_PIPE_CONFIG_INIT_REPLY: u32 = 0xa3;
const CMD_PIPE_CONFIG_EXIT: u32 = 0xa4;
const CMD_PIPE_CONFIG_EXIT_REPLY: u32 = 0xa5;
const CMD_PIPE_FRAME_START: u32 = 0xa6;
const CMD_PIPE_FRAME_DRAW_FINISH: u32 = 0xa7;
const CMD_PIPE_FRAME_TASKS_FINISH: u32 = 0xa8;

/// Commands addressed to a pipe entity
#[derive(Debug, Clone, PartialEq)]
pub enum PipeCommand {
    /// Instantiate a window entity on this pipe
    CreateWindow {
        /// Object id of the window entity
        window: ObjectId,
    },
    /// Tear down a window entity
    DestroyWindow {
        /// Object id of the window entity
        window: ObjectId,
    },
    /// Run the pipe's `config_init` callback on the pipe task
    ConfigInit {
        /// Pending request on the server
        request: RequestId,
        /// GPU / display index of this pipe
        device: u32,
        /// The pipe's configured name
        name: String,
    },
    /// Reply to [PipeCommand::ConfigInit]
    ConfigInitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
        /// Failure diagnostics, empty on success
        reason: String,
    },
    /// Run the pipe's `config_exit` callback
    ConfigExit {
        /// Pending request on the server
        request: RequestId,
    },
    /// Reply to [PipeCommand::ConfigExit]
    ConfigExitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
    },
    /// A new frame begins on this pipe; the task blocks until the
    /// frame-data replica reached `version`
    FrameStart {
        /// The frame number
        frame: u32,
        /// The frame-data object to wait on
        frame_data: ObjectId,
        /// The frame-data version of this frame
        version: Version,
    },
    /// All draw tasks of the frame have been issued to this pipe
    FrameDrawFinish {
        /// The frame number
        frame: u32,
    },
    /// All tasks of the frame have been issued to this pipe
    FrameTasksFinish {
        /// The frame number
        frame: u32,
    },
}

impl PipeCommand {
    /// The wire command value
    pub fn command(&self) -> u32 {
        match self {
            Self::CreateWindow { .. } => CMD_PIPE_CREATE_WINDOW,
            Self::DestroyWindow { .. } => CMD_PIPE_DESTROY_WINDOW,
            Self::ConfigInit { .. } => CMD_PIPE_CONFIG_INIT,
            Self::ConfigInitReply { .. } => CMD_PIPE_CONFIG_INIT_REPLY,
            Self::ConfigExit { .. } => CMD_PIPE_CONFIG_EXIT,
            Self::ConfigExitReply { .. } => CMD_PIPE_CONFIG_EXIT_REPLY,
            Self::FrameStart { .. } => CMD_PIPE_FRAME_START,
            Self::FrameDrawFinish { .. } => CMD_PIPE_FRAME_DRAW_FINISH,
            Self::FrameTasksFinish { .. } => CMD_PIPE_FRAME_TASKS_FINISH,
        }
    }

    /// Encode the command body
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::CreateWindow { window } | Self::DestroyWindow { window } => {
                buf.put_u32_le(window.0)
            }
            Self::ConfigInit {
                request,
                device,
                name,
            } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(*device);
                put_string(&mut buf, name);
            }
            Self::ConfigInitReply {
                request,
                result,
                reason,
            } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
                put_string(&mut buf, reason);
            }
            Self::ConfigExit { request } => buf.put_u32_le(request.0),
            Self::ConfigExitReply { request, result } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
            }
            Self::FrameStart {
                frame,
                frame_data,
                version,
            } => {
                buf.put_u32_le(*frame);
                buf.put_u32_le(frame_data.0);
                buf.put_u32_le(version.0);
            }
            Self::FrameDrawFinish { frame } | Self::FrameTasksFinish { frame } => {
                buf.put_u32_le(*frame)
            }
        }
        buf.freeze()
    }

    /// Decode from a command value and body
    pub fn decode(command: u32, mut body: Bytes) -> NetResult<Self> {
        let buf = &mut body;
        match command {
            CMD_PIPE_CREATE_WINDOW => Ok(Self::CreateWindow {
                window: ObjectId(take_u32(buf)?),
            }),
            CMD_PIPE_DESTROY_WINDOW => Ok(Self::DestroyWindow {
                window: ObjectId(take_u32(buf)?),
            }),
            CMD_PIPE_CONFIG_INIT => Ok(Self::ConfigInit {
                request: RequestId(take_u32(buf)?),
                device: take_u32(buf)?,
                name: take_string(buf)?,
            }),
            CMD_PIPE_CONFIG_INIT_REPLY => Ok(Self::ConfigInitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
                reason: take_string(buf)?,
            }),
            CMD_PIPE_CONFIG_EXIT => Ok(Self::ConfigExit {
                request: RequestId(take_u32(buf)?),
            }),
            CMD_PIPE_CONFIG_EXIT_REPLY => Ok(Self::ConfigExitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
            }),
            CMD_PIPE_FRAME_START => Ok(Self::FrameStart {
                frame: take_u32(buf)?,
                frame_data: ObjectId(take_u32(buf)?),
                version: Version(take_u32(buf)?),
            }),
            CMD_PIPE_FRAME_DRAW_FINISH => Ok(Self::FrameDrawFinish {
                frame: take_u32(buf)?,
            }),
            CMD_PIPE_FRAME_TASKS_FINISH => Ok(Self::FrameTasksFinish {
                frame: take_u32(buf)?,
            }),
            other => Err(NetError::UnknownCommand {
                datatype: 0,
                command: other,
            }),
        }
    }

    /// Send to the entity object `object` on node `to`
    pub fn send(&self, session: &Arc<Session>, to: NodeId, object: ObjectId) -> NetResult<()> {
        session.send_object_command(to, object, self.command(), self.encode_body())
    }
}

// ========================= Window commands ========================= //

const CMD_WINDOW_CREATE_CHANNEL: u32 = 0xb0;
const CMD_WINDOW_DESTROY_CHANNEL: u32 = 0xb1;
const CMD_WINDOW_CONFIG_INIT: u32 = 0xb2;
const CMD_WINDOW_CONFIG_INIT_REPLY: u32 = 0xb3;
const CMD_WINDOW_CONFIG_EXIT: u32 = 0xb4;
const CMD_WINDOW_CONFIG_EXIT_REPLY: u32 = 0xb5;
const CMD_WINDOW_START_FRAME: u32 = 0xb6;
const CMD_WINDOW_END_FRAME: u32 = 0xb7;
const CMD_WINDOW_FINISH: u32 = 0xb8;
const CMD_WINDOW_BARRIER: u32 = 0xb9;
const CMD_WINDOW_SWAP: u32 = 0xba;

/// Commands addressed to a window entity, executed on its pipe's task
#[derive(Debug, Clone, PartialEq)]
pub enum WindowCommand {
    /// Instantiate a channel entity in this window
    CreateChannel {
        /// Object id of the channel entity
        channel: ObjectId,
    },
    /// Tear down a channel entity
    DestroyChannel {
        /// Object id of the channel entity
        channel: ObjectId,
    },
    /// Create the OS window and run the `config_init` callback
    ConfigInit {
        /// Pending request on the server
        request: RequestId,
        /// Requested pixel viewport
        pvp: PixelViewport,
        /// The window's configured name
        name: String,
    },
    /// Reply to [WindowCommand::ConfigInit]; carries the realised pixel
    /// viewport, which the server adopts
    ConfigInitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
        /// The pixel viewport the window system actually granted
        pvp: PixelViewport,
        /// Failure diagnostics, empty on success
        reason: String,
    },
    /// Destroy the OS window and run the `config_exit` callback
    ConfigExit {
        /// Pending request on the server
        request: RequestId,
    },
    /// Reply to [WindowCommand::ConfigExit]
    ConfigExitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
    },
    /// Frame begin on this window; `make_current` is set when the pipe
    /// drives more than one window
    StartFrame {
        /// The frame number
        frame: u32,
        /// Whether the GL context must be made current
        make_current: bool,
    },
    /// Frame end on this window
    EndFrame {
        /// The frame number
        frame: u32,
    },
    /// Finish the GL command stream before entering swap barriers
    Finish,
    /// Enter a swap barrier at a specific barrier version
    Barrier {
        /// The barrier object
        barrier: ObjectId,
        /// The barrier version of this frame cycle
        version: Version,
    },
    /// Swap the window's front and back buffers
    Swap,
}

impl WindowCommand {
    /// The wire command value
    pub fn command(&self) -> u32 {
        match self {
            Self::CreateChannel { .. } => CMD_WINDOW_CREATE_CHANNEL,
            Self::DestroyChannel { .. } => CMD_WINDOW_DESTROY_CHANNEL,
            Self::ConfigInit { .. } => CMD_WINDOW_CONFIG_INIT,
            Self::ConfigInitReply { .. } => CMD_WINDOW_CONFIG_INIT_REPLY,
            Self::ConfigExit { .. } => CMD_WINDOW_CONFIG_EXIT,
            Self::ConfigExitReply { .. } => CMD_WINDOW_CONFIG_EXIT_REPLY,
            Self::StartFrame { .. } => CMD_WINDOW_START_FRAME,
            Self::EndFrame { .. } => CMD_WINDOW_END_FRAME,
            Self::Finish => CMD_WINDOW_FINISH,
            Self::Barrier { .. } => CMD_WINDOW_BARRIER,
            Self::Swap => CMD_WINDOW_SWAP,
        }
    }

    /// Encode the command body
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::CreateChannel { channel } | Self::DestroyChannel { channel } => {
                buf.put_u32_le(channel.0)
            }
            Self::ConfigInit { request, pvp, name } => {
                buf.put_u32_le(request.0);
                pvp.encode(&mut buf);
                put_string(&mut buf, name);
            }
            Self::ConfigInitReply {
                request,
                result,
                pvp,
                reason,
            } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
                pvp.encode(&mut buf);
                put_string(&mut buf, reason);
            }
            Self::ConfigExit { request } => buf.put_u32_le(request.0),
            Self::ConfigExitReply { request, result } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
            }
            Self::StartFrame {
                frame,
                make_current,
            } => {
                buf.put_u32_le(*frame);
                buf.put_u32_le(u32::from(*make_current));
            }
            Self::EndFrame { frame } => buf.put_u32_le(*frame),
            Self::Finish | Self::Swap => {}
            Self::Barrier { barrier, version } => {
                buf.put_u32_le(barrier.0);
                buf.put_u32_le(version.0);
            }
        }
        buf.freeze()
    }

    /// Decode from a command value and body
    pub fn decode(command: u32, mut body: Bytes) -> NetResult<Self> {
        let buf = &mut body;
        match command {
            CMD_WINDOW_CREATE_CHANNEL => Ok(Self::CreateChannel {
                channel: ObjectId(take_u32(buf)?),
            }),
            CMD_WINDOW_DESTROY_CHANNEL => Ok(Self::DestroyChannel {
                channel: ObjectId(take_u32(buf)?),
            }),
            CMD_WINDOW_CONFIG_INIT => Ok(Self::ConfigInit {
                request: RequestId(take_u32(buf)?),
                pvp: PixelViewport::decode(buf)?,
                name: take_string(buf)?,
            }),
            CMD_WINDOW_CONFIG_INIT_REPLY => Ok(Self::ConfigInitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
                pvp: PixelViewport::decode(buf)?,
                reason: take_string(buf)?,
            }),
            CMD_WINDOW_CONFIG_EXIT => Ok(Self::ConfigExit {
                request: RequestId(take_u32(buf)?),
            }),
            CMD_WINDOW_CONFIG_EXIT_REPLY => Ok(Self::ConfigExitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
            }),
            CMD_WINDOW_START_FRAME => Ok(Self::StartFrame {
                frame: take_u32(buf)?,
                make_current: take_u32(buf)? != 0,
            }),
            CMD_WINDOW_END_FRAME => Ok(Self::EndFrame {
                frame: take_u32(buf)?,
            }),
            CMD_WINDOW_FINISH => Ok(Self::Finish),
            CMD_WINDOW_BARRIER => Ok(Self::Barrier {
                barrier: ObjectId(take_u32(buf)?),
                version: Version(take_u32(buf)?),
            }),
            CMD_WINDOW_SWAP => Ok(Self::Swap),
            other => Err(NetError::UnknownCommand {
                datatype: 0,
                command: other,
            }),
        }
    }

    /// Send to the entity object `object` on node `to`
    pub fn send(&self, session: &Arc<Session>, to: NodeId, object: ObjectId) -> NetResult<()> {
        session.send_object_command(to, object, self.command(), self.encode_body())
    }
}

// ========================= Channel commands ========================= //

const CMD_CHANNEL_CONFIG_INIT: u32 = 0xc0;
const CMD_CHANNEL_CONFIG_INIT_REPLY: u32 = 0xc1;
const CMD_CHANNEL_CONFIG_EXIT: u32 = 0xc2;
const CMD_CHANNEL_CONFIG_EXIT_REPLY: u32 = 0xc3;
const CMD_CHANNEL_FRAME_CLEAR: u32 = 0xc4;
const CMD_CHANNEL_FRAME_DRAW: u32 = 0xc5;
const CMD_CHANNEL_FRAME_READBACK: u32 = 0xc6;
const CMD_CHANNEL_FRAME_ASSEMBLE: u32 = 0xc7;

/// Commands addressed to a channel entity, executed on its pipe's task
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    /// Run the channel's `config_init` callback
    ConfigInit {
        /// Pending request on the server
        request: RequestId,
        /// The channel's configured name
        name: String,
    },
    /// Reply to [ChannelCommand::ConfigInit]
    ConfigInitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
        /// Failure diagnostics, empty on success
        reason: String,
    },
    /// Run the channel's `config_exit` callback
    ConfigExit {
        /// Pending request on the server
        request: RequestId,
    },
    /// Reply to [ChannelCommand::ConfigExit]
    ConfigExitReply {
        /// The request being served
        request: RequestId,
        /// Callback success
        result: bool,
    },
    /// Clear the channel's viewport
    FrameClear {
        /// The task's render context
        context: RenderContext,
    },
    /// Draw the channel's share of the scene
    FrameDraw {
        /// The task's render context
        context: RenderContext,
    },
    /// Read the drawn viewport back and transmit it to a destination
    /// channel
    FrameReadback {
        /// The task's render context
        context: RenderContext,
        /// The node hosting the destination channel
        dest_node: NodeId,
        /// The destination node's frame inbox
        dest_inbox: ObjectId,
        /// The destination channel
        dest_channel: ObjectId,
    },
    /// Composite `expected` input frames into the channel's viewport
    FrameAssemble {
        /// The task's render context
        context: RenderContext,
        /// Number of input frames to wait for
        expected: u32,
    },
}

impl ChannelCommand {
    /// The wire command value
    pub fn command(&self) -> u32 {
        match self {
            Self::ConfigInit { .. } => CMD_CHANNEL_CONFIG_INIT,
            Self::ConfigInitReply { .. } => CMD_CHANNEL_CONFIG_INIT_REPLY,
            Self::ConfigExit { .. } => CMD_CHANNEL_CONFIG_EXIT,
            Self::ConfigExitReply { .. } => CMD_CHANNEL_CONFIG_EXIT_REPLY,
            Self::FrameClear { .. } => CMD_CHANNEL_FRAME_CLEAR,
            Self::FrameDraw { .. } => CMD_CHANNEL_FRAME_DRAW,
            Self::FrameReadback { .. } => CMD_CHANNEL_FRAME_READBACK,
            Self::FrameAssemble { .. } => CMD_CHANNEL_FRAME_ASSEMBLE,
        }
    }

    /// Encode the command body
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::ConfigInit { request, name } => {
                buf.put_u32_le(request.0);
                put_string(&mut buf, name);
            }
            Self::ConfigInitReply {
                request,
                result,
                reason,
            } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
                put_string(&mut buf, reason);
            }
            Self::ConfigExit { request } => buf.put_u32_le(request.0),
            Self::ConfigExitReply { request, result } => {
                buf.put_u32_le(request.0);
                buf.put_u32_le(u32::from(*result));
            }
            Self::FrameClear { context } | Self::FrameDraw { context } => {
                context.encode(&mut buf)
            }
            Self::FrameReadback {
                context,
                dest_node,
                dest_inbox,
                dest_channel,
            } => {
                context.encode(&mut buf);
                buf.put_u128_le(dest_node.0);
                buf.put_u32_le(dest_inbox.0);
                buf.put_u32_le(dest_channel.0);
            }
            Self::FrameAssemble { context, expected } => {
                context.encode(&mut buf);
                buf.put_u32_le(*expected);
            }
        }
        buf.freeze()
    }

    /// Decode from a command value and body
    pub fn decode(command: u32, mut body: Bytes) -> NetResult<Self> {
        let buf = &mut body;
        match command {
            CMD_CHANNEL_CONFIG_INIT => Ok(Self::ConfigInit {
                request: RequestId(take_u32(buf)?),
                name: take_string(buf)?,
            }),
            CMD_CHANNEL_CONFIG_INIT_REPLY => Ok(Self::ConfigInitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
                reason: take_string(buf)?,
            }),
            CMD_CHANNEL_CONFIG_EXIT => Ok(Self::ConfigExit {
                request: RequestId(take_u32(buf)?),
            }),
            CMD_CHANNEL_CONFIG_EXIT_REPLY => Ok(Self::ConfigExitReply {
                request: RequestId(take_u32(buf)?),
                result: take_u32(buf)? != 0,
            }),
            CMD_CHANNEL_FRAME_CLEAR => Ok(Self::FrameClear {
                context: RenderContext::decode(buf)?,
            }),
            CMD_CHANNEL_FRAME_DRAW => Ok(Self::FrameDraw {
                context: RenderContext::decode(buf)?,
            }),
            CMD_CHANNEL_FRAME_READBACK => Ok(Self::FrameReadback {
                context: RenderContext::decode(buf)?,
                dest_node: NodeId(take_u128(buf)?),
                dest_inbox: ObjectId(take_u32(buf)?),
                dest_channel: ObjectId(take_u32(buf)?),
            }),
            CMD_CHANNEL_FRAME_ASSEMBLE => Ok(Self::FrameAssemble {
                context: RenderContext::decode(buf)?,
                expected: take_u32(buf)?,
            }),
            other => Err(NetError::UnknownCommand {
                datatype: 0,
                command: other,
            }),
        }
    }

    /// Send to the entity object `object` on node `to`
    pub fn send(&self, session: &Arc<Session>, to: NodeId, object: ObjectId) -> NetResult<()> {
        session.send_object_command(to, object, self.command(), self.encode_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Range, Viewport};

    fn context() -> RenderContext {
        RenderContext {
            frame_number: 3,
            frame_version: Version(3),
            pvp: PixelViewport {
                x: 0,
                y: 0,
                w: 512,
                h: 512,
            },
            vp: Viewport::FULL,
            range: Range {
                start: 0.0,
                end: 0.5,
            },
        }
    }

    #[test]
    fn node_commands_roundtrip() {
        let commands = [
            NodeCommand::CreatePipe {
                pipe: ObjectId(4),
            },
            NodeCommand::ConfigInit {
                request: RequestId(1),
                init_id: 17,
                name: "render1".into(),
                thread_model: ThreadModel::LocalSync,
            },
            NodeCommand::FrameStart {
                frame: 5,
                frame_data: ObjectId(0),
                version: Version(5),
                active_pipes: vec![ObjectId(4), ObjectId(9)],
            },
            NodeCommand::FrameImage {
                channel: ObjectId(7),
                frame: 5,
                pvp: PixelViewport {
                    x: 0,
                    y: 0,
                    w: 2,
                    h: 2,
                },
                pixels: Bytes::from_static(&[1, 2, 3, 4]),
            },
        ];
        for command in commands {
            let decoded =
                NodeCommand::decode(command.command(), command.encode_body()).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn window_commands_roundtrip() {
        let commands = [
            WindowCommand::ConfigInit {
                request: RequestId(2),
                pvp: PixelViewport {
                    x: 10,
                    y: 20,
                    w: 640,
                    h: 480,
                },
                name: "window.0".into(),
            },
            WindowCommand::Barrier {
                barrier: ObjectId(12),
                version: Version(6),
            },
            WindowCommand::StartFrame {
                frame: 6,
                make_current: true,
            },
            WindowCommand::Swap,
        ];
        for command in commands {
            let decoded =
                WindowCommand::decode(command.command(), command.encode_body()).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn channel_commands_roundtrip() {
        let commands = [
            ChannelCommand::FrameDraw { context: context() },
            ChannelCommand::FrameReadback {
                context: context(),
                dest_node: NodeId(99),
                dest_inbox: ObjectId(2),
                dest_channel: ObjectId(3),
            },
            ChannelCommand::FrameAssemble {
                context: context(),
                expected: 2,
            },
        ];
        for command in commands {
            let decoded =
                ChannelCommand::decode(command.command(), command.encode_body()).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn families_partition_the_command_space() {
        assert_eq!(family(0x80).unwrap(), CommandFamily::Client);
        assert_eq!(family(0x96).unwrap(), CommandFamily::Node);
        assert_eq!(family(0xa6).unwrap(), CommandFamily::Pipe);
        assert_eq!(family(0xb9).unwrap(), CommandFamily::Window);
        assert_eq!(family(0xc5).unwrap(), CommandFamily::Channel);
        assert!(family(0x10).is_err());
    }
}
