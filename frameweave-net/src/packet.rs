// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The wire protocol.
//!
//! Every packet starts with a fixed header `{ u64 size, u32 datatype,
//! u32 command }`; `size` covers the header and everything after it, so a
//! receiver always knows how many bytes to pull off the stream before
//! decoding. Multi-byte integers are little-endian; peers of the same
//! architecture are assumed.
//!
//! Inline trailing payloads (session names, object instance data, custom
//! command bodies) are carried in the same transport frame: a `u64` length
//! followed by the payload, NUL-terminated for strings and zero-padded to
//! 8-byte alignment. This keeps short control sends atomic on the
//! connection.
//!
//! Commands above [CUSTOM_COMMAND_BASE] are opaque to this crate: their
//! body bytes are handed to whatever handler the owning session or object
//! has registered. The render hierarchy defines its command sets this way.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::connection::ConnectionDescription;
use crate::error::NetError;
use crate::{NetResult, NodeId, ObjectId, RequestId, SessionId, Version};

/// Size of the fixed packet header in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest packet size accepted from the wire. Readback frames dominate;
/// anything beyond this is treated as a protocol violation.
pub const MAX_PACKET_SIZE: u64 = 256 * 1024 * 1024;

/// First command value reserved for commands defined outside this crate
pub const CUSTOM_COMMAND_BASE: u32 = 0x80;

// ========================= Datatypes ========================= //

/// Wire datatype: node-level command table
pub const DATATYPE_NODE: u32 = 1;
/// Wire datatype: session-level command table
pub const DATATYPE_SESSION: u32 = 2;
/// Wire datatype: object-level command table
pub const DATATYPE_OBJECT: u32 = 3;

// ========================= Node commands ========================= //

const CMD_NODE_STOP: u32 = 0;
const CMD_NODE_CONNECT: u32 = 1;
const CMD_NODE_CONNECT_REPLY: u32 = 2;
const CMD_NODE_MAP_SESSION: u32 = 3;
const CMD_NODE_MAP_SESSION_REPLY: u32 = 4;
const CMD_NODE_UNMAP_SESSION: u32 = 5;
const CMD_NODE_UNMAP_SESSION_REPLY: u32 = 6;
const CMD_NODE_GET_CONNECTION_DESCRIPTION: u32 = 7;
const CMD_NODE_GET_CONNECTION_DESCRIPTION_REPLY: u32 = 8;

// ========================= Session commands ========================= //

const CMD_SESSION_SUBSCRIBE_OBJECT: u32 = 0;
const CMD_SESSION_SUBSCRIBE_OBJECT_REPLY: u32 = 1;
const CMD_SESSION_UNSUBSCRIBE_OBJECT: u32 = 2;

// ========================= Object commands ========================= //

const CMD_OBJECT_DELTA: u32 = 0;
const CMD_OBJECT_SYNC: u32 = 1;
const CMD_OBJECT_SYNC_REPLY: u32 = 2;
const CMD_OBJECT_BARRIER_ENTER: u32 = 3;
const CMD_OBJECT_BARRIER_RELEASE: u32 = 4;

/// A decoded transport frame
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A packet for the node-level command table
    Node(NodePacket),
    /// A packet routed to a mapped session
    Session {
        /// The addressed session
        session: SessionId,
        /// The session-level command
        command: SessionPacket,
    },
    /// A packet routed to an object attached to a session
    Object {
        /// The session owning the object
        session: SessionId,
        /// The addressed object
        object: ObjectId,
        /// The object-level command
        command: ObjectPacket,
    },
}

/// Node-level commands
#[derive(Debug, Clone, PartialEq)]
pub enum NodePacket {
    /// Stop the receiver loop of a listening node
    Stop,
    /// First half of the connect handshake, sent by the connecting side.
    /// `launch_request` carries the pending request id of the launching
    /// parent when this node was auto-launched, [RequestId::INVALID]
    /// otherwise.
    Connect {
        /// The sender's node id
        node: NodeId,
        /// Outstanding launch request on the receiving side
        launch_request: RequestId,
        /// How the sender can be reached
        descriptions: Vec<ConnectionDescription>,
    },
    /// Second half of the connect handshake, sent by the accepting side
    ConnectReply {
        /// The sender's node id
        node: NodeId,
        /// How the sender can be reached
        descriptions: Vec<ConnectionDescription>,
    },
    /// Map a session by name (allocating an id on first use) or by id
    MapSession {
        /// Pending request on the sender
        request: RequestId,
        /// The session id, or [SessionId::INVALID] to resolve by name
        session: SessionId,
        /// The session name for by-name resolution
        name: String,
    },
    /// Reply to [NodePacket::MapSession]
    MapSessionReply {
        /// The request being served
        request: RequestId,
        /// The resolved session id, [SessionId::INVALID] on failure
        session: SessionId,
        /// The resolved session name
        name: String,
    },
    /// Unmap a previously mapped session
    UnmapSession {
        /// Pending request on the sender
        request: RequestId,
        /// The session to unmap
        session: SessionId,
    },
    /// Reply to [NodePacket::UnmapSession]
    UnmapSessionReply {
        /// The request being served
        request: RequestId,
        /// Whether the session was mapped and is now unmapped
        result: bool,
    },
    /// Ask a peer for the connection descriptions of a third node
    GetConnectionDescription {
        /// Pending request on the sender
        request: RequestId,
        /// The node being looked up
        node: NodeId,
    },
    /// Reply to [NodePacket::GetConnectionDescription]. An empty
    /// description list means the node is unknown to the peer.
    GetConnectionDescriptionReply {
        /// The request being served
        request: RequestId,
        /// The node that was looked up
        node: NodeId,
        /// The descriptions known to the peer
        descriptions: Vec<ConnectionDescription>,
    },
}

/// Session-level commands
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPacket {
    /// Map an object mastered on the receiving node; the reply carries an
    /// instance data snapshot
    SubscribeObject {
        /// Pending request on the sender
        request: RequestId,
        /// The object to map
        object: ObjectId,
        /// The node that wants delta updates
        requester: NodeId,
    },
    /// Reply to [SessionPacket::SubscribeObject]
    SubscribeObjectReply {
        /// The request being served
        request: RequestId,
        /// The object that was mapped
        object: ObjectId,
        /// Whether the master knows the object
        result: bool,
        /// The master's head version at snapshot time
        version: Version,
        /// The instance data snapshot
        data: Bytes,
    },
    /// Drop a slave instance; the master stops sending deltas to `node`
    UnsubscribeObject {
        /// The object being released
        object: ObjectId,
        /// The node releasing its slave instance
        node: NodeId,
    },
    /// A command defined by a higher layer, dispatched to the session's
    /// registered command handler
    Command {
        /// Command value, `>=` [CUSTOM_COMMAND_BASE]
        command: u32,
        /// Opaque command body
        body: Bytes,
    },
}

/// Object-level commands
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectPacket {
    /// A versioned delta from the master to a slave instance
    Delta {
        /// The version this delta produces
        version: Version,
        /// Packed delta data
        data: Bytes,
    },
    /// Ask the master for its head version
    Sync {
        /// Pending request on the sender
        request: RequestId,
    },
    /// Reply to [ObjectPacket::Sync]
    SyncReply {
        /// The request being served
        request: RequestId,
        /// The master's head version
        version: Version,
    },
    /// Enter a barrier at the given barrier version
    BarrierEnter {
        /// The barrier version being entered
        version: Version,
        /// The entering node
        node: NodeId,
    },
    /// Release broadcast for all participants of a barrier version
    BarrierRelease {
        /// The barrier version being released
        version: Version,
    },
    /// A command defined by a higher layer, dispatched to the attached
    /// entity's command queue
    Command {
        /// Command value, `>=` [CUSTOM_COMMAND_BASE]
        command: u32,
        /// Opaque command body
        body: Bytes,
    },
}

impl Packet {
    /// The wire datatype and command of this packet
    pub fn datatype_command(&self) -> (u32, u32) {
        match self {
            Packet::Node(cmd) => (
                DATATYPE_NODE,
                match cmd {
                    NodePacket::Stop => CMD_NODE_STOP,
                    NodePacket::Connect { .. } => CMD_NODE_CONNECT,
                    NodePacket::ConnectReply { .. } => CMD_NODE_CONNECT_REPLY,
                    NodePacket::MapSession { .. } => CMD_NODE_MAP_SESSION,
                    NodePacket::MapSessionReply { .. } => CMD_NODE_MAP_SESSION_REPLY,
                    NodePacket::UnmapSession { .. } => CMD_NODE_UNMAP_SESSION,
                    NodePacket::UnmapSessionReply { .. } => CMD_NODE_UNMAP_SESSION_REPLY,
                    NodePacket::GetConnectionDescription { .. } => {
                        CMD_NODE_GET_CONNECTION_DESCRIPTION
                    }
                    NodePacket::GetConnectionDescriptionReply { .. } => {
                        CMD_NODE_GET_CONNECTION_DESCRIPTION_REPLY
                    }
                },
            ),
            Packet::Session { command, .. } => (
                DATATYPE_SESSION,
                match command {
                    SessionPacket::SubscribeObject { .. } => CMD_SESSION_SUBSCRIBE_OBJECT,
                    SessionPacket::SubscribeObjectReply { .. } => {
                        CMD_SESSION_SUBSCRIBE_OBJECT_REPLY
                    }
                    SessionPacket::UnsubscribeObject { .. } => CMD_SESSION_UNSUBSCRIBE_OBJECT,
                    SessionPacket::Command { command, .. } => *command,
                },
            ),
            Packet::Object { command, .. } => (
                DATATYPE_OBJECT,
                match command {
                    ObjectPacket::Delta { .. } => CMD_OBJECT_DELTA,
                    ObjectPacket::Sync { .. } => CMD_OBJECT_SYNC,
                    ObjectPacket::SyncReply { .. } => CMD_OBJECT_SYNC_REPLY,
                    ObjectPacket::BarrierEnter { .. } => CMD_OBJECT_BARRIER_ENTER,
                    ObjectPacket::BarrierRelease { .. } => CMD_OBJECT_BARRIER_RELEASE,
                    ObjectPacket::Command { command, .. } => *command,
                },
            ),
        }
    }

    /// Encode this packet into a single transport frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        let (datatype, command) = self.datatype_command();
        buf.put_u64_le(0); // size, backpatched below
        buf.put_u32_le(datatype);
        buf.put_u32_le(command);

        match self {
            Packet::Node(cmd) => encode_node(cmd, &mut buf),
            Packet::Session { session, command } => {
                buf.put_u32_le(session.0);
                encode_session(command, &mut buf);
            }
            Packet::Object {
                session,
                object,
                command,
            } => {
                buf.put_u32_le(session.0);
                buf.put_u32_le(object.0);
                encode_object(command, &mut buf);
            }
        }

        let size = buf.len() as u64;
        buf[0..8].copy_from_slice(&size.to_le_bytes());
        buf.freeze()
    }

    /// Decode a packet from its header fields and body (the bytes after
    /// the fixed header)
    pub fn decode(datatype: u32, command: u32, mut body: Bytes) -> NetResult<Packet> {
        let buf = &mut body;
        match datatype {
            DATATYPE_NODE => decode_node(command, buf).map(Packet::Node),
            DATATYPE_SESSION => {
                let session = SessionId(take_u32(buf)?);
                let command = decode_session(command, buf)?;
                Ok(Packet::Session { session, command })
            }
            DATATYPE_OBJECT => {
                let session = SessionId(take_u32(buf)?);
                let object = ObjectId(take_u32(buf)?);
                let command = decode_object(command, buf)?;
                Ok(Packet::Object {
                    session,
                    object,
                    command,
                })
            }
            other => Err(NetError::MalformedPacket(format!(
                "unknown datatype {other}"
            ))),
        }
    }
}

fn encode_node(cmd: &NodePacket, buf: &mut BytesMut) {
    match cmd {
        NodePacket::Stop => {}
        NodePacket::Connect {
            node,
            launch_request,
            descriptions,
        } => {
            buf.put_u128_le(node.0);
            buf.put_u32_le(launch_request.0);
            put_descriptions(buf, descriptions);
        }
        NodePacket::ConnectReply { node, descriptions } => {
            buf.put_u128_le(node.0);
            put_descriptions(buf, descriptions);
        }
        NodePacket::MapSession {
            request,
            session,
            name,
        } => {
            buf.put_u32_le(request.0);
            buf.put_u32_le(session.0);
            put_string(buf, name);
        }
        NodePacket::MapSessionReply {
            request,
            session,
            name,
        } => {
            buf.put_u32_le(request.0);
            buf.put_u32_le(session.0);
            put_string(buf, name);
        }
        NodePacket::UnmapSession { request, session } => {
            buf.put_u32_le(request.0);
            buf.put_u32_le(session.0);
        }
        NodePacket::UnmapSessionReply { request, result } => {
            buf.put_u32_le(request.0);
            buf.put_u32_le(u32::from(*result));
        }
        NodePacket::GetConnectionDescription { request, node } => {
            buf.put_u32_le(request.0);
            buf.put_u128_le(node.0);
        }
        NodePacket::GetConnectionDescriptionReply {
            request,
            node,
            descriptions,
        } => {
            buf.put_u32_le(request.0);
            buf.put_u128_le(node.0);
            put_descriptions(buf, descriptions);
        }
    }
}

fn decode_node(command: u32, buf: &mut Bytes) -> NetResult<NodePacket> {
    match command {
        CMD_NODE_STOP => Ok(NodePacket::Stop),
        CMD_NODE_CONNECT => Ok(NodePacket::Connect {
            node: NodeId(take_u128(buf)?),
            launch_request: RequestId(take_u32(buf)?),
            descriptions: take_descriptions(buf)?,
        }),
        CMD_NODE_CONNECT_REPLY => Ok(NodePacket::ConnectReply {
            node: NodeId(take_u128(buf)?),
            descriptions: take_descriptions(buf)?,
        }),
        CMD_NODE_MAP_SESSION => Ok(NodePacket::MapSession {
            request: RequestId(take_u32(buf)?),
            session: SessionId(take_u32(buf)?),
            name: take_string(buf)?,
        }),
        CMD_NODE_MAP_SESSION_REPLY => Ok(NodePacket::MapSessionReply {
            request: RequestId(take_u32(buf)?),
            session: SessionId(take_u32(buf)?),
            name: take_string(buf)?,
        }),
        CMD_NODE_UNMAP_SESSION => Ok(NodePacket::UnmapSession {
            request: RequestId(take_u32(buf)?),
            session: SessionId(take_u32(buf)?),
        }),
        CMD_NODE_UNMAP_SESSION_REPLY => Ok(NodePacket::UnmapSessionReply {
            request: RequestId(take_u32(buf)?),
            result: take_u32(buf)? != 0,
        }),
        CMD_NODE_GET_CONNECTION_DESCRIPTION => Ok(NodePacket::GetConnectionDescription {
            request: RequestId(take_u32(buf)?),
            node: NodeId(take_u128(buf)?),
        }),
        CMD_NODE_GET_CONNECTION_DESCRIPTION_REPLY => {
            Ok(NodePacket::GetConnectionDescriptionReply {
                request: RequestId(take_u32(buf)?),
                node: NodeId(take_u128(buf)?),
                descriptions: take_descriptions(buf)?,
            })
        }
        other => Err(NetError::UnknownCommand {
            datatype: DATATYPE_NODE,
            command: other,
        }),
    }
}

fn encode_session(cmd: &SessionPacket, buf: &mut BytesMut) {
    match cmd {
        SessionPacket::SubscribeObject {
            request,
            object,
            requester,
        } => {
            buf.put_u32_le(request.0);
            buf.put_u32_le(object.0);
            buf.put_u128_le(requester.0);
        }
        SessionPacket::SubscribeObjectReply {
            request,
            object,
            result,
            version,
            data,
        } => {
            buf.put_u32_le(request.0);
            buf.put_u32_le(object.0);
            buf.put_u32_le(u32::from(*result));
            buf.put_u32_le(version.0);
            put_blob(buf, data);
        }
        SessionPacket::UnsubscribeObject { object, node } => {
            buf.put_u32_le(object.0);
            buf.put_u128_le(node.0);
        }
        SessionPacket::Command { body, .. } => {
            put_blob(buf, body);
        }
    }
}

fn decode_session(command: u32, buf: &mut Bytes) -> NetResult<SessionPacket> {
    match command {
        CMD_SESSION_SUBSCRIBE_OBJECT => Ok(SessionPacket::SubscribeObject {
            request: RequestId(take_u32(buf)?),
            object: ObjectId(take_u32(buf)?),
            requester: NodeId(take_u128(buf)?),
        }),
        CMD_SESSION_SUBSCRIBE_OBJECT_REPLY => Ok(SessionPacket::SubscribeObjectReply {
            request: RequestId(take_u32(buf)?),
            object: ObjectId(take_u32(buf)?),
            result: take_u32(buf)? != 0,
            version: Version(take_u32(buf)?),
            data: take_blob(buf)?,
        }),
        CMD_SESSION_UNSUBSCRIBE_OBJECT => Ok(SessionPacket::UnsubscribeObject {
            object: ObjectId(take_u32(buf)?),
            node: NodeId(take_u128(buf)?),
        }),
        custom if custom >= CUSTOM_COMMAND_BASE => Ok(SessionPacket::Command {
            command: custom,
            body: take_blob(buf)?,
        }),
        other => Err(NetError::UnknownCommand {
            datatype: DATATYPE_SESSION,
            command: other,
        }),
    }
}

fn encode_object(cmd: &ObjectPacket, buf: &mut BytesMut) {
    match cmd {
        ObjectPacket::Delta { version, data } => {
            buf.put_u32_le(version.0);
            put_blob(buf, data);
        }
        ObjectPacket::Sync { request } => {
            buf.put_u32_le(request.0);
        }
        ObjectPacket::SyncReply { request, version } => {
            buf.put_u32_le(request.0);
            buf.put_u32_le(version.0);
        }
        ObjectPacket::BarrierEnter { version, node } => {
            buf.put_u32_le(version.0);
            buf.put_u128_le(node.0);
        }
        ObjectPacket::BarrierRelease { version } => {
            buf.put_u32_le(version.0);
        }
        ObjectPacket::Command { body, .. } => {
            put_blob(buf, body);
        }
    }
}

fn decode_object(command: u32, buf: &mut Bytes) -> NetResult<ObjectPacket> {
    match command {
        CMD_OBJECT_DELTA => Ok(ObjectPacket::Delta {
            version: Version(take_u32(buf)?),
            data: take_blob(buf)?,
        }),
        CMD_OBJECT_SYNC => Ok(ObjectPacket::Sync {
            request: RequestId(take_u32(buf)?),
        }),
        CMD_OBJECT_SYNC_REPLY => Ok(ObjectPacket::SyncReply {
            request: RequestId(take_u32(buf)?),
            version: Version(take_u32(buf)?),
        }),
        CMD_OBJECT_BARRIER_ENTER => Ok(ObjectPacket::BarrierEnter {
            version: Version(take_u32(buf)?),
            node: NodeId(take_u128(buf)?),
        }),
        CMD_OBJECT_BARRIER_RELEASE => Ok(ObjectPacket::BarrierRelease {
            version: Version(take_u32(buf)?),
        }),
        custom if custom >= CUSTOM_COMMAND_BASE => Ok(ObjectPacket::Command {
            command: custom,
            body: take_blob(buf)?,
        }),
        other => Err(NetError::UnknownCommand {
            datatype: DATATYPE_OBJECT,
            command: other,
        }),
    }
}

// ========================= Field helpers ========================= //

/// Append a length-prefixed string as an inline payload: `u64` length
/// (including the NUL), the bytes, a NUL terminator and zero padding to
/// 8-byte alignment.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    let len = value.len() as u64 + 1;
    buf.put_u64_le(len);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    let pad = (8 - (len % 8)) % 8;
    buf.put_bytes(0, pad as usize);
}

/// Take a string written by [put_string]
pub fn take_string(buf: &mut Bytes) -> NetResult<String> {
    let len = take_u64(buf)?;
    if len == 0 {
        return Err(NetError::MalformedPacket("string without NUL".into()));
    }
    let padded = len + (8 - (len % 8)) % 8;
    if buf.remaining() < padded as usize {
        return Err(NetError::MalformedPacket("truncated string".into()));
    }
    let raw = buf.split_to(padded as usize);
    let text = &raw[..(len - 1) as usize];
    String::from_utf8(text.to_vec())
        .map_err(|_| NetError::MalformedPacket("string is not valid utf-8".into()))
}

/// Append a length-prefixed binary payload, zero-padded to 8-byte
/// alignment
pub fn put_blob(buf: &mut BytesMut, value: &[u8]) {
    let len = value.len() as u64;
    buf.put_u64_le(len);
    buf.put_slice(value);
    let pad = (8 - (len % 8)) % 8;
    buf.put_bytes(0, pad as usize);
}

/// Take a binary payload written by [put_blob]
pub fn take_blob(buf: &mut Bytes) -> NetResult<Bytes> {
    let len = take_u64(buf)?;
    let padded = len + (8 - (len % 8)) % 8;
    if buf.remaining() < padded as usize {
        return Err(NetError::MalformedPacket("truncated payload".into()));
    }
    let mut raw = buf.split_to(padded as usize);
    raw.truncate(len as usize);
    Ok(raw)
}

pub(crate) fn take_u32(buf: &mut Bytes) -> NetResult<u32> {
    if buf.remaining() < 4 {
        return Err(NetError::MalformedPacket("truncated u32 field".into()));
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn take_u64(buf: &mut Bytes) -> NetResult<u64> {
    if buf.remaining() < 8 {
        return Err(NetError::MalformedPacket("truncated u64 field".into()));
    }
    Ok(buf.get_u64_le())
}

pub(crate) fn take_u128(buf: &mut Bytes) -> NetResult<u128> {
    if buf.remaining() < 16 {
        return Err(NetError::MalformedPacket("truncated u128 field".into()));
    }
    Ok(buf.get_u128_le())
}

pub(crate) fn put_descriptions(buf: &mut BytesMut, descriptions: &[ConnectionDescription]) {
    buf.put_u32_le(descriptions.len() as u32);
    for description in descriptions {
        description.encode(buf);
    }
}

pub(crate) fn take_descriptions(buf: &mut Bytes) -> NetResult<Vec<ConnectionDescription>> {
    let count = take_u32(buf)?;
    if count > 64 {
        return Err(NetError::MalformedPacket(format!(
            "implausible description count {count}"
        )));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(ConnectionDescription::decode(buf)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionKind;

    fn roundtrip(packet: Packet) {
        let frame = packet.encode();
        assert_eq!(frame.len() % 8, 0, "frames are 8-byte aligned");
        let mut buf = frame.clone();
        let size = buf.get_u64_le();
        assert_eq!(size as usize, frame.len());
        let datatype = buf.get_u32_le();
        let command = buf.get_u32_le();
        let decoded = Packet::decode(datatype, command, buf).expect("decode failed");
        assert_eq!(packet, decoded);
    }

    #[test]
    fn node_packets_roundtrip() {
        let description = ConnectionDescription {
            kind: ConnectionKind::Tcpip,
            hostname: "render1".into(),
            port: 4242,
            bandwidth: 1000,
            launch_command: "ssh %h %n -- --eq-client %q%c%q".into(),
            launch_timeout: std::time::Duration::from_secs(10),
            launch_quote_char: '\'',
        };
        roundtrip(Packet::Node(NodePacket::Connect {
            node: NodeId(0xfeed_beef),
            launch_request: RequestId(7),
            descriptions: vec![description.clone(), description],
        }));
        roundtrip(Packet::Node(NodePacket::MapSession {
            request: RequestId(1),
            session: SessionId::INVALID,
            name: "config".into(),
        }));
        roundtrip(Packet::Node(NodePacket::Stop));
    }

    #[test]
    fn object_packets_roundtrip() {
        roundtrip(Packet::Object {
            session: SessionId(3),
            object: ObjectId(9),
            command: ObjectPacket::Delta {
                version: Version(17),
                data: Bytes::from_static(b"delta-payload"),
            },
        });
        roundtrip(Packet::Object {
            session: SessionId(3),
            object: ObjectId(9),
            command: ObjectPacket::Command {
                command: CUSTOM_COMMAND_BASE + 5,
                body: Bytes::from_static(b"\x01\x02\x03"),
            },
        });
    }

    #[test]
    fn session_subscribe_roundtrip() {
        roundtrip(Packet::Session {
            session: SessionId(1),
            command: SessionPacket::SubscribeObjectReply {
                request: RequestId(11),
                object: ObjectId(4),
                result: true,
                version: Version(2),
                data: Bytes::from_static(b"instance"),
            },
        });
    }

    #[test]
    fn strings_are_nul_terminated_and_padded() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "abc");
        // u64 length (4, including NUL) + "abc\0" + 4 bytes padding
        assert_eq!(buf.len(), 8 + 8);
        assert_eq!(&buf[8..12], b"abc\0");
        let mut bytes = buf.freeze();
        assert_eq!(take_string(&mut bytes).unwrap(), "abc");
        assert!(bytes.is_empty());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = decode_node(0x7f, &mut Bytes::new()).unwrap_err();
        assert!(matches!(err, NetError::UnknownCommand { .. }));
    }
}
