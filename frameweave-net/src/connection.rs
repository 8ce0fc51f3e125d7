// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Reliable, ordered, bidirectional byte pipes between cluster nodes.
//!
//! Two concrete transports exist: a TCP/IP socket and a local socket pair
//! (the `Pipe` kind, used for same-host render nodes and tests). A
//! [Connection] carries whole [Packet] transport frames; sends are
//! all-or-nothing and receives block until a full frame arrived or the
//! peer closed.

use std::fmt::Display;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp;
use tokio::net::unix;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::NetError;
use crate::packet::{self, Packet, HEADER_SIZE, MAX_PACKET_SIZE};
use crate::NetResult;

/// The transport selected by a [ConnectionDescription]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// TCP/IP socket
    Tcpip,
    /// Local socket pair; `hostname` is the filesystem path of the
    /// listening socket
    Pipe,
}

/// Describes how a node can be reached, and how to launch a render
/// process for it when it is not running yet.
///
/// Descriptions are owned by the configuration and cloned onto remote
/// nodes during the connect handshake, so every peer learns how to reach
/// the others.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescription {
    /// The transport to use
    pub kind: ConnectionKind,
    /// Hostname (TCP) or socket path (pipe)
    pub hostname: String,
    /// TCP port; ignored for pipes
    pub port: u16,
    /// Estimated bandwidth in MB/s, used by the configuration for frame
    /// transport planning
    pub bandwidth: u32,
    /// Template of the remote-shell command used to start a render
    /// process on this host; empty disables auto-launch
    pub launch_command: String,
    /// How long a launched process may take to connect back
    pub launch_timeout: Duration,
    /// Quote character for the `%c` substitution of the launch command
    pub launch_quote_char: char,
}

impl Default for ConnectionDescription {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Tcpip,
            hostname: "localhost".into(),
            port: crate::default_port(),
            bandwidth: 0,
            launch_command: String::new(),
            launch_timeout: Duration::from_secs(10),
            launch_quote_char: '\'',
        }
    }
}

impl ConnectionDescription {
    /// The socket address of this description, `hostname:port`
    pub fn address(&self) -> String {
        match self.kind {
            ConnectionKind::Tcpip => format!("{}:{}", self.hostname, self.port),
            ConnectionKind::Pipe => self.hostname.clone(),
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(match self.kind {
            ConnectionKind::Tcpip => 0,
            ConnectionKind::Pipe => 1,
        });
        buf.put_u32_le(u32::from(self.port));
        buf.put_u32_le(self.bandwidth);
        buf.put_u64_le(self.launch_timeout.as_millis() as u64);
        buf.put_u32_le(self.launch_quote_char as u32);
        packet::put_string(buf, &self.hostname);
        packet::put_string(buf, &self.launch_command);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> NetResult<Self> {
        let kind = match packet::take_u32(buf)? {
            0 => ConnectionKind::Tcpip,
            1 => ConnectionKind::Pipe,
            other => {
                return Err(NetError::MalformedPacket(format!(
                    "unknown connection kind {other}"
                )))
            }
        };
        let port = packet::take_u32(buf)? as u16;
        let bandwidth = packet::take_u32(buf)?;
        let launch_timeout = Duration::from_millis(packet::take_u64(buf)?);
        let launch_quote_char = char::from_u32(packet::take_u32(buf)?)
            .ok_or_else(|| NetError::MalformedPacket("invalid quote char".into()))?;
        let hostname = packet::take_string(buf)?;
        let launch_command = packet::take_string(buf)?;
        Ok(Self {
            kind,
            hostname,
            port,
            bandwidth,
            launch_command,
            launch_timeout,
            launch_quote_char,
        })
    }
}

impl Display for ConnectionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ConnectionKind::Tcpip => write!(f, "tcp://{}:{}", self.hostname, self.port),
            ConnectionKind::Pipe => write!(f, "pipe://{}", self.hostname),
        }
    }
}

// ========================= Connection ========================= //

/// A connected byte pipe carrying transport frames
#[derive(Debug)]
pub enum Connection {
    /// TCP/IP socket
    Tcp(TcpStream),
    /// Local socket
    Local(UnixStream),
}

impl Connection {
    /// Open a connection to the endpoint named by a description
    pub async fn connect(description: &ConnectionDescription) -> NetResult<Self> {
        match description.kind {
            ConnectionKind::Tcpip => {
                let stream = TcpStream::connect(description.address()).await?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
            ConnectionKind::Pipe => {
                let stream = UnixStream::connect(&description.hostname).await?;
                Ok(Self::Local(stream))
            }
        }
    }

    /// An in-process connected pair, mostly for tests and same-process
    /// loopback
    pub fn pair() -> NetResult<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::Local(a), Self::Local(b)))
    }

    /// Send one packet as a single transport frame. All-or-nothing: on
    /// any short write the connection is unusable and an error is
    /// returned.
    pub async fn send_packet(&mut self, packet: &Packet) -> NetResult<()> {
        let frame = packet.encode();
        match self {
            Self::Tcp(stream) => stream.write_all(&frame).await?,
            Self::Local(stream) => stream.write_all(&frame).await?,
        }
        Ok(())
    }

    /// Receive the next packet. Blocks until a whole frame arrived;
    /// returns [None] when the peer closed the connection cleanly between
    /// frames.
    pub async fn recv_packet(&mut self) -> NetResult<Option<Packet>> {
        match self {
            Self::Tcp(stream) => recv_frame(stream).await,
            Self::Local(stream) => recv_frame(stream).await,
        }
    }

    /// Split into independently-owned read and write halves
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        match self {
            Self::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (
                    ConnectionReader::Tcp(read),
                    ConnectionWriter::Tcp(write),
                )
            }
            Self::Local(stream) => {
                let (read, write) = stream.into_split();
                (
                    ConnectionReader::Local(read),
                    ConnectionWriter::Local(write),
                )
            }
        }
    }
}

/// The receive half of a split [Connection]
#[derive(Debug)]
pub enum ConnectionReader {
    /// TCP/IP read half
    Tcp(tcp::OwnedReadHalf),
    /// Local socket read half
    Local(unix::OwnedReadHalf),
}

impl ConnectionReader {
    /// Receive the next packet; [None] on clean close
    pub async fn recv_packet(&mut self) -> NetResult<Option<Packet>> {
        match self {
            Self::Tcp(read) => recv_frame(read).await,
            Self::Local(read) => recv_frame(read).await,
        }
    }
}

/// The send half of a split [Connection]
#[derive(Debug)]
pub enum ConnectionWriter {
    /// TCP/IP write half
    Tcp(tcp::OwnedWriteHalf),
    /// Local socket write half
    Local(unix::OwnedWriteHalf),
}

impl ConnectionWriter {
    /// Write one pre-encoded transport frame, all-or-nothing
    pub async fn send_frame(&mut self, frame: &[u8]) -> NetResult<()> {
        match self {
            Self::Tcp(write) => write.write_all(frame).await?,
            Self::Local(write) => write.write_all(frame).await?,
        }
        Ok(())
    }
}

async fn recv_frame<R>(read: &mut R) -> NetResult<Option<Packet>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match read.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            // clean close between frames
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    }

    let mut cursor = &header[..];
    let size = cursor.get_u64_le();
    let datatype = cursor.get_u32_le();
    let command = cursor.get_u32_le();

    if size < HEADER_SIZE as u64 || size > MAX_PACKET_SIZE {
        return Err(NetError::MalformedPacket(format!(
            "implausible packet size {size}"
        )));
    }

    let body_len = (size as usize) - HEADER_SIZE;
    let mut body = vec![0u8; body_len];
    read.read_exact(&mut body).await?;

    Packet::decode(datatype, command, Bytes::from(body)).map(Some)
}

// ========================= Listener ========================= //

/// A listening endpoint accepting incoming [Connection]s
#[derive(Debug)]
pub enum Listener {
    /// TCP/IP listener
    Tcp(TcpListener),
    /// Local socket listener
    Local(UnixListener),
}

impl Listener {
    /// Bind a listener for the given description. For TCP, an explicit
    /// port of 0 picks an ephemeral port; query it with
    /// [Listener::local_description].
    pub async fn bind(description: &ConnectionDescription) -> NetResult<Self> {
        match description.kind {
            ConnectionKind::Tcpip => {
                let listener = TcpListener::bind(("0.0.0.0", description.port)).await?;
                Ok(Self::Tcp(listener))
            }
            ConnectionKind::Pipe => {
                let listener = UnixListener::bind(&description.hostname)?;
                Ok(Self::Local(listener))
            }
        }
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> NetResult<Connection> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Connection::Tcp(stream))
            }
            Self::Local(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::Local(stream))
            }
        }
    }

    /// A description other processes on this host can use to reach the
    /// listener
    pub fn local_description(&self, hostname: &str) -> NetResult<ConnectionDescription> {
        match self {
            Self::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(ConnectionDescription {
                    kind: ConnectionKind::Tcpip,
                    hostname: hostname.into(),
                    port: addr.port(),
                    ..Default::default()
                })
            }
            Self::Local(listener) => {
                let addr = listener.local_addr()?;
                let path = addr
                    .as_pathname()
                    .and_then(|p| p.to_str())
                    .unwrap_or_default();
                Ok(ConnectionDescription {
                    kind: ConnectionKind::Pipe,
                    hostname: path.into(),
                    ..Default::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NodePacket;
    use crate::NodeId;
    use crate::RequestId;

    #[tokio::test]
    async fn send_and_receive_over_pair() {
        let (mut a, mut b) = Connection::pair().unwrap();
        let packet = Packet::Node(NodePacket::Connect {
            node: NodeId(42),
            launch_request: RequestId::INVALID,
            descriptions: vec![ConnectionDescription::default()],
        });
        a.send_packet(&packet).await.unwrap();
        let received = b.recv_packet().await.unwrap().unwrap();
        assert_eq!(packet, received);
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (a, mut b) = Connection::pair().unwrap();
        drop(a);
        assert!(b.recv_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tcp_listener_accepts() {
        let description = ConnectionDescription {
            port: 0,
            ..Default::default()
        };
        let listener = Listener::bind(&description).await.unwrap();
        let local = listener.local_description("localhost").unwrap();

        let client = tokio::spawn(async move {
            let mut conn = Connection::connect(&local).await.unwrap();
            conn.send_packet(&Packet::Node(NodePacket::Stop))
                .await
                .unwrap();
        });

        let mut accepted = listener.accept().await.unwrap();
        let packet = accepted.recv_packet().await.unwrap().unwrap();
        assert_eq!(packet, Packet::Node(NodePacket::Stop));
        client.await.unwrap();
    }
}
