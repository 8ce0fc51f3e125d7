// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Cluster nodes.
//!
//! A [LocalNode] is this process's presence in the cluster: it listens
//! for peers, runs the receiver task and owns the peer, session and
//! request registries. Remote processes are tracked as [Peer]s.
//!
//! ## Receiver
//!
//! One receiver task per process drains the node's
//! [crate::connection_set::ConnectionSet]: incoming connections get the
//! reply side of the connect handshake, closed connections trigger
//! disconnect handling, and data packets are dispatched in arrival
//! order. Dispatch routes by addressing: session packets to the mapped
//! session, object packets to the attached object, everything else to
//! the node command table. No user callback runs on the receiver; custom
//! commands are forwarded onto entity command queues.
//!
//! ## Connecting
//!
//! [LocalNode::connect_peer] performs the symmetric connect handshake:
//! each side transmits its node id plus connection descriptions and
//! records the peer. [LocalNode::init_connect]/[LocalNode::sync_connect]
//! split this into an asynchronous start and a later join so many peers
//! can be connected (and auto-launched) in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionDescription, ConnectionKind, Listener};
use crate::connection_set::{ConnectionId, ConnectionSet, Event, Select, SetHandle};
use crate::error::NetError;
use crate::launch::{self, LaunchParams};
use crate::packet::{self, NodePacket, Packet};
use crate::requests::{RequestCache, RequestValue};
use crate::session::Session;
use crate::{NetResult, NodeId, RequestId, SessionId};

/// How long a connect handshake may take end to end
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback pseudo-connection for packets a node sends to itself
const LOOPBACK: ConnectionId = ConnectionId(0);

/// State of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Initial and final state
    Stopped,
    /// The receiver task runs and the listener accepts peers
    Listening,
}

/// State of a remote peer
#[derive(Debug)]
enum PeerState {
    Stopped,
    Connected(ConnectionId),
}

/// A remote node, reachable through an established connection
#[derive(Debug)]
pub struct Peer {
    id: NodeId,
    state: Mutex<PeerState>,
    descriptions: RwLock<Vec<ConnectionDescription>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl Peer {
    /// The peer's node id
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// Is the connection to this peer up?
    pub fn is_connected(&self) -> bool {
        matches!(
            *self.state.lock().expect("peer state lock poisoned"),
            PeerState::Connected(_)
        )
    }

    /// The descriptions this peer announced during the handshake
    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        self.descriptions
            .read()
            .expect("peer descriptions lock poisoned")
            .clone()
    }

    /// Send one packet to this peer. The transmission is all-or-nothing;
    /// a failure here or in the writer task closes the connection.
    pub fn send(&self, packet: &Packet) -> NetResult<()> {
        let tx = self.tx.lock().expect("peer sender lock poisoned").clone();
        match tx {
            Some(tx) => tx.send(packet.encode()).map_err(|_| NetError::Closed),
            None => Err(NetError::Closed),
        }
    }

    /// Mark disconnected if `conn` is still the connection in use;
    /// a peer that reconnected on a newer connection is left alone
    fn mark_disconnected(&self, conn: ConnectionId) -> bool {
        let mut state = self.state.lock().expect("peer state lock poisoned");
        match *state {
            PeerState::Connected(current) if current == conn => {
                *state = PeerState::Stopped;
                *self.tx.lock().expect("peer sender lock poisoned") = None;
                true
            }
            _ => false,
        }
    }
}

/// An asynchronous connect started by [LocalNode::init_connect]
#[derive(Debug)]
pub struct PendingConnect {
    request: RequestId,
    timeout: Duration,
}

/// Options for [LocalNode::listen]
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// The listener to bind; `port: 0` picks an ephemeral port
    pub description: ConnectionDescription,
    /// The name other hosts can reach this process under, substituted
    /// into outgoing connection descriptions
    pub hostname: String,
    /// Program name used when launching peers (`%n`)
    pub program: String,
    /// Working directory used when launching peers (`%w`)
    pub workdir: String,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            description: ConnectionDescription {
                port: 0,
                ..Default::default()
            },
            hostname: "localhost".into(),
            program: std::env::args().next().unwrap_or_else(|| "frameweave".into()),
            workdir: ".".into(),
        }
    }
}

/// This process's node
pub struct LocalNode {
    id: NodeId,
    options: ListenOptions,
    listener_description: ConnectionDescription,
    state: Mutex<NodeState>,
    set: SetHandle,
    peers: DashMap<NodeId, Arc<Peer>>,
    conn_nodes: DashMap<ConnectionId, NodeId>,
    sessions: DashMap<SessionId, Arc<Session>>,
    session_names: DashMap<String, SessionId>,
    next_session_id: AtomicU32,
    pending_session_packets: Mutex<HashMap<SessionId, Vec<(NodeId, Packet)>>>,
    requests: RequestCache,
    disconnects: broadcast::Sender<NodeId>,
    stopped: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalNode {
    /// Bind the listener, start the receiver task and transition to
    /// [NodeState::Listening]
    pub async fn listen(options: ListenOptions) -> NetResult<Arc<Self>> {
        let listener = Listener::bind(&options.description).await?;
        let listener_description = listener.local_description(&options.hostname)?;

        let set = ConnectionSet::new();
        let handle = set.handle();
        let (stopped, _) = watch::channel(false);
        let (disconnects, _) = broadcast::channel(64);

        let node = Arc::new(Self {
            id: NodeId::generate(),
            options,
            listener_description,
            state: Mutex::new(NodeState::Listening),
            set: handle.clone(),
            peers: DashMap::new(),
            conn_nodes: DashMap::new(),
            sessions: DashMap::new(),
            session_names: DashMap::new(),
            next_session_id: AtomicU32::new(1),
            pending_session_packets: Mutex::new(HashMap::new()),
            requests: RequestCache::new(),
            disconnects,
            stopped,
            tasks: Mutex::new(Vec::new()),
        });

        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => handle.push(Event::Incoming(conn)),
                    Err(err) => {
                        tracing::warn!("Listener accept failed: {err}");
                        break;
                    }
                }
            }
        });

        // the receiver task is deliberately not tracked in `tasks`: it
        // aborts those at shutdown and must outlive the abort pass
        {
            let node = node.clone();
            tokio::spawn(async move { node.run_receiver(set).await });
        }

        node.tasks
            .lock()
            .expect("task registry poisoned")
            .push(accept);

        tracing::info!(
            "Node {} listening on {}",
            node.id,
            node.listener_description
        );
        Ok(node)
    }

    /// This node's id
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// The state of this node
    pub fn state(&self) -> NodeState {
        *self.state.lock().expect("node state lock poisoned")
    }

    /// A description peers can use to reach this node
    pub fn listener_description(&self) -> ConnectionDescription {
        self.listener_description.clone()
    }

    /// The request cache shared by all split-phase operations of this
    /// node
    pub fn requests(&self) -> &RequestCache {
        &self.requests
    }

    /// Subscribe to peer-disconnect notifications
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<NodeId> {
        self.disconnects.subscribe()
    }

    /// Look up a known peer
    pub fn peer(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    /// Every peer whose connection is currently up, in no particular
    /// order
    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|peer| peer.is_connected())
            .collect()
    }

    /// Look up a mapped session
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    // ========================= Messaging ========================= //

    /// Send a packet to a node, looping back through the receiver when
    /// the target is this node itself
    pub fn send_to(&self, node: NodeId, packet: &Packet) -> NetResult<()> {
        if node == self.id {
            self.set.push(Event::Data {
                from: LOOPBACK,
                packet: packet.clone(),
            });
            return Ok(());
        }
        self.peer(node).ok_or(NetError::Unreachable(node))?.send(packet)
    }

    // ========================= Connecting ========================= //

    /// Connect to a peer using the first reachable description
    pub async fn connect_peer(
        self: &Arc<Self>,
        descriptions: Vec<ConnectionDescription>,
    ) -> NetResult<Arc<Peer>> {
        for description in &descriptions {
            match Connection::connect(description).await {
                Ok(conn) => return self.connect_with(conn, RequestId::INVALID).await,
                Err(err) => {
                    tracing::debug!("Connect to {description} failed: {err}");
                }
            }
        }
        Err(NetError::Unreachable(NodeId::ZERO))
    }

    /// Start connecting (and potentially launching) a peer. The result
    /// is collected with [LocalNode::sync_connect], allowing many peers
    /// to be brought up in parallel.
    pub fn init_connect(
        self: &Arc<Self>,
        descriptions: Vec<ConnectionDescription>,
        auto_launch: bool,
    ) -> PendingConnect {
        let request = self.requests.register();
        let timeout = descriptions
            .first()
            .map(|d| d.launch_timeout)
            .unwrap_or(HANDSHAKE_TIMEOUT);
        let node = self.clone();
        let task = tokio::spawn(async move {
            for description in &descriptions {
                let conn = match Connection::connect(description).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::debug!("Connect to {description} failed: {err}");
                        continue;
                    }
                };
                match node.connect_with(conn, RequestId::INVALID).await {
                    Ok(peer) => {
                        node.requests.serve(request, RequestValue::Node(peer.node_id()));
                        return;
                    }
                    Err(err) => {
                        tracing::debug!("Handshake with {description} failed: {err}");
                    }
                }
            }

            if !auto_launch {
                node.requests.serve_error(request, "peer is unreachable");
                return;
            }
            let Some(description) = descriptions
                .iter()
                .find(|d| !d.launch_command.is_empty())
            else {
                node.requests
                    .serve_error(request, "peer is unreachable and has no launch command");
                return;
            };

            // the launched process resolves `request` by connecting back
            let params = LaunchParams {
                program: node.options.program.clone(),
                workdir: node.options.workdir.clone(),
                client_args: launch::format_client_args(
                    &node.listener_description.address(),
                    request,
                ),
            };
            if let Err(err) = launch::launch(description, &params) {
                node.requests
                    .serve_error(request, format!("launch failed: {err}"));
            }
        });
        self.tasks.lock().expect("task registry poisoned").push(task);
        PendingConnect { request, timeout }
    }

    /// Join a connect started with [LocalNode::init_connect]
    pub async fn sync_connect(&self, pending: PendingConnect) -> NetResult<Arc<Peer>> {
        match self
            .requests
            .wait_timeout(pending.request, pending.timeout)
            .await
        {
            Ok(RequestValue::Node(id)) => self.peer(id).ok_or(NetError::Unreachable(id)),
            Ok(other) => Err(NetError::MalformedPacket(format!(
                "unexpected connect result {other:?}"
            ))),
            Err(NetError::Timeout) => Err(NetError::LaunchTimeout(NodeId::ZERO)),
            Err(err) => Err(err),
        }
    }

    /// Connect and launch in one step
    pub async fn connect_or_launch(
        self: &Arc<Self>,
        descriptions: Vec<ConnectionDescription>,
    ) -> NetResult<Arc<Peer>> {
        let pending = self.init_connect(descriptions, true);
        self.sync_connect(pending).await
    }

    /// Dial back to a launching parent. `client_args` is the string the
    /// parent passed on the command line: `listenerAddress#requestID`.
    pub async fn connect_back(self: &Arc<Self>, client_args: &str) -> NetResult<Arc<Peer>> {
        let (address, request) = launch::parse_client_args(client_args)?;
        let description = description_for_address(&address);
        let conn = Connection::connect(&description).await?;
        self.connect_with(conn, request).await
    }

    /// Connect to a node known only by id, resolving its connection
    /// descriptions through an already-connected peer
    pub async fn connect_node(self: &Arc<Self>, via: NodeId, node: NodeId) -> NetResult<Arc<Peer>> {
        if let Some(peer) = self.peer(node) {
            if peer.is_connected() {
                return Ok(peer);
            }
        }
        let request = self.requests.register();
        self.send_to(
            via,
            &Packet::Node(NodePacket::GetConnectionDescription { request, node }),
        )?;
        let value = self.requests.wait_timeout(request, HANDSHAKE_TIMEOUT).await?;
        let descriptions = match value {
            RequestValue::Bytes(mut raw) => packet::take_descriptions(&mut raw)?,
            other => {
                return Err(NetError::MalformedPacket(format!(
                    "unexpected description reply {other:?}"
                )))
            }
        };
        if descriptions.is_empty() {
            return Err(NetError::Unreachable(node));
        }
        self.connect_peer(descriptions).await
    }

    async fn connect_with(
        self: &Arc<Self>,
        mut conn: Connection,
        launch_request: RequestId,
    ) -> NetResult<Arc<Peer>> {
        conn.send_packet(&Packet::Node(NodePacket::Connect {
            node: self.id,
            launch_request,
            descriptions: vec![self.listener_description()],
        }))
        .await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv_packet())
            .await
            .map_err(|_| NetError::HandshakeFailed("no reply before timeout".into()))??
            .ok_or_else(|| NetError::HandshakeFailed("peer closed during handshake".into()))?;

        match reply {
            Packet::Node(NodePacket::ConnectReply { node, descriptions }) => {
                Ok(self.register_connected(node, descriptions, conn))
            }
            other => Err(NetError::HandshakeFailed(format!(
                "unexpected handshake reply {:?}",
                other.datatype_command()
            ))),
        }
    }

    async fn handle_incoming(self: &Arc<Self>, mut conn: Connection) -> NetResult<()> {
        let packet = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv_packet())
            .await
            .map_err(|_| NetError::HandshakeFailed("no connect packet before timeout".into()))??
            .ok_or_else(|| NetError::HandshakeFailed("peer closed during handshake".into()))?;

        let Packet::Node(NodePacket::Connect {
            node,
            launch_request,
            descriptions,
        }) = packet
        else {
            return Err(NetError::HandshakeFailed(
                "peer did not start with a connect packet".into(),
            ));
        };

        conn.send_packet(&Packet::Node(NodePacket::ConnectReply {
            node: self.id,
            descriptions: vec![self.listener_description()],
        }))
        .await?;

        self.register_connected(node, descriptions, conn);
        if launch_request.is_valid() {
            // resolve the parent's outstanding init_connect
            self.requests.serve(launch_request, RequestValue::Node(node));
        }
        Ok(())
    }

    fn register_connected(
        self: &Arc<Self>,
        node: NodeId,
        descriptions: Vec<ConnectionDescription>,
        conn: Connection,
    ) -> Arc<Peer> {
        if let Some(existing) = self.peer(node) {
            if existing.is_connected() {
                tracing::warn!("Duplicate connection from {node}, keeping the established one");
                return existing;
            }
        }

        let (reader, mut writer) = conn.into_split();
        let conn_id = self.set.add(reader);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = writer.send_frame(&frame).await {
                    tracing::warn!("Write failed, closing connection: {err}");
                    break;
                }
            }
        });
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .push(writer_task);

        let peer = Arc::new(Peer {
            id: node,
            state: Mutex::new(PeerState::Connected(conn_id)),
            descriptions: RwLock::new(descriptions),
            tx: Mutex::new(Some(tx)),
        });
        self.peers.insert(node, peer.clone());
        self.conn_nodes.insert(conn_id, node);
        tracing::info!("Node {node} connected");
        peer
    }

    // ========================= Sessions ========================= //

    /// Create (or look up) a session mastered on this node
    pub fn new_session(self: &Arc<Self>, name: &str) -> Arc<Session> {
        if let Some(id) = self.session_names.get(name) {
            if let Some(session) = self.session(*id) {
                return session;
            }
        }
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(self, id, name, self.id);
        self.sessions.insert(id, session.clone());
        self.session_names.insert(name.to_string(), id);
        tracing::info!("Created session '{name}' as {id}");
        session
    }

    /// Map a session served by `server`, resolving (and allocating) the
    /// id by name
    pub async fn map_session(
        self: &Arc<Self>,
        server: &Arc<Peer>,
        name: &str,
    ) -> NetResult<Arc<Session>> {
        let request = self.requests.register();
        server.send(&Packet::Node(NodePacket::MapSession {
            request,
            session: SessionId::INVALID,
            name: name.to_string(),
        }))?;
        let value = self.requests.wait_timeout(request, HANDSHAKE_TIMEOUT).await?;
        let id = match value {
            RequestValue::Id(raw) => SessionId(raw),
            other => {
                return Err(NetError::MalformedPacket(format!(
                    "unexpected map session reply {other:?}"
                )))
            }
        };
        if !id.is_valid() {
            return Err(NetError::NoSuchSession(id));
        }

        let session = Session::new(self, id, name, server.node_id());
        self.sessions.insert(id, session.clone());
        self.drain_pending_session(id);
        Ok(session)
    }

    /// Unmap a mapped session on this node and notify its server
    pub async fn unmap_session(self: &Arc<Self>, session: &Arc<Session>) -> NetResult<bool> {
        let id = session.id();
        self.sessions.remove(&id);
        if session.is_master() {
            self.session_names.retain(|_, v| *v != id);
            return Ok(true);
        }
        let request = self.requests.register();
        self.send_to(
            session.server_node(),
            &Packet::Node(NodePacket::UnmapSession {
                request,
                session: id,
            }),
        )?;
        match self.requests.wait_timeout(request, HANDSHAKE_TIMEOUT).await? {
            RequestValue::Bool(result) => Ok(result),
            other => Err(NetError::MalformedPacket(format!(
                "unexpected unmap session reply {other:?}"
            ))),
        }
    }

    fn drain_pending_session(self: &Arc<Self>, id: SessionId) {
        let parked = self
            .pending_session_packets
            .lock()
            .expect("pending session lock poisoned")
            .remove(&id);
        if let Some(parked) = parked {
            for (from, packet) in parked {
                self.dispatch_packet(from, packet);
            }
        }
    }

    // ========================= Shutdown ========================= //

    /// Stop the receiver loop; pending requests are failed
    pub fn stop(&self) {
        let _ = self.send_to(self.id, &Packet::Node(NodePacket::Stop));
    }

    /// Wait for the receiver loop to exit
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    // ========================= Receiver ========================= //

    async fn run_receiver(self: Arc<Self>, mut set: ConnectionSet) {
        loop {
            match set.select(None).await {
                Select::Event(Event::Incoming(conn)) => {
                    if let Err(err) = self.handle_incoming(conn).await {
                        tracing::warn!("Rejected incoming connection: {err}");
                    }
                }
                Select::Event(Event::Data { from, packet }) => {
                    let sender = if from == LOOPBACK {
                        Some(self.id)
                    } else {
                        self.conn_nodes.get(&from).map(|entry| *entry.value())
                    };
                    let Some(sender) = sender else {
                        tracing::warn!("Packet from unknown connection {from}, dropping");
                        continue;
                    };
                    if self.dispatch_packet(sender, packet) {
                        break;
                    }
                }
                Select::Event(Event::Closed { from }) => self.handle_closed(from),
                Select::Event(Event::Interrupt) => {
                    if *self.stopped.borrow() {
                        break;
                    }
                }
                Select::Timeout => {}
            }
        }

        *self.state.lock().expect("node state lock poisoned") = NodeState::Stopped;
        self.requests.fail_all("node stopped");
        for task in self.tasks.lock().expect("task registry poisoned").drain(..) {
            task.abort();
        }
        let _ = self.stopped.send(true);
        tracing::info!("Node {} stopped", self.id);
    }

    /// Returns `true` when the receiver loop should stop
    fn dispatch_packet(self: &Arc<Self>, from: NodeId, packet: Packet) -> bool {
        match packet {
            Packet::Node(command) => return self.handle_node_packet(from, command),
            Packet::Session { session, command } => match self.session(session) {
                Some(mapped) => mapped.dispatch_session(from, command),
                None => self.park_session_packet(from, Packet::Session { session, command }),
            },
            Packet::Object {
                session,
                object,
                command,
            } => match self.session(session) {
                Some(mapped) => mapped.dispatch_object(from, object, command),
                None => self.park_session_packet(
                    from,
                    Packet::Object {
                        session,
                        object,
                        command,
                    },
                ),
            },
        }
        false
    }

    fn park_session_packet(self: &Arc<Self>, from: NodeId, packet: Packet) {
        let session = match &packet {
            Packet::Session { session, .. } | Packet::Object { session, .. } => *session,
            Packet::Node(_) => return,
        };
        tracing::debug!("Parking packet for unmapped session {session}");
        self.pending_session_packets
            .lock()
            .expect("pending session lock poisoned")
            .entry(session)
            .or_default()
            .push((from, packet));
    }

    fn handle_node_packet(self: &Arc<Self>, from: NodeId, command: NodePacket) -> bool {
        match command {
            NodePacket::Stop => {
                let _ = self.stopped.send(true);
                return true;
            }
            NodePacket::Connect { .. } | NodePacket::ConnectReply { .. } => {
                tracing::warn!("Connect packet outside the handshake phase from {from}");
            }
            NodePacket::MapSession {
                request,
                session,
                name,
            } => {
                let resolved = if session.is_valid() {
                    if self.sessions.contains_key(&session) {
                        session
                    } else {
                        SessionId::INVALID
                    }
                } else {
                    self.new_session(&name).id()
                };
                let reply = Packet::Node(NodePacket::MapSessionReply {
                    request,
                    session: resolved,
                    name,
                });
                if let Err(err) = self.send_to(from, &reply) {
                    tracing::warn!("Failed to reply to map session from {from}: {err}");
                }
            }
            NodePacket::MapSessionReply {
                request, session, ..
            } => {
                self.requests.serve(request, RequestValue::Id(session.0));
            }
            NodePacket::UnmapSession { request, session } => {
                let result = self.sessions.contains_key(&session);
                let reply = Packet::Node(NodePacket::UnmapSessionReply { request, result });
                if let Err(err) = self.send_to(from, &reply) {
                    tracing::warn!("Failed to reply to unmap session from {from}: {err}");
                }
            }
            NodePacket::UnmapSessionReply { request, result } => {
                self.requests.serve(request, RequestValue::Bool(result));
            }
            NodePacket::GetConnectionDescription { request, node } => {
                let descriptions = if node == self.id {
                    vec![self.listener_description()]
                } else {
                    self.peer(node)
                        .map(|peer| peer.descriptions())
                        .unwrap_or_default()
                };
                let reply = Packet::Node(NodePacket::GetConnectionDescriptionReply {
                    request,
                    node,
                    descriptions,
                });
                if let Err(err) = self.send_to(from, &reply) {
                    tracing::warn!("Failed to reply to description lookup from {from}: {err}");
                }
            }
            NodePacket::GetConnectionDescriptionReply {
                request,
                descriptions,
                ..
            } => {
                let mut buf = bytes::BytesMut::new();
                packet::put_descriptions(&mut buf, &descriptions);
                self.requests
                    .serve(request, RequestValue::Bytes(buf.freeze()));
            }
        }
        false
    }

    fn handle_closed(self: &Arc<Self>, conn: ConnectionId) {
        let Some((_, node)) = self.conn_nodes.remove(&conn) else {
            return;
        };
        if let Some(peer) = self.peer(node) {
            if !peer.mark_disconnected(conn) {
                // the peer already moved to a newer connection
                return;
            }
        }
        tracing::warn!("Node {node} disconnected");
        for session in self.sessions.iter() {
            session.value().clone().handle_disconnect(node);
        }
        let _ = self.disconnects.send(node);
    }
}

fn description_for_address(address: &str) -> ConnectionDescription {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => ConnectionDescription {
                kind: ConnectionKind::Tcpip,
                hostname: host.to_string(),
                port,
                ..Default::default()
            },
            Err(_) => ConnectionDescription {
                kind: ConnectionKind::Pipe,
                hostname: address.to_string(),
                ..Default::default()
            },
        },
        None => ConnectionDescription {
            kind: ConnectionKind::Pipe,
            hostname: address.to_string(),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests;
