// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Sessions: naming scopes for distributed objects.
//!
//! A session is mastered on the node that created it (the session
//! server) and mapped by name or id on any other node. All objects of a
//! session are mastered on the session server; slaves subscribe by
//! object id and then receive versioned deltas.
//!
//! Packets addressed to an object that is not attached yet are parked on
//! a waiter list and re-dispatched when the object attaches; this is how
//! commands that race entity creation are handled without stalling the
//! receiver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use crate::barrier::{BarrierData, EnterOutcome};
use crate::error::NetError;
use crate::node::LocalNode;
use crate::object::{CommandSink, EntityCommand, Object, ObjectCore, Role, SharedObject};
use crate::packet::{ObjectPacket, Packet, SessionPacket};
use crate::requests::RequestValue;
use crate::{NetResult, NodeId, ObjectId, RequestId, SessionId, Version};

/// A mapped session
pub struct Session {
    id: SessionId,
    name: String,
    node: Weak<LocalNode>,
    server: NodeId,
    objects: DashMap<ObjectId, Arc<ObjectCore>>,
    next_object_id: AtomicU32,
    pending_objects: Mutex<HashMap<ObjectId, Vec<(NodeId, ObjectPacket)>>>,
    commands: Mutex<Option<CommandSink>>,
    pending_commands: Mutex<Vec<EntityCommand>>,
}

impl Session {
    pub(crate) fn new(
        node: &Arc<LocalNode>,
        id: SessionId,
        name: impl Into<String>,
        server: NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            node: Arc::downgrade(node),
            server,
            objects: DashMap::new(),
            next_object_id: AtomicU32::new(0),
            pending_objects: Mutex::new(HashMap::new()),
            commands: Mutex::new(None),
            pending_commands: Mutex::new(Vec::new()),
        })
    }

    /// The session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node mastering this session and all of its objects
    pub fn server_node(&self) -> NodeId {
        self.server
    }

    /// Is the local node the session server?
    pub fn is_master(&self) -> bool {
        self.node
            .upgrade()
            .map(|n| n.node_id() == self.server)
            .unwrap_or(false)
    }

    fn local_node(&self) -> NetResult<Arc<LocalNode>> {
        self.node.upgrade().ok_or(NetError::Closed)
    }

    /// The id of the node this session is mapped on
    pub fn local_node_id(&self) -> NetResult<NodeId> {
        Ok(self.local_node()?.node_id())
    }

    fn object(&self, id: ObjectId) -> Option<Arc<ObjectCore>> {
        self.objects.get(&id).map(|entry| entry.value().clone())
    }

    // ========================= Object lifecycle ========================= //

    /// Register a master instance, assigning the next free object id.
    /// Only valid on the session server.
    pub fn register_object<T: Object>(
        self: &Arc<Self>,
        object: &SharedObject<T>,
    ) -> NetResult<ObjectId> {
        if !self.is_master() {
            return Err(NetError::NoSuchSession(self.id));
        }
        let id = ObjectId(self.next_object_id.fetch_add(1, Ordering::Relaxed));
        self.attach_core(
            object.core.clone(),
            id,
            Role::Master { slaves: Vec::new() },
            None,
        );
        Ok(id)
    }

    /// Attach an instance under a known id without subscribing to the
    /// master, wiring custom commands to `sink`. Used by the render
    /// hierarchy for entities whose ids are assigned by the server.
    pub fn attach_object<T: Object>(
        self: &Arc<Self>,
        object: &SharedObject<T>,
        id: ObjectId,
        sink: Option<CommandSink>,
    ) {
        let role = if self.is_master() {
            Role::Master { slaves: Vec::new() }
        } else {
            Role::Slave
        };
        self.attach_core(object.core.clone(), id, role, sink);
    }

    /// Map a slave instance of an object mastered on the session server.
    /// On return the instance data snapshot has been applied and deltas
    /// are flowing.
    pub async fn map_object<T: Object>(
        self: &Arc<Self>,
        object: &SharedObject<T>,
        id: ObjectId,
        timeout: Duration,
    ) -> NetResult<()> {
        let node = self.local_node()?;
        // attach before subscribing so deltas right behind the snapshot
        // find the instance
        self.attach_core(object.core.clone(), id, Role::Slave, None);

        let request = node.requests().register();
        self.send_to_node(
            self.server,
            &Packet::Session {
                session: self.id,
                command: SessionPacket::SubscribeObject {
                    request,
                    object: id,
                    requester: node.node_id(),
                },
            },
        )?;
        match node.requests().wait_timeout(request, timeout).await {
            Ok(value) if value.is_success() => Ok(()),
            Ok(_) => {
                self.detach_object(id);
                Err(NetError::NoSuchObject(self.id, id))
            }
            Err(err) => {
                self.detach_object(id);
                Err(err)
            }
        }
    }

    /// Drop a slave instance and stop the master from sending deltas
    pub fn unmap_object(&self, id: ObjectId) -> NetResult<()> {
        let node = self.local_node()?;
        self.detach_object(id);
        if !self.is_master() {
            self.send_to_node(
                self.server,
                &Packet::Session {
                    session: self.id,
                    command: SessionPacket::UnsubscribeObject {
                        object: id,
                        node: node.node_id(),
                    },
                },
            )?;
        }
        Ok(())
    }

    /// Detach without notifying the master
    pub fn detach_object(&self, id: ObjectId) {
        if let Some((_, core)) = self.objects.remove(&id) {
            *core.id.lock().expect("object id lock poisoned") = ObjectId::INVALID;
            *core.role.lock().expect("object role lock poisoned") = Role::Unattached;
            *core.session.lock().expect("object session lock poisoned") = Weak::new();
            *core.commands.lock().expect("object command lock poisoned") = None;
        }
    }

    fn attach_core(
        self: &Arc<Self>,
        core: Arc<ObjectCore>,
        id: ObjectId,
        role: Role,
        sink: Option<CommandSink>,
    ) {
        {
            *core.id.lock().expect("object id lock poisoned") = id;
            *core.role.lock().expect("object role lock poisoned") = role;
            *core.session.lock().expect("object session lock poisoned") = Arc::downgrade(self);
            *core.commands.lock().expect("object command lock poisoned") = sink;
        }
        self.objects.insert(id, core);

        // wake packets parked on this object
        let parked = self
            .pending_objects
            .lock()
            .expect("pending object lock poisoned")
            .remove(&id);
        if let Some(parked) = parked {
            for (from, command) in parked {
                self.dispatch_object(from, id, command);
            }
        }
    }

    // ========================= Commands ========================= //

    /// Route session-level custom commands to `sink`, delivering any
    /// commands that arrived before the handler was installed
    pub fn set_command_handler(&self, sink: CommandSink) {
        let parked = {
            let mut handler = self.commands.lock().expect("session command lock poisoned");
            *handler = Some(sink.clone());
            std::mem::take(
                &mut *self
                    .pending_commands
                    .lock()
                    .expect("pending command lock poisoned"),
            )
        };
        for command in parked {
            let _ = sink.send(command);
        }
    }

    /// Route custom commands of an attached object to `sink`; packets
    /// parked on the object are not affected
    pub fn set_command_sink(&self, id: ObjectId, sink: CommandSink) -> bool {
        match self.object(id) {
            Some(core) => {
                *core.commands.lock().expect("object command lock poisoned") = Some(sink);
                true
            }
            None => false,
        }
    }

    /// Send a session-level custom command to a peer
    pub fn send_command(&self, to: NodeId, command: u32, body: Bytes) -> NetResult<()> {
        self.send_to_node(
            to,
            &Packet::Session {
                session: self.id,
                command: SessionPacket::Command { command, body },
            },
        )
    }

    /// Send an object-level custom command to a peer
    pub fn send_object_command(
        &self,
        to: NodeId,
        object: ObjectId,
        command: u32,
        body: Bytes,
    ) -> NetResult<()> {
        self.send_to_node(
            to,
            &Packet::Object {
                session: self.id,
                object,
                command: ObjectPacket::Command { command, body },
            },
        )
    }

    pub(crate) fn send_to_node(&self, to: NodeId, packet: &Packet) -> NetResult<()> {
        self.local_node()?.send_to(to, packet)
    }

    // ========================= Versioning ========================= //

    pub(crate) fn commit_object(self: &Arc<Self>, core: &Arc<ObjectCore>) -> NetResult<Version> {
        let id = *core.id.lock().expect("object id lock poisoned");
        if !id.is_valid() {
            return Err(NetError::NoSuchObject(self.id, id));
        }
        let slaves = match &*core.role.lock().expect("object role lock poisoned") {
            Role::Master { slaves } => slaves.clone(),
            _ => return Err(NetError::NoSuchObject(self.id, id)),
        };

        // data, version and delta transmission change together; the
        // write lock orders commits against subscription snapshots
        let version = {
            let guard = core.data.write().expect("object data lock poisoned");
            let delta = guard.pack_delta();
            let version = core.version().next();
            core.version_tx.send_replace(version);
            for slave in &slaves {
                let result = self.send_to_node(
                    *slave,
                    &Packet::Object {
                        session: self.id,
                        object: id,
                        command: ObjectPacket::Delta {
                            version,
                            data: delta.clone(),
                        },
                    },
                );
                if let Err(err) = result {
                    tracing::warn!("Dropping unreachable slave {slave} of object {id}: {err}");
                    self.remove_slave(core, *slave);
                }
            }
            version
        };

        // barrier commits may mature parked future entries
        self.settle_barrier(core, id);
        Ok(version)
    }

    pub(crate) async fn query_head_version(
        self: &Arc<Self>,
        core: &Arc<ObjectCore>,
        timeout: Duration,
    ) -> NetResult<Version> {
        if self.is_master() {
            return Ok(core.version());
        }
        let node = self.local_node()?;
        let id = *core.id.lock().expect("object id lock poisoned");
        let request = node.requests().register();
        self.send_to_node(
            self.server,
            &Packet::Object {
                session: self.id,
                object: id,
                command: ObjectPacket::Sync { request },
            },
        )?;
        match node.requests().wait_timeout(request, timeout).await? {
            RequestValue::Id(version) => Ok(Version(version)),
            other => Err(NetError::MalformedPacket(format!(
                "unexpected sync reply {other:?}"
            ))),
        }
    }

    fn remove_slave(&self, core: &Arc<ObjectCore>, node: NodeId) {
        if let Role::Master { slaves } = &mut *core.role.lock().expect("object role lock poisoned")
        {
            slaves.retain(|s| *s != node);
        }
    }

    // ========================= Dispatch ========================= //

    pub(crate) fn dispatch_session(self: &Arc<Self>, from: NodeId, command: SessionPacket) {
        match command {
            SessionPacket::SubscribeObject {
                request,
                object,
                requester,
            } => self.handle_subscribe(from, request, object, requester),
            SessionPacket::SubscribeObjectReply {
                request,
                object,
                result,
                version,
                data,
            } => self.handle_subscribe_reply(request, object, result, version, data),
            SessionPacket::UnsubscribeObject { object, node } => {
                if let Some(core) = self.object(object) {
                    self.remove_slave(&core, node);
                }
            }
            SessionPacket::Command { command, body } => {
                let entity = EntityCommand {
                    from,
                    object: ObjectId::INVALID,
                    command,
                    body,
                };
                let handler = self
                    .commands
                    .lock()
                    .expect("session command lock poisoned")
                    .clone();
                match handler {
                    Some(sink) => {
                        let _ = sink.send(entity);
                    }
                    None => self
                        .pending_commands
                        .lock()
                        .expect("pending command lock poisoned")
                        .push(entity),
                }
            }
        }
    }

    fn handle_subscribe(
        self: &Arc<Self>,
        from: NodeId,
        request: RequestId,
        object: ObjectId,
        requester: NodeId,
    ) {
        let reply = |result, version, data| Packet::Session {
            session: self.id,
            command: SessionPacket::SubscribeObjectReply {
                request,
                object,
                result,
                version,
                data,
            },
        };
        let Some(core) = self.object(object) else {
            tracing::warn!(
                "Subscribe for unknown object {object} in session {}",
                self.id
            );
            let _ = self.send_to_node(from, &reply(false, Version::NONE, Bytes::new()));
            return;
        };

        // snapshot and slave registration under the data lock, ordered
        // against concurrent commits
        let guard = core.data.write().expect("object data lock poisoned");
        if let Role::Master { slaves } = &mut *core.role.lock().expect("object role lock poisoned")
        {
            if !slaves.contains(&requester) {
                slaves.push(requester);
            }
        }
        let snapshot = guard.instance_data();
        let version = core.version();
        let _ = self.send_to_node(from, &reply(true, version, snapshot));
        drop(guard);
    }

    fn handle_subscribe_reply(
        self: &Arc<Self>,
        request: RequestId,
        object: ObjectId,
        result: bool,
        version: Version,
        data: Bytes,
    ) {
        let Ok(node) = self.local_node() else { return };
        if !result {
            node.requests().serve(request, RequestValue::Bool(false));
            return;
        }
        let Some(core) = self.object(object) else {
            // mapping was abandoned in the meantime
            node.requests().serve(request, RequestValue::Bool(false));
            return;
        };
        {
            let mut guard = core.data.write().expect("object data lock poisoned");
            if let Err(err) = guard.apply_instance(data) {
                tracing::warn!("Failed to apply instance data of object {object}: {err}");
                node.requests().serve(request, RequestValue::Bool(false));
                return;
            }
            core.version_tx.send_replace(version);
        }
        node.requests().serve(request, RequestValue::Bool(true));
    }

    pub(crate) fn dispatch_object(
        self: &Arc<Self>,
        from: NodeId,
        object: ObjectId,
        command: ObjectPacket,
    ) {
        let Some(core) = self.object(object) else {
            // park until the object attaches
            self.pending_objects
                .lock()
                .expect("pending object lock poisoned")
                .entry(object)
                .or_default()
                .push((from, command));
            return;
        };

        match command {
            ObjectPacket::Delta { version, data } => {
                let mut guard = core.data.write().expect("object data lock poisoned");
                let have = core.version();
                if version != have.next() {
                    tracing::error!(
                        "Version skew on object {object}: have {have}, received {version}"
                    );
                    return;
                }
                if let Err(err) = guard.apply_delta(data) {
                    tracing::error!("Failed to apply delta {version} of object {object}: {err}");
                    return;
                }
                core.version_tx.send_replace(version);
            }
            ObjectPacket::Sync { request } => {
                let _ = self.send_to_node(
                    from,
                    &Packet::Object {
                        session: self.id,
                        object,
                        command: ObjectPacket::SyncReply {
                            request,
                            version: core.version(),
                        },
                    },
                );
            }
            ObjectPacket::SyncReply { request, version } => {
                if let Ok(node) = self.local_node() {
                    node.requests().serve(request, RequestValue::Id(version.0));
                }
            }
            ObjectPacket::BarrierEnter { version, node } => {
                self.handle_barrier_enter(&core, object, node, version);
            }
            ObjectPacket::BarrierRelease { version } => {
                let guard = core.data.read().expect("object data lock poisoned");
                if let Some(barrier) = guard.as_any().downcast_ref::<BarrierData>() {
                    barrier.release(version);
                } else {
                    tracing::warn!("Barrier release for non-barrier object {object}");
                }
            }
            ObjectPacket::Command { command, body } => {
                let sink = core
                    .commands
                    .lock()
                    .expect("object command lock poisoned")
                    .clone();
                match sink {
                    Some(sink) => {
                        let _ = sink.send(EntityCommand {
                            from,
                            object,
                            command,
                            body,
                        });
                    }
                    None => {
                        self.pending_objects
                            .lock()
                            .expect("pending object lock poisoned")
                            .entry(object)
                            .or_default()
                            .push((from, ObjectPacket::Command { command, body }));
                    }
                }
            }
        }
    }

    fn handle_barrier_enter(
        self: &Arc<Self>,
        core: &Arc<ObjectCore>,
        object: ObjectId,
        node: NodeId,
        version: Version,
    ) {
        let outcome = {
            let mut guard = core.data.write().expect("object data lock poisoned");
            match guard.as_any_mut().downcast_mut::<BarrierData>() {
                Some(barrier) => barrier.enter_from(node, version),
                None => {
                    tracing::warn!("Barrier enter for non-barrier object {object}");
                    return;
                }
            }
        };
        self.apply_enter_outcome(object, outcome);
    }

    fn settle_barrier(self: &Arc<Self>, core: &Arc<ObjectCore>, object: ObjectId) {
        let outcome = {
            let mut guard = core.data.write().expect("object data lock poisoned");
            let current = core.version();
            match guard.as_any_mut().downcast_mut::<BarrierData>() {
                Some(barrier) => barrier.open_cycle(current),
                None => return,
            }
        };
        self.apply_enter_outcome(object, outcome);
    }

    fn apply_enter_outcome(self: &Arc<Self>, object: ObjectId, outcome: EnterOutcome) {
        match outcome {
            EnterOutcome::Pending => {}
            EnterOutcome::Release { version, nodes } => {
                for node in nodes {
                    let _ = self.send_to_node(
                        node,
                        &Packet::Object {
                            session: self.id,
                            object,
                            command: ObjectPacket::BarrierRelease { version },
                        },
                    );
                }
            }
        }
    }

    // ========================= Failure ========================= //

    /// A peer went away: forget its slave subscriptions and any barrier
    /// entries it holds
    pub(crate) fn handle_disconnect(self: &Arc<Self>, node: NodeId) {
        for entry in self.objects.iter() {
            let core = entry.value().clone();
            self.remove_slave(&core, node);
            let mut guard = core.data.write().expect("object data lock poisoned");
            if let Some(barrier) = guard.as_any_mut().downcast_mut::<BarrierData>() {
                barrier.forget(node);
            }
        }
    }
}
