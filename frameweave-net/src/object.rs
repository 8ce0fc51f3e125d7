// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Versioned distributed objects.
//!
//! An [Object] is a piece of application state replicated across the
//! cluster. The registering node holds the *master* instance; other
//! nodes *map* the object by id and receive an instance-data snapshot
//! followed by versioned deltas. Slaves observe versions 1,2,3,...
//! strictly monotonically and may block until a required version has
//! arrived.
//!
//! Objects are held through [SharedObject] handles: cheap to clone,
//! internally locked, attached to at most one [crate::session::Session]
//! at a time.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::NetError;
use crate::session::Session;
use crate::{NetResult, NodeId, ObjectId, Version};

/// Replicated state with versioned updates.
///
/// `pack_delta`/`apply_delta` default to shipping the full instance
/// data; objects with cheap incremental encodings override them.
pub trait Object: Send + Sync + 'static {
    /// Snapshot the full instance data
    fn instance_data(&self) -> Bytes;

    /// Replace local state from an instance data snapshot
    fn apply_instance(&mut self, data: Bytes) -> NetResult<()>;

    /// Pack the changes since the last commit
    fn pack_delta(&self) -> Bytes {
        self.instance_data()
    }

    /// Apply a delta received from the master
    fn apply_delta(&mut self, data: Bytes) -> NetResult<()> {
        self.apply_instance(data)
    }
}

/// Object-safe shim adding downcasting on top of [Object]
pub(crate) trait AnyObject: Object {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Object> AnyObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Distribution role of an attached object
#[derive(Debug)]
pub(crate) enum Role {
    /// Not attached to a session
    Unattached,
    /// Authoritative instance; knows its slave nodes
    Master { slaves: Vec<NodeId> },
    /// Replica receiving deltas from the master
    Slave,
}

/// A custom command delivered to the entity owning an object
#[derive(Debug)]
pub struct EntityCommand {
    /// The node the command came from
    pub from: NodeId,
    /// The addressed object, [ObjectId::INVALID] for session-level
    /// commands
    pub object: ObjectId,
    /// The command value (`>=` [crate::packet::CUSTOM_COMMAND_BASE])
    pub command: u32,
    /// Opaque command body
    pub body: Bytes,
}

/// Queue onto which custom commands for an object are dispatched
pub type CommandSink = mpsc::UnboundedSender<EntityCommand>;

pub(crate) struct ObjectCore {
    pub(crate) id: Mutex<ObjectId>,
    pub(crate) data: RwLock<Box<dyn AnyObject>>,
    pub(crate) role: Mutex<Role>,
    pub(crate) version_tx: watch::Sender<Version>,
    pub(crate) session: Mutex<Weak<Session>>,
    pub(crate) commands: Mutex<Option<CommandSink>>,
}

impl ObjectCore {
    pub(crate) fn version(&self) -> Version {
        *self.version_tx.borrow()
    }
}

/// Cloneable, internally synchronised handle to a distributed object
pub struct SharedObject<T: Object> {
    pub(crate) core: Arc<ObjectCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Object> Clone for SharedObject<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Object> SharedObject<T> {
    /// Wrap an object instance; it starts unattached at [Version::NONE]
    pub fn new(object: T) -> Self {
        let (version_tx, _) = watch::channel(Version::NONE);
        Self {
            core: Arc::new(ObjectCore {
                id: Mutex::new(ObjectId::INVALID),
                data: RwLock::new(Box::new(object)),
                role: Mutex::new(Role::Unattached),
                version_tx,
                session: Mutex::new(Weak::new()),
                commands: Mutex::new(None),
            }),
            _marker: PhantomData,
        }
    }

    /// The id assigned at registration or mapping time
    pub fn id(&self) -> ObjectId {
        *self.core.id.lock().expect("object id lock poisoned")
    }

    /// The locally known version
    pub fn version(&self) -> Version {
        self.core.version()
    }

    /// Read access to the instance
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.core.data.read().expect("object data lock poisoned");
        let object = guard
            .as_any()
            .downcast_ref::<T>()
            .expect("object type mismatch");
        f(object)
    }

    /// Write access to the instance. Mutations become visible to other
    /// nodes only through [SharedObject::commit].
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.core.data.write().expect("object data lock poisoned");
        let object = guard
            .as_any_mut()
            .downcast_mut::<T>()
            .expect("object type mismatch");
        f(object)
    }

    /// A watch over the locally known version
    pub fn subscribe_version(&self) -> watch::Receiver<Version> {
        self.core.version_tx.subscribe()
    }

    /// Block until the local version is at least `version`
    pub async fn wait_for_version(&self, version: Version) -> NetResult<Version> {
        let mut rx = self.core.version_tx.subscribe();
        let reached = rx
            .wait_for(|v| *v >= version)
            .await
            .map_err(|_| NetError::Closed)?;
        Ok(*reached)
    }

    /// Like [SharedObject::wait_for_version] with a deadline
    pub async fn wait_for_version_timeout(
        &self,
        version: Version,
        timeout: Duration,
    ) -> NetResult<Version> {
        tokio::time::timeout(timeout, self.wait_for_version(version))
            .await
            .map_err(|_| NetError::Timeout)?
    }

    /// Commit a new version on the master instance and broadcast the
    /// delta to all slaves. Returns the committed version.
    pub fn commit(&self) -> NetResult<Version> {
        let session = self.session()?;
        session.commit_object(&self.core)
    }

    /// Ask the master for its head version, then block until the local
    /// replica has caught up to it
    pub async fn sync_to_head(&self, timeout: Duration) -> NetResult<Version> {
        let session = self.session()?;
        let head = session.query_head_version(&self.core, timeout).await?;
        self.wait_for_version_timeout(head, timeout).await
    }

    fn session(&self) -> NetResult<Arc<Session>> {
        self.core
            .session
            .lock()
            .expect("object session lock poisoned")
            .upgrade()
            .ok_or(NetError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BufMut, BytesMut};

    struct Counter(u64);

    impl Object for Counter {
        fn instance_data(&self) -> Bytes {
            let mut buf = BytesMut::with_capacity(8);
            buf.put_u64_le(self.0);
            buf.freeze()
        }
        fn apply_instance(&mut self, mut data: Bytes) -> NetResult<()> {
            if data.remaining() < 8 {
                return Err(NetError::MalformedPacket("short counter data".into()));
            }
            self.0 = data.get_u64_le();
            Ok(())
        }
    }

    #[tokio::test]
    async fn unattached_object_is_local() {
        let object = SharedObject::new(Counter(7));
        assert_eq!(object.id(), ObjectId::INVALID);
        assert_eq!(object.version(), Version::NONE);
        object.with_mut(|c| c.0 = 8);
        assert_eq!(object.with(|c| c.0), 8);
        assert!(object.commit().is_err());
    }

    #[tokio::test]
    async fn wait_for_version_observes_watch() {
        let object = SharedObject::new(Counter(0));
        let tx = object.core.version_tx.clone();
        let waiter = {
            let object = object.clone();
            tokio::spawn(async move { object.wait_for_version(Version(3)).await })
        };
        for v in 1..=3 {
            tx.send(Version(v)).unwrap();
        }
        assert_eq!(waiter.await.unwrap().unwrap(), Version(3));
    }
}
