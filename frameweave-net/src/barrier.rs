// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! N-party cluster barriers.
//!
//! A [Barrier] is a distributed object whose instance data is its
//! participant count. Each commit opens a new *cycle* at the committed
//! version; participants enter a specific cycle and block until all
//! participants of that cycle arrived. With latency-pipelined frames
//! several cycles can be outstanding at once, so the master keeps one
//! entry bucket per version and releases each bucket independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::watch;

use crate::error::NetError;
use crate::object::{Object, SharedObject};
use crate::packet::{ObjectPacket, Packet};
use crate::session::Session;
use crate::{NetResult, NodeId, ObjectId, Version};

/// Cycles older than this many versions behind the newest commit are
/// abandoned; they can only stem from failed frames.
const STALE_CYCLES: u32 = 8;

/// Result of feeding an enter (or a commit) into the master's state
#[derive(Debug)]
pub(crate) enum EnterOutcome {
    /// More participants outstanding
    Pending,
    /// A cycle completed; notify its participants
    Release {
        /// The completed cycle
        version: Version,
        /// The nodes to notify, one entry per enter received
        nodes: Vec<NodeId>,
    },
}

#[derive(Debug, Default)]
struct Cycle {
    /// Participant count, 0 until the cycle's commit arrived
    required: u32,
    entered: Vec<NodeId>,
}

/// Master and slave state of a barrier instance
pub(crate) struct BarrierData {
    height: u32,
    cycles: HashMap<Version, Cycle>,
    released_tx: watch::Sender<Version>,
}

impl BarrierData {
    fn new(height: u32) -> Self {
        let (released_tx, _) = watch::channel(Version::NONE);
        Self {
            height,
            cycles: HashMap::new(),
            released_tx,
        }
    }

    fn released(&self) -> watch::Receiver<Version> {
        self.released_tx.subscribe()
    }

    /// Record an enter for a cycle on the master. Entries may precede
    /// the commit that opens the cycle; they park until it arrives.
    pub(crate) fn enter_from(&mut self, node: NodeId, version: Version) -> EnterOutcome {
        let cycle = self.cycles.entry(version).or_default();
        cycle.entered.push(node);
        self.check(version)
    }

    /// A commit opened cycle `version` at the current participant
    /// count
    pub(crate) fn open_cycle(&mut self, version: Version) -> EnterOutcome {
        let height = self.height;
        let cycle = self.cycles.entry(version).or_default();
        cycle.required = height;
        self.cycles
            .retain(|v, _| v.0 + STALE_CYCLES > version.0);
        self.check(version)
    }

    fn check(&mut self, version: Version) -> EnterOutcome {
        let full = self
            .cycles
            .get(&version)
            .map(|c| c.required > 0 && c.entered.len() >= c.required as usize)
            .unwrap_or(false);
        if !full {
            return EnterOutcome::Pending;
        }
        let cycle = self.cycles.remove(&version).unwrap_or_default();
        if cycle.entered.len() > cycle.required as usize {
            tracing::warn!(
                "Barrier cycle {version} saw {} entries for {} participants",
                cycle.entered.len(),
                cycle.required
            );
        }
        EnterOutcome::Release {
            version,
            nodes: cycle.entered,
        }
    }

    /// A release arrived (or was produced locally)
    pub(crate) fn release(&self, version: Version) {
        self.released_tx.send_modify(|v| {
            if version > *v {
                *v = version;
            }
        });
    }

    /// Drop all entries of a disconnected node
    pub(crate) fn forget(&mut self, node: NodeId) {
        for cycle in self.cycles.values_mut() {
            cycle.entered.retain(|n| *n != node);
        }
    }
}

impl Object for BarrierData {
    fn instance_data(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(self.height);
        buf.freeze()
    }

    fn apply_instance(&mut self, mut data: Bytes) -> NetResult<()> {
        if data.remaining() < 4 {
            return Err(NetError::MalformedPacket("short barrier data".into()));
        }
        self.height = data.get_u32_le();
        Ok(())
    }
}

/// An N-party barrier shared across the cluster
#[derive(Clone)]
pub struct Barrier {
    object: SharedObject<BarrierData>,
}

impl Barrier {
    /// Create an unattached barrier with an initial participant count
    pub fn new(height: u32) -> Self {
        Self {
            object: SharedObject::new(BarrierData::new(height)),
        }
    }

    /// Register the master instance with a session
    pub fn register(&self, session: &Arc<Session>) -> NetResult<ObjectId> {
        session.register_object(&self.object)
    }

    /// Map a slave instance of a barrier mastered on the session server
    pub async fn map(
        session: &Arc<Session>,
        id: ObjectId,
        timeout: Duration,
    ) -> NetResult<Barrier> {
        let barrier = Barrier::new(0);
        session.map_object(&barrier.object, id, timeout).await?;
        Ok(barrier)
    }

    /// The object id assigned at registration time
    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    /// The barrier's committed version
    pub fn version(&self) -> Version {
        self.object.version()
    }

    /// The current participant count
    pub fn height(&self) -> u32 {
        self.object.with(|b| b.height)
    }

    /// Replace the participant count; takes effect at the next commit
    pub fn set_height(&self, height: u32) {
        self.object.with_mut(|b| b.height = height);
    }

    /// Add one participant; takes effect at the next commit
    pub fn increase(&self) {
        self.object.with_mut(|b| b.height += 1);
    }

    /// Commit the participant count, opening a new barrier cycle
    pub fn commit(&self) -> NetResult<Version> {
        self.object.commit()
    }

    /// Block until the local replica has seen barrier version `version`
    pub async fn sync_version(&self, version: Version, timeout: Duration) -> NetResult<()> {
        self.object
            .wait_for_version_timeout(version, timeout)
            .await?;
        Ok(())
    }

    /// Enter the barrier at its locally known version
    pub async fn enter(&self, timeout: Duration) -> NetResult<()> {
        self.enter_at(self.object.version(), timeout).await
    }

    /// Enter a specific barrier cycle and block until all participants
    /// of that cycle entered. A timeout is fatal for the frame and
    /// surfaces as [NetError::BarrierTimeout].
    pub async fn enter_at(&self, version: Version, timeout: Duration) -> NetResult<()> {
        let session = self.session()?;
        let master = session.server_node();
        let me = session.local_node_id()?;
        let mut released = self.object.with(|b| b.released());

        session.send_to_node(
            master,
            &Packet::Object {
                session: session.id(),
                object: self.object.id(),
                command: ObjectPacket::BarrierEnter { version, node: me },
            },
        )?;

        let wait = released.wait_for(|v| *v >= version);
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(NetError::Closed),
            Err(_) => Err(NetError::BarrierTimeout(self.object.id())),
        };
        result
    }

    fn session(&self) -> NetResult<Arc<Session>> {
        self.object
            .core
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

    #[test]
    fn instance_data_carries_height() {
        let mut a = BarrierData::new(3);
        let mut b = BarrierData::new(0);
        b.apply_instance(a.instance_data()).unwrap();
        assert_eq!(b.height, 3);
        a.height = 4;
        b.apply_delta(a.pack_delta()).unwrap();
        assert_eq!(b.height, 4);
    }

    #[test]
    fn single_party_cycle_releases_on_first_enter() {
        let mut barrier = BarrierData::new(1);
        barrier.open_cycle(Version(1));
        match barrier.enter_from(NodeId(1), Version(1)) {
            EnterOutcome::Release { version, nodes } => {
                assert_eq!(version, Version(1));
                assert_eq!(nodes, vec![NodeId(1)]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn nth_arrival_releases_all() {
        let mut barrier = BarrierData::new(3);
        barrier.open_cycle(Version(1));
        assert!(matches!(
            barrier.enter_from(NodeId(1), Version(1)),
            EnterOutcome::Pending
        ));
        assert!(matches!(
            barrier.enter_from(NodeId(2), Version(1)),
            EnterOutcome::Pending
        ));
        match barrier.enter_from(NodeId(3), Version(1)) {
            EnterOutcome::Release { nodes, .. } => {
                assert_eq!(nodes, vec![NodeId(1), NodeId(2), NodeId(3)]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn enters_before_the_commit_park_until_the_cycle_opens() {
        let mut barrier = BarrierData::new(2);
        assert!(matches!(
            barrier.enter_from(NodeId(1), Version(2)),
            EnterOutcome::Pending
        ));
        assert!(matches!(
            barrier.enter_from(NodeId(2), Version(2)),
            EnterOutcome::Pending
        ));
        match barrier.open_cycle(Version(2)) {
            EnterOutcome::Release { version, nodes } => {
                assert_eq!(version, Version(2));
                assert_eq!(nodes.len(), 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn pipelined_cycles_complete_independently() {
        let mut barrier = BarrierData::new(2);
        barrier.open_cycle(Version(1));
        barrier.open_cycle(Version(2));

        // node 1 races ahead into cycle 2 before node 2 finished cycle 1
        assert!(matches!(
            barrier.enter_from(NodeId(1), Version(1)),
            EnterOutcome::Pending
        ));
        assert!(matches!(
            barrier.enter_from(NodeId(1), Version(2)),
            EnterOutcome::Pending
        ));
        match barrier.enter_from(NodeId(2), Version(1)) {
            EnterOutcome::Release { version, .. } => assert_eq!(version, Version(1)),
            other => panic!("unexpected outcome {other:?}"),
        }
        match barrier.enter_from(NodeId(2), Version(2)) {
            EnterOutcome::Release { version, .. } => assert_eq!(version, Version(2)),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn forget_drops_a_participant() {
        let mut barrier = BarrierData::new(2);
        barrier.open_cycle(Version(1));
        assert!(matches!(
            barrier.enter_from(NodeId(1), Version(1)),
            EnterOutcome::Pending
        ));
        barrier.forget(NodeId(1));
        assert!(matches!(
            barrier.enter_from(NodeId(2), Version(1)),
            EnterOutcome::Pending
        ));
    }
}
