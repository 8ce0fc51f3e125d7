// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Cluster-level tests over real loopback sockets

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::*;
use crate::barrier::Barrier;
use crate::object::{Object, SharedObject};
use crate::Version;

const TICK: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(5);

async fn periodic_check<F>(check: F)
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < DEADLINE {
        if check() {
            return;
        }
        tokio::time::sleep(TICK).await;
    }
    assert!(check(), "periodic check failed");
}

async fn listening_node() -> Arc<LocalNode> {
    LocalNode::listen(ListenOptions::default())
        .await
        .expect("failed to start node")
}

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
async fn connect_handshake_populates_both_peer_maps() {
    let a = listening_node().await;
    let b = listening_node().await;

    let peer = a
        .connect_peer(vec![b.listener_description()])
        .await
        .expect("connect failed");
    assert_eq!(peer.node_id(), b.node_id());
    assert!(peer.is_connected());

    let (a2, b2) = (a.clone(), b.clone());
    periodic_check(move || b2.peer(a2.node_id()).is_some()).await;

    a.stop();
    b.stop();
    a.wait_stopped().await;
    b.wait_stopped().await;
}

#[tokio::test]
async fn map_session_by_name_is_idempotent() {
    let server = listening_node().await;
    let client = listening_node().await;
    let peer = client
        .connect_peer(vec![server.listener_description()])
        .await
        .unwrap();

    let first = client.map_session(&peer, "config").await.unwrap();
    // a second node mapping the same name resolves to the same id
    let other = listening_node().await;
    let peer2 = other
        .connect_peer(vec![server.listener_description()])
        .await
        .unwrap();
    let second = other.map_session(&peer2, "config").await.unwrap();
    assert_eq!(first.id(), second.id());

    server.stop();
    client.stop();
    other.stop();
}

#[tokio::test]
async fn versions_arrive_monotonically_at_the_slave() {
    let server = listening_node().await;
    let client = listening_node().await;
    let peer = client
        .connect_peer(vec![server.listener_description()])
        .await
        .unwrap();

    let session = server.new_session("config");
    let master = SharedObject::new(Counter(0));
    let id = session.register_object(&master).unwrap();

    let mapped = client.map_session(&peer, "config").await.unwrap();
    let slave = SharedObject::new(Counter(0));
    mapped
        .map_object(&slave, id, Duration::from_secs(5))
        .await
        .unwrap();

    // watch every version change on the slave; none may be skipped
    let mut seen = Vec::new();
    let mut rx = slave.subscribe_version();
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let v = *rx.borrow();
            seen.push(v);
            if v >= Version(100) {
                break;
            }
        }
        seen
    });

    for i in 1..=100u64 {
        master.with_mut(|c| c.0 = i);
        master.commit().unwrap();
    }

    let reached = slave
        .wait_for_version_timeout(Version(100), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(reached >= Version(100));
    assert_eq!(slave.with(|c| c.0), 100);

    let seen = watcher.await.unwrap();
    for pair in seen.windows(2) {
        assert!(pair[1] > pair[0], "version regression: {pair:?}");
    }

    server.stop();
    client.stop();
}

#[tokio::test]
async fn slave_syncs_to_head_version() {
    let server = listening_node().await;
    let client = listening_node().await;
    let peer = client
        .connect_peer(vec![server.listener_description()])
        .await
        .unwrap();

    let session = server.new_session("config");
    let master = SharedObject::new(Counter(0));
    let id = session.register_object(&master).unwrap();
    for i in 1..=7u64 {
        master.with_mut(|c| c.0 = i);
        master.commit().unwrap();
    }

    let mapped = client.map_session(&peer, "config").await.unwrap();
    let slave = SharedObject::new(Counter(0));
    mapped
        .map_object(&slave, id, Duration::from_secs(5))
        .await
        .unwrap();

    let head = slave.sync_to_head(Duration::from_secs(5)).await.unwrap();
    assert_eq!(head, Version(7));
    assert_eq!(slave.with(|c| c.0), 7);

    server.stop();
    client.stop();
}

#[tokio::test]
async fn two_party_barrier_releases_together() {
    let server = listening_node().await;
    let client = listening_node().await;
    let peer = client
        .connect_peer(vec![server.listener_description()])
        .await
        .unwrap();

    let session = server.new_session("config");
    let barrier = Barrier::new(2);
    let id = barrier.register(&session).unwrap();
    barrier.commit().unwrap();

    let mapped = client.map_session(&peer, "config").await.unwrap();
    let remote = Barrier::map(&mapped, id, Duration::from_secs(5)).await.unwrap();
    remote
        .sync_version(Version(1), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(remote.height(), 2);

    let local_enter = {
        let barrier = barrier.clone();
        tokio::spawn(async move { barrier.enter(Duration::from_secs(5)).await })
    };
    remote.enter(Duration::from_secs(5)).await.unwrap();
    local_enter.await.unwrap().unwrap();

    server.stop();
    client.stop();
}

#[tokio::test]
async fn lone_barrier_party_times_out() {
    let server = listening_node().await;
    let session = server.new_session("config");
    let barrier = Barrier::new(2);
    barrier.register(&session).unwrap();
    barrier.commit().unwrap();

    let err = barrier.enter(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, NetError::BarrierTimeout(_)));

    server.stop();
}

#[tokio::test]
async fn single_party_barrier_releases_on_first_enter() {
    let server = listening_node().await;
    let session = server.new_session("config");
    let barrier = Barrier::new(1);
    barrier.register(&session).unwrap();
    barrier.commit().unwrap();
    barrier.enter(Duration::from_secs(5)).await.unwrap();
    server.stop();
}

#[tokio::test]
async fn connect_node_resolves_descriptions_through_a_peer() {
    let server = listening_node().await;
    let a = listening_node().await;
    let b = listening_node().await;
    a.connect_peer(vec![server.listener_description()])
        .await
        .unwrap();
    b.connect_peer(vec![server.listener_description()])
        .await
        .unwrap();

    // wait until the server has registered both
    {
        let (s, a_id, b_id) = (server.clone(), a.node_id(), b.node_id());
        periodic_check(move || s.peer(a_id).is_some() && s.peer(b_id).is_some()).await;
    }

    let peer = a
        .connect_node(server.node_id(), b.node_id())
        .await
        .expect("indirect connect failed");
    assert_eq!(peer.node_id(), b.node_id());

    server.stop();
    a.stop();
    b.stop();
}

#[tokio::test]
async fn unreachable_peer_without_launch_fails() {
    let a = listening_node().await;
    let unreachable = ConnectionDescription {
        hostname: "127.0.0.1".into(),
        port: 1,
        ..Default::default()
    };
    let pending = a.init_connect(vec![unreachable], false);
    let err = a.sync_connect(pending).await.unwrap_err();
    assert!(matches!(err, NetError::RequestFailed { .. }));
    a.stop();
}

#[tokio::test]
async fn connect_back_resolves_a_pending_launch() {
    let parent = listening_node().await;
    let child = listening_node().await;

    // unreachable endpoint with a no-op launch command: the spawned
    // process does nothing, we play the child ourselves
    let description = ConnectionDescription {
        hostname: "127.0.0.1".into(),
        port: 1,
        launch_command: "true".into(),
        launch_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let pending = parent.init_connect(vec![description], true);

    let args = launch::format_client_args(
        &parent.listener_description().address(),
        pending.request,
    );
    child.connect_back(&args).await.expect("connect back failed");

    let peer = parent.sync_connect(pending).await.expect("sync failed");
    assert_eq!(peer.node_id(), child.node_id());

    parent.stop();
    child.stop();
}

#[tokio::test]
async fn disconnect_is_observed() {
    let server = listening_node().await;
    let client = listening_node().await;
    client
        .connect_peer(vec![server.listener_description()])
        .await
        .unwrap();

    let mut disconnects = server.subscribe_disconnects();
    let client_id = client.node_id();
    client.stop();
    client.wait_stopped().await;

    let node = tokio::time::timeout(DEADLINE, disconnects.recv())
        .await
        .expect("no disconnect notification")
        .unwrap();
    assert_eq!(node, client_id);
    server.stop();
}

#[tokio::test]
async fn stop_packet_stops_the_receiver() {
    let node = listening_node().await;
    assert_eq!(node.state(), NodeState::Listening);
    node.stop();
    node.wait_stopped().await;
    assert_eq!(node.state(), NodeState::Stopped);
}
