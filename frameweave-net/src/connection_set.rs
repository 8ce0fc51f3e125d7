// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Wait-for-any-event multiplexing over a dynamic set of connections.
//!
//! Every connection added to the set gets a pump task which decodes whole
//! transport frames and forwards them, in arrival order, into one shared
//! event queue. [ConnectionSet::select] is a timed receive on that queue,
//! so adding a connection from another task wakes a blocked selector as
//! soon as the new connection produces an event, and [SetHandle::interrupt]
//! wakes it unconditionally.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionReader};
use crate::packet::Packet;

/// Identifies a connection within a [ConnectionSet]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// An event produced by the set
#[derive(Debug)]
pub enum Event {
    /// A packet arrived on a member connection
    Data {
        /// The connection the packet arrived on
        from: ConnectionId,
        /// The decoded packet
        packet: Packet,
    },
    /// A new connection was accepted by the listener and awaits the
    /// connect handshake
    Incoming(Connection),
    /// A member connection closed or failed; its pump has exited
    Closed {
        /// The connection that went away
        from: ConnectionId,
    },
    /// [SetHandle::interrupt] was called
    Interrupt,
}

/// Outcome of a [ConnectionSet::select]
#[derive(Debug)]
pub enum Select {
    /// An event is ready
    Event(Event),
    /// The timeout elapsed with no event
    Timeout,
}

struct SetInner {
    tx: mpsc::UnboundedSender<Event>,
    pumps: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

/// The selectable end of the set. One per local node, owned by its
/// receiver task.
pub struct ConnectionSet {
    inner: Arc<SetInner>,
    rx: mpsc::UnboundedReceiver<Event>,
}

/// A cloneable handle for mutating the set and injecting events from
/// other tasks
#[derive(Clone)]
pub struct SetHandle {
    inner: Arc<SetInner>,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSet {
    /// Create an empty set
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SetInner {
                tx,
                pumps: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            rx,
        }
    }

    /// A handle for use from other tasks
    pub fn handle(&self) -> SetHandle {
        SetHandle {
            inner: self.inner.clone(),
        }
    }

    /// Wait for the next event. With a timeout, returns
    /// [Select::Timeout] when nothing arrives in time; without one,
    /// blocks until an event is ready.
    pub async fn select(&mut self, timeout: Option<Duration>) -> Select {
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, self.rx.recv()).await {
                Ok(Some(event)) => Select::Event(event),
                // all senders gone means the set is shutting down
                Ok(None) => Select::Event(Event::Interrupt),
                Err(_) => Select::Timeout,
            },
            None => match self.rx.recv().await {
                Some(event) => Select::Event(event),
                None => Select::Event(Event::Interrupt),
            },
        }
    }
}

impl SetHandle {
    /// Add the read half of a connection; its packets will surface as
    /// [Event::Data] in arrival order until it closes.
    pub fn add(&self, mut reader: ConnectionReader) -> ConnectionId {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let tx = self.inner.tx.clone();
        let inner = self.inner.clone();
        let pump = tokio::spawn(async move {
            loop {
                match reader.recv_packet().await {
                    Ok(Some(packet)) => {
                        if tx.send(Event::Data { from: id, packet }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Event::Closed { from: id });
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("Receive error on {id}: {err}");
                        let _ = tx.send(Event::Closed { from: id });
                        break;
                    }
                }
            }
            inner.pumps.lock().expect("pump registry poisoned").remove(&id);
        });
        self.inner
            .pumps
            .lock()
            .expect("pump registry poisoned")
            .insert(id, pump);
        id
    }

    /// Remove a connection; pending events from it stay in the queue
    pub fn remove(&self, id: ConnectionId) {
        if let Some(pump) = self
            .inner
            .pumps
            .lock()
            .expect("pump registry poisoned")
            .remove(&id)
        {
            pump.abort();
        }
    }

    /// Inject an event, e.g. an accepted connection from the listener
    /// task or a loopback packet from the local node itself
    pub fn push(&self, event: Event) {
        let _ = self.inner.tx.send(event);
    }

    /// Wake a blocked [ConnectionSet::select]
    pub fn interrupt(&self) {
        let _ = self.inner.tx.send(Event::Interrupt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NodePacket;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let mut set = ConnectionSet::new();
        let handle = set.handle();

        let (mut a, b) = Connection::pair().unwrap();
        let (reader, _writer) = b.into_split();
        let id = handle.add(reader);

        for _ in 0..3 {
            a.send_packet(&Packet::Node(NodePacket::Stop)).await.unwrap();
        }
        for _ in 0..3 {
            match set.select(Some(Duration::from_secs(1))).await {
                Select::Event(Event::Data { from, packet }) => {
                    assert_eq!(from, id);
                    assert_eq!(packet, Packet::Node(NodePacket::Stop));
                }
                other => panic!("unexpected select result: {other:?}"),
            }
        }

        drop(a);
        match set.select(Some(Duration::from_secs(1))).await {
            Select::Event(Event::Closed { from }) => assert_eq!(from, id),
            other => panic!("unexpected select result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_wakes_selector() {
        let mut set = ConnectionSet::new();
        let handle = set.handle();
        let waker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.interrupt();
        });
        match set.select(Some(Duration::from_secs(5))).await {
            Select::Event(Event::Interrupt) => {}
            other => panic!("unexpected select result: {other:?}"),
        }
        waker.await.unwrap();
    }

    #[tokio::test]
    async fn empty_select_times_out() {
        let mut set = ConnectionSet::new();
        match set.select(Some(Duration::from_millis(10))).await {
            Select::Timeout => {}
            other => panic!("unexpected select result: {other:?}"),
        }
    }
}
