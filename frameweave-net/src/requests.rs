// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! One-shot request/reply matching.
//!
//! Split-phase commands register a request before transmitting, embed the
//! returned [RequestId] in the packet, and later block on
//! [RequestCache::wait]. Whoever handles the reply packet calls
//! [RequestCache::serve] with the carried id. Every registered id is
//! served exactly once; requests still pending at shutdown are failed via
//! [RequestCache::fail_all].

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::NetError;
use crate::{NetResult, RequestId};

/// The value a request is served with
#[derive(Debug, Clone, PartialEq)]
pub enum RequestValue {
    /// Completion without payload
    Nothing,
    /// A boolean result
    Bool(bool),
    /// A numeric result
    Unsigned(u64),
    /// A 32-bit identifier (session ids, object ids)
    Id(u32),
    /// A node identifier, e.g. from a resolved connect
    Node(crate::NodeId),
    /// An opaque payload
    Bytes(Bytes),
}

impl RequestValue {
    /// Interpret this value as a success/failure flag. Anything but
    /// `Bool(false)` counts as success.
    pub fn is_success(&self) -> bool {
        !matches!(self, RequestValue::Bool(false))
    }
}

type Served = Result<RequestValue, String>;

struct Entry {
    tx: Option<oneshot::Sender<Served>>,
    rx: Option<oneshot::Receiver<Served>>,
}

/// Thread-safe map of pending requests
#[derive(Default)]
pub struct RequestCache {
    entries: DashMap<RequestId, Entry>,
    next_id: AtomicU32,
}

impl RequestCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending request
    pub fn register(&self) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            Entry {
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        id
    }

    /// Block until the request is served. Fails with
    /// [NetError::RequestFailed] when it was served with an error, and
    /// with [NetError::Closed] when the cache was torn down underneath
    /// the waiter.
    pub async fn wait(&self, id: RequestId) -> NetResult<RequestValue> {
        let rx = self
            .entries
            .get_mut(&id)
            .and_then(|mut entry| entry.rx.take())
            .ok_or(NetError::Closed)?;
        let served = rx.await.map_err(|_| NetError::Closed)?;
        self.entries.remove(&id);
        served.map_err(|reason| NetError::request_failed(id, reason))
    }

    /// Like [RequestCache::wait], but gives up after `timeout`. The
    /// request is unregistered on timeout; a late serve is ignored.
    pub async fn wait_timeout(&self, id: RequestId, timeout: Duration) -> NetResult<RequestValue> {
        match tokio::time::timeout(timeout, self.wait(id)).await {
            Ok(result) => result,
            Err(_) => {
                self.entries.remove(&id);
                Err(NetError::Timeout)
            }
        }
    }

    /// Fulfil a pending request. Returns `false` when the id is unknown
    /// or was already served.
    pub fn serve(&self, id: RequestId, value: RequestValue) -> bool {
        self.serve_inner(id, Ok(value))
    }

    /// Fail a pending request with a human-readable reason
    pub fn serve_error(&self, id: RequestId, reason: impl Into<String>) -> bool {
        self.serve_inner(id, Err(reason.into()))
    }

    fn serve_inner(&self, id: RequestId, served: Served) -> bool {
        let tx = self
            .entries
            .get_mut(&id)
            .and_then(|mut entry| entry.tx.take());
        match tx {
            Some(tx) => tx.send(served).is_ok(),
            None => {
                tracing::warn!("Request {id} served twice or never registered");
                false
            }
        }
    }

    /// Number of requests not yet served
    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.tx.is_some())
            .count()
    }

    /// Fail every pending request, e.g. at shutdown or when a peer
    /// disconnected
    pub fn fail_all(&self, reason: &str) {
        for mut entry in self.entries.iter_mut() {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_served_value() {
        let cache = RequestCache::new();
        let id = cache.register();
        assert!(cache.serve(id, RequestValue::Unsigned(17)));
        assert_eq!(cache.wait(id).await.unwrap(), RequestValue::Unsigned(17));
    }

    #[tokio::test]
    async fn serve_is_once_only() {
        let cache = RequestCache::new();
        let id = cache.register();
        assert!(cache.serve(id, RequestValue::Nothing));
        assert!(!cache.serve(id, RequestValue::Nothing));
    }

    #[tokio::test]
    async fn wait_before_serve() {
        let cache = std::sync::Arc::new(RequestCache::new());
        let id = cache.register();
        let server = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cache.serve(id, RequestValue::Bool(true));
            })
        };
        assert_eq!(cache.wait(id).await.unwrap(), RequestValue::Bool(true));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_unregisters() {
        let cache = RequestCache::new();
        let id = cache.register();
        let err = cache
            .wait_timeout(id, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout));
        assert_eq!(cache.pending(), 0);
    }

    #[tokio::test]
    async fn fail_all_surfaces_reason() {
        let cache = RequestCache::new();
        let id = cache.register();
        cache.fail_all("node disconnected");
        match cache.wait(id).await.unwrap_err() {
            NetError::RequestFailed { reason, .. } => assert_eq!(reason, "node disconnected"),
            other => panic!("unexpected error {other}"),
        }
    }
}
