// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Readback frames in flight between channels.
//!
//! Source channels read their viewport back after drawing and hand the
//! image to their node's transmitter, which ships it to the destination
//! node's frame inbox. The destination pipe blocks in the assemble task
//! until the expected number of images for the frame arrived in the
//! [ImagePool].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use frameweave_net::{NetError, NetResult, NodeId, ObjectId};
use tokio::sync::Notify;

use crate::types::PixelViewport;

/// One channel's readback of one frame
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    /// The source area within the destination's coordinate frame
    pub pvp: PixelViewport,
    /// Raw pixel data
    pub pixels: Bytes,
}

/// A transmission order for the node's transmitter task
#[derive(Debug)]
pub struct TransmitTask {
    /// The node hosting the destination channel
    pub dest_node: NodeId,
    /// The destination node's frame inbox object
    pub dest_inbox: ObjectId,
    /// The destination channel
    pub dest_channel: ObjectId,
    /// The frame the image belongs to
    pub frame: u32,
    /// The image itself
    pub image: ImageFrame,
}

/// Inbound readback frames, keyed by destination channel and frame
/// number
#[derive(Default)]
pub struct ImagePool {
    frames: Mutex<HashMap<(ObjectId, u32), Vec<ImageFrame>>>,
    arrived: Notify,
}

impl ImagePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit an image for a channel and frame
    pub fn insert(&self, channel: ObjectId, frame: u32, image: ImageFrame) {
        self.frames
            .lock()
            .expect("image pool lock poisoned")
            .entry((channel, frame))
            .or_default()
            .push(image);
        self.arrived.notify_waiters();
    }

    /// Take `expected` images for a channel and frame, blocking until
    /// they all arrived
    pub async fn wait_images(
        &self,
        channel: ObjectId,
        frame: u32,
        expected: usize,
        timeout: Duration,
    ) -> NetResult<Vec<ImageFrame>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // register interest before checking, so an insert between
            // the check and the await still wakes us
            let notified = self.arrived.notified();
            {
                let mut frames = self.frames.lock().expect("image pool lock poisoned");
                if let Some(images) = frames.get(&(channel, frame)) {
                    if images.len() >= expected {
                        return Ok(frames.remove(&(channel, frame)).unwrap_or_default());
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NetError::Timeout);
            }
        }
    }

    /// Drop all images of frames up to and including `frame`, e.g.
    /// after a frame was abandoned
    pub fn discard_through(&self, frame: u32) {
        self.frames
            .lock()
            .expect("image pool lock poisoned")
            .retain(|(_, f), _| *f > frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageFrame {
        ImageFrame {
            pvp: PixelViewport {
                x: 0,
                y: 0,
                w: 1,
                h: 1,
            },
            pixels: Bytes::from_static(&[0, 0, 0, 255]),
        }
    }

    #[tokio::test]
    async fn wait_returns_once_expected_arrived() {
        let pool = std::sync::Arc::new(ImagePool::new());
        let inserter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.insert(ObjectId(1), 4, image());
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.insert(ObjectId(1), 4, image());
            })
        };
        let images = pool
            .wait_images(ObjectId(1), 4, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(images.len(), 2);
        inserter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_when_images_are_missing() {
        let pool = ImagePool::new();
        pool.insert(ObjectId(1), 4, image());
        let err = pool
            .wait_images(ObjectId(1), 4, 2, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout));
    }

    #[test]
    fn discard_drops_stale_frames() {
        let pool = ImagePool::new();
        pool.insert(ObjectId(1), 1, image());
        pool.insert(ObjectId(1), 5, image());
        pool.discard_through(3);
        let frames = pool.frames.lock().unwrap();
        assert!(!frames.contains_key(&(ObjectId(1), 1)));
        assert!(frames.contains_key(&(ObjectId(1), 5)));
    }
}
