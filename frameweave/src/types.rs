// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Geometry and scheduling primitives shared between server and render
//! nodes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use frameweave_net::{NetError, NetResult, Version};

/// A fractional viewport relative to the parent entity, `[0,1]` on both
/// axes for fullscreen
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Horizontal origin
    pub x: f32,
    /// Vertical origin
    pub y: f32,
    /// Width
    pub w: f32,
    /// Height
    pub h: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::FULL
    }
}

impl Viewport {
    /// The full parent area
    pub const FULL: Viewport = Viewport {
        x: 0.0,
        y: 0.0,
        w: 1.0,
        h: 1.0,
    };

    /// A viewport is valid when it has positive area
    pub fn is_valid(&self) -> bool {
        self.w > 0.0 && self.h > 0.0
    }

    /// Apply this viewport to a pixel viewport, yielding the sub-area
    pub fn apply_to(&self, pvp: &PixelViewport) -> PixelViewport {
        PixelViewport {
            x: pvp.x + (pvp.w as f32 * self.x) as i32,
            y: pvp.y + (pvp.h as f32 * self.y) as i32,
            w: (pvp.w as f32 * self.w) as i32,
            h: (pvp.h as f32 * self.h) as i32,
        }
    }

    /// Append the wire representation
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.x);
        buf.put_f32_le(self.y);
        buf.put_f32_le(self.w);
        buf.put_f32_le(self.h);
    }

    /// Parse the wire representation
    pub fn decode(buf: &mut Bytes) -> NetResult<Self> {
        if buf.remaining() < 16 {
            return Err(NetError::MalformedPacket("truncated viewport".into()));
        }
        Ok(Self {
            x: buf.get_f32_le(),
            y: buf.get_f32_le(),
            w: buf.get_f32_le(),
            h: buf.get_f32_le(),
        })
    }
}

/// An integer viewport in window coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelViewport {
    /// Horizontal origin in pixels
    pub x: i32,
    /// Vertical origin in pixels
    pub y: i32,
    /// Width in pixels
    pub w: i32,
    /// Height in pixels
    pub h: i32,
}

impl PixelViewport {
    /// A pixel viewport is valid when it has positive area
    pub fn is_valid(&self) -> bool {
        self.w > 0 && self.h > 0
    }

    /// Area in pixels
    pub fn area(&self) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        self.w as u64 * self.h as u64
    }

    /// Append the wire representation
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.x);
        buf.put_i32_le(self.y);
        buf.put_i32_le(self.w);
        buf.put_i32_le(self.h);
    }

    /// Parse the wire representation
    pub fn decode(buf: &mut Bytes) -> NetResult<Self> {
        if buf.remaining() < 16 {
            return Err(NetError::MalformedPacket("truncated pixel viewport".into()));
        }
        Ok(Self {
            x: buf.get_i32_le(),
            y: buf.get_i32_le(),
            w: buf.get_i32_le(),
            h: buf.get_i32_le(),
        })
    }
}

/// A half-open interval `[start, end)` of `[0,1]`, a channel's share of
/// a sort-last decomposition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    /// Inclusive lower bound
    pub start: f32,
    /// Exclusive upper bound
    pub end: f32,
}

impl Default for Range {
    fn default() -> Self {
        Self::ALL
    }
}

impl Range {
    /// The whole data set
    pub const ALL: Range = Range {
        start: 0.0,
        end: 1.0,
    };

    /// An empty range renders nothing
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Does this range cover the whole data set?
    pub fn is_full(&self) -> bool {
        self.start <= 0.0 && self.end >= 1.0
    }

    /// Append the wire representation
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.start);
        buf.put_f32_le(self.end);
    }

    /// Parse the wire representation
    pub fn decode(buf: &mut Bytes) -> NetResult<Self> {
        if buf.remaining() < 8 {
            return Err(NetError::MalformedPacket("truncated range".into()));
        }
        Ok(Self {
            start: buf.get_f32_le(),
            end: buf.get_f32_le(),
        })
    }
}

/// When a render node releases the local frame synchronisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadModel {
    /// Release as soon as `frame_start` returned; pipes run unthrottled
    Async,
    /// Release once all pipes completed the draw tasks of the frame
    #[default]
    DrawSync,
    /// Release once all pipes completed the whole frame, including
    /// readback and assembly
    LocalSync,
}

impl ThreadModel {
    /// Append the wire representation
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(match self {
            ThreadModel::Async => 0,
            ThreadModel::DrawSync => 1,
            ThreadModel::LocalSync => 2,
        });
    }

    /// Parse the wire representation
    pub fn decode(buf: &mut Bytes) -> NetResult<Self> {
        if buf.remaining() < 4 {
            return Err(NetError::MalformedPacket("truncated thread model".into()));
        }
        match buf.get_u32_le() {
            0 => Ok(ThreadModel::Async),
            1 => Ok(ThreadModel::DrawSync),
            2 => Ok(ThreadModel::LocalSync),
            other => Err(NetError::MalformedPacket(format!(
                "unknown thread model {other}"
            ))),
        }
    }
}

/// Everything a channel task needs to execute one operation of one
/// frame
#[derive(Debug, Clone, PartialEq)]
pub struct RenderContext {
    /// The frame being rendered
    pub frame_number: u32,
    /// The frame-data version to render against, equal to the frame
    /// number
    pub frame_version: Version,
    /// The channel's pixel viewport for this task
    pub pvp: PixelViewport,
    /// The channel's fractional viewport within its window
    pub vp: Viewport,
    /// The channel's share of a sort-last decomposition
    pub range: Range,
}

impl RenderContext {
    /// Append the wire representation
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.frame_number);
        buf.put_u32_le(self.frame_version.0);
        self.pvp.encode(buf);
        self.vp.encode(buf);
        self.range.encode(buf);
    }

    /// Parse the wire representation
    pub fn decode(buf: &mut Bytes) -> NetResult<Self> {
        if buf.remaining() < 8 {
            return Err(NetError::MalformedPacket("truncated render context".into()));
        }
        Ok(Self {
            frame_number: buf.get_u32_le(),
            frame_version: Version(buf.get_u32_le()),
            pvp: PixelViewport::decode(buf)?,
            vp: Viewport::decode(buf)?,
            range: Range::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_range_covers_everything() {
        assert!(Range::ALL.is_full());
        assert!(!Range::ALL.is_empty());
    }

    #[test]
    fn degenerate_range_renders_nothing() {
        let range = Range {
            start: 0.4,
            end: 0.4,
        };
        assert!(range.is_empty());
    }

    #[test]
    fn viewport_applies_to_pixels() {
        let half = Viewport {
            x: 0.5,
            y: 0.0,
            w: 0.5,
            h: 1.0,
        };
        let pvp = PixelViewport {
            x: 0,
            y: 0,
            w: 800,
            h: 600,
        };
        assert_eq!(
            half.apply_to(&pvp),
            PixelViewport {
                x: 400,
                y: 0,
                w: 400,
                h: 600
            }
        );
    }

    #[test]
    fn render_context_roundtrip() {
        let ctx = RenderContext {
            frame_number: 9,
            frame_version: Version(9),
            pvp: PixelViewport {
                x: 0,
                y: 0,
                w: 640,
                h: 480,
            },
            vp: Viewport::FULL,
            range: Range {
                start: 0.25,
                end: 0.75,
            },
        };
        let mut buf = BytesMut::new();
        ctx.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(RenderContext::decode(&mut bytes).unwrap(), ctx);
    }
}
