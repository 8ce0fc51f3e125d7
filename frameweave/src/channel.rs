// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Channels: viewports within a window, the unit of draw.
//!
//! A channel executes the application's draw code. All of its callbacks
//! run on the owning pipe's task with the window's GL context current;
//! the [ChannelView] handed to each callback exposes the task geometry,
//! the frame data and the window system.

use bytes::{Bytes, BytesMut};
use frameweave_net::ObjectId;

use crate::frame_data::FrameData;
use crate::image::ImageFrame;
use crate::types::{PixelViewport, Range, RenderContext};
use crate::window_system::SystemWindow;
use crate::ClientResult;

/// What a channel callback sees of its surroundings
pub struct ChannelView<'a> {
    /// The channel's object id
    pub id: ObjectId,
    /// The channel's configured name
    pub name: &'a str,
    /// The task being executed
    pub context: &'a RenderContext,
    /// Parameters of the frame being rendered
    pub frame_data: &'a FrameData,
    /// The window system of the owning window
    pub system: &'a mut dyn SystemWindow,
    near: &'a mut f32,
    far: &'a mut f32,
    tint: Option<[f32; 4]>,
}

impl ChannelView<'_> {
    /// The channel's pixel viewport for this task
    pub fn pixel_viewport(&self) -> PixelViewport {
        self.context.pvp
    }

    /// The channel's share of a sort-last decomposition
    pub fn range(&self) -> Range {
        self.context.range
    }

    /// Adjust the near and far planes for frustum culling
    pub fn set_near_far(&mut self, near: f32, far: f32) {
        *self.near = near;
        *self.far = far;
    }

    /// The current near and far planes
    pub fn near_far(&self) -> (f32, f32) {
        (*self.near, *self.far)
    }

    /// The debug clear colour when `EQ_TAINT_CHANNELS` is set
    pub fn tint_color(&self) -> Option<[f32; 4]> {
        self.tint
    }
}

/// Application draw code of a channel.
///
/// Every method runs on the owning pipe's task.
pub trait ChannelHandler: Send {
    /// Acquire channel resources (display lists, buffers)
    fn config_init(&mut self, _name: &str) -> ClientResult<()> {
        Ok(())
    }

    /// Release channel resources
    fn config_exit(&mut self) {}

    /// Clear the channel's viewport
    fn frame_clear(&mut self, _view: &mut ChannelView<'_>) -> ClientResult<()> {
        Ok(())
    }

    /// Draw the channel's share of the scene
    fn frame_draw(&mut self, view: &mut ChannelView<'_>) -> ClientResult<()>;

    /// Capture the drawn viewport for transport to a destination
    /// channel. The default synthesises an opaque buffer of the task's
    /// viewport size.
    fn frame_readback(&mut self, view: &mut ChannelView<'_>) -> ClientResult<Bytes> {
        let pvp = view.pixel_viewport();
        let mut pixels = BytesMut::new();
        pixels.resize(pvp.area() as usize * 4, 0xff);
        Ok(pixels.freeze())
    }

    /// Composite input frames into the channel's viewport
    fn frame_assemble(
        &mut self,
        _view: &mut ChannelView<'_>,
        _frames: &[ImageFrame],
    ) -> ClientResult<()> {
        Ok(())
    }
}

/// A channel entity hosted on a render node
pub struct Channel {
    id: ObjectId,
    name: String,
    near: f32,
    far: f32,
    handler: Box<dyn ChannelHandler>,
}

impl Channel {
    pub(crate) fn new(id: ObjectId, handler: Box<dyn ChannelHandler>) -> Self {
        Self {
            id,
            name: String::new(),
            near: 0.1,
            far: 100.0,
            handler,
        }
    }

    /// The channel's object id
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The channel's configured name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config_init(&mut self, name: String) -> ClientResult<()> {
        self.name = name;
        let name = self.name.clone();
        self.handler.config_init(&name)
    }

    pub(crate) fn config_exit(&mut self) {
        self.handler.config_exit();
    }

    fn view<'a>(
        &'a mut self,
        system: &'a mut dyn SystemWindow,
        context: &'a RenderContext,
        frame_data: &'a FrameData,
    ) -> (&'a mut Box<dyn ChannelHandler>, ChannelView<'a>) {
        let tint = if crate::taint_channels() {
            Some(tint_for(self.id))
        } else {
            None
        };
        let view = ChannelView {
            id: self.id,
            name: &self.name,
            context,
            frame_data,
            system,
            near: &mut self.near,
            far: &mut self.far,
            tint,
        };
        (&mut self.handler, view)
    }

    pub(crate) fn frame_clear(
        &mut self,
        system: &mut dyn SystemWindow,
        context: &RenderContext,
        frame_data: &FrameData,
    ) -> ClientResult<()> {
        let (handler, mut view) = self.view(system, context, frame_data);
        handler.frame_clear(&mut view)
    }

    pub(crate) fn frame_draw(
        &mut self,
        system: &mut dyn SystemWindow,
        context: &RenderContext,
        frame_data: &FrameData,
    ) -> ClientResult<()> {
        let (handler, mut view) = self.view(system, context, frame_data);
        handler.frame_draw(&mut view)
    }

    pub(crate) fn frame_readback(
        &mut self,
        system: &mut dyn SystemWindow,
        context: &RenderContext,
        frame_data: &FrameData,
    ) -> ClientResult<Bytes> {
        let (handler, mut view) = self.view(system, context, frame_data);
        handler.frame_readback(&mut view)
    }

    pub(crate) fn frame_assemble(
        &mut self,
        system: &mut dyn SystemWindow,
        context: &RenderContext,
        frame_data: &FrameData,
        frames: &[ImageFrame],
    ) -> ClientResult<()> {
        let (handler, mut view) = self.view(system, context, frame_data);
        handler.frame_assemble(&mut view, frames)
    }
}

/// Deterministic debug tint derived from the channel id
fn tint_for(id: ObjectId) -> [f32; 4] {
    let h = id.0.wrapping_mul(2654435761);
    [
        ((h >> 16) & 0xff) as f32 / 255.0,
        ((h >> 8) & 0xff) as f32 / 255.0,
        (h & 0xff) as f32 / 255.0,
        1.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window_system::HeadlessWindow;
    use frameweave_net::Version;

    struct CountingChannel {
        draws: u32,
    }

    impl ChannelHandler for CountingChannel {
        fn frame_draw(&mut self, view: &mut ChannelView<'_>) -> ClientResult<()> {
            assert!(view.pixel_viewport().is_valid());
            view.set_near_far(1.0, 10.0);
            self.draws += 1;
            Ok(())
        }
    }

    fn context() -> RenderContext {
        RenderContext {
            frame_number: 1,
            frame_version: Version(1),
            pvp: PixelViewport {
                x: 0,
                y: 0,
                w: 64,
                h: 64,
            },
            vp: crate::types::Viewport::FULL,
            range: Range::ALL,
        }
    }

    #[test]
    fn draw_runs_the_handler_with_the_context() {
        let mut channel = Channel::new(ObjectId(1), Box::new(CountingChannel { draws: 0 }));
        let mut system = HeadlessWindow::default();
        system
            .create(&PixelViewport {
                x: 0,
                y: 0,
                w: 64,
                h: 64,
            })
            .unwrap();
        let data = FrameData::default();
        channel
            .frame_draw(&mut system, &context(), &data)
            .unwrap();
        assert_eq!(channel.near, 1.0);
        assert_eq!(channel.far, 10.0);
    }

    #[test]
    fn default_readback_matches_viewport_area() {
        struct Plain;
        impl ChannelHandler for Plain {
            fn frame_draw(&mut self, _view: &mut ChannelView<'_>) -> ClientResult<()> {
                Ok(())
            }
        }
        let mut channel = Channel::new(ObjectId(2), Box::new(Plain));
        let mut system = HeadlessWindow::default();
        system
            .create(&PixelViewport {
                x: 0,
                y: 0,
                w: 64,
                h: 64,
            })
            .unwrap();
        let data = FrameData::default();
        let pixels = channel
            .frame_readback(&mut system, &context(), &data)
            .unwrap();
        assert_eq!(pixels.len(), 64 * 64 * 4);
    }
}
