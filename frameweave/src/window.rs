// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Windows: OS windows plus GL context, owning channels.
//!
//! A window entity lives on its pipe's task. The OS side is hidden
//! behind [crate::window_system::SystemWindow]; swap-barrier entry is
//! driven by the pipe, which owns the node's barrier cache.

use std::collections::HashMap;

use bytes::Bytes;
use frameweave_net::ObjectId;

use crate::channel::{Channel, ChannelHandler};
use crate::frame_data::FrameData;
use crate::image::ImageFrame;
use crate::types::{PixelViewport, RenderContext};
use crate::window_system::SystemWindow;
use crate::{ClientError, ClientResult};

/// Application callbacks of a window, run on the owning pipe's task
pub trait WindowHandler: Send {
    /// Acquire window resources after the OS window was created
    fn config_init(&mut self, _system: &mut dyn SystemWindow) -> ClientResult<()> {
        Ok(())
    }

    /// Release window resources before the OS window is destroyed
    fn config_exit(&mut self) {}

    /// Frame begin on this window
    fn frame_start(&mut self, _frame: u32) {}

    /// Frame end on this window
    fn frame_finish(&mut self, _frame: u32) {}
}

/// A window entity hosted on a render node
pub struct Window {
    id: ObjectId,
    name: String,
    system: Box<dyn SystemWindow>,
    handler: Box<dyn WindowHandler>,
    channels: HashMap<ObjectId, Channel>,
    pvp: PixelViewport,
    created: bool,
}

impl Window {
    pub(crate) fn new(
        id: ObjectId,
        system: Box<dyn SystemWindow>,
        handler: Box<dyn WindowHandler>,
    ) -> Self {
        Self {
            id,
            name: String::new(),
            system,
            handler,
            channels: HashMap::new(),
            pvp: PixelViewport::default(),
            created: false,
        }
    }

    /// The window's object id
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The realised pixel viewport
    pub fn pixel_viewport(&self) -> PixelViewport {
        self.pvp
    }

    pub(crate) fn add_channel(&mut self, id: ObjectId, handler: Box<dyn ChannelHandler>) {
        self.channels.insert(id, Channel::new(id, handler));
    }

    pub(crate) fn remove_channel(&mut self, id: ObjectId) -> bool {
        self.channels.remove(&id).is_some()
    }

    /// Create the OS window; returns the realised pixel viewport
    pub(crate) fn config_init(
        &mut self,
        name: String,
        pvp: PixelViewport,
    ) -> ClientResult<PixelViewport> {
        self.name = name;
        self.pvp = self.system.create(&pvp)?;
        self.created = true;
        self.handler.config_init(self.system.as_mut())?;
        Ok(self.pvp)
    }

    pub(crate) fn config_exit(&mut self) {
        self.handler.config_exit();
        if self.created {
            self.system.destroy();
            self.created = false;
        }
    }

    pub(crate) fn start_frame(&mut self, frame: u32, make_current: bool) -> ClientResult<()> {
        if make_current {
            self.system.make_current()?;
        }
        self.system.bind_frame_buffer()?;
        self.handler.frame_start(frame);
        Ok(())
    }

    pub(crate) fn end_frame(&mut self, frame: u32) {
        self.handler.frame_finish(frame);
    }

    /// Finish the GL stream; issued before entering swap barriers so
    /// the barrier protects completed work
    pub(crate) fn finish(&mut self) {
        self.system.finish();
    }

    pub(crate) fn swap(&mut self) -> ClientResult<()> {
        self.system.swap()
    }

    fn channel_mut(&mut self, id: ObjectId) -> ClientResult<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or(ClientError::NoSuchEntity(id))
    }

    pub(crate) fn channel_config_init(
        &mut self,
        id: ObjectId,
        name: String,
    ) -> ClientResult<()> {
        self.channel_mut(id)?.config_init(name)
    }

    pub(crate) fn channel_config_exit(&mut self, id: ObjectId) -> ClientResult<()> {
        self.channel_mut(id)?.config_exit();
        Ok(())
    }

    pub(crate) fn channel_clear(
        &mut self,
        id: ObjectId,
        context: &RenderContext,
        frame_data: &FrameData,
    ) -> ClientResult<()> {
        let Self {
            channels, system, ..
        } = self;
        channels
            .get_mut(&id)
            .ok_or(ClientError::NoSuchEntity(id))?
            .frame_clear(system.as_mut(), context, frame_data)
    }

    pub(crate) fn channel_draw(
        &mut self,
        id: ObjectId,
        context: &RenderContext,
        frame_data: &FrameData,
    ) -> ClientResult<()> {
        let Self {
            channels, system, ..
        } = self;
        channels
            .get_mut(&id)
            .ok_or(ClientError::NoSuchEntity(id))?
            .frame_draw(system.as_mut(), context, frame_data)
    }

    pub(crate) fn channel_readback(
        &mut self,
        id: ObjectId,
        context: &RenderContext,
        frame_data: &FrameData,
    ) -> ClientResult<ImageFrame> {
        let Self {
            channels, system, ..
        } = self;
        let pixels: Bytes = channels
            .get_mut(&id)
            .ok_or(ClientError::NoSuchEntity(id))?
            .frame_readback(system.as_mut(), context, frame_data)?;
        Ok(ImageFrame {
            pvp: context.pvp,
            pixels,
        })
    }

    pub(crate) fn channel_assemble(
        &mut self,
        id: ObjectId,
        context: &RenderContext,
        frame_data: &FrameData,
        frames: &[ImageFrame],
    ) -> ClientResult<()> {
        let Self {
            channels, system, ..
        } = self;
        channels
            .get_mut(&id)
            .ok_or(ClientError::NoSuchEntity(id))?
            .frame_assemble(system.as_mut(), context, frame_data, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelView;
    use crate::window_system::HeadlessWindow;

    struct Noop;
    impl WindowHandler for Noop {}
    impl ChannelHandler for Noop {
        fn frame_draw(&mut self, _view: &mut ChannelView<'_>) -> ClientResult<()> {
            Ok(())
        }
    }

    #[test]
    fn init_reports_realised_viewport() {
        let mut window = Window::new(
            ObjectId(1),
            Box::<HeadlessWindow>::default(),
            Box::new(Noop),
        );
        let pvp = PixelViewport {
            x: 0,
            y: 0,
            w: 800,
            h: 600,
        };
        let realised = window.config_init("w".into(), pvp).unwrap();
        assert_eq!(realised, pvp);
        assert_eq!(window.pixel_viewport(), pvp);
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let mut window = Window::new(
            ObjectId(1),
            Box::<HeadlessWindow>::default(),
            Box::new(Noop),
        );
        let err = window.channel_config_exit(ObjectId(9)).unwrap_err();
        assert!(matches!(err, ClientError::NoSuchEntity(_)));
    }
}
