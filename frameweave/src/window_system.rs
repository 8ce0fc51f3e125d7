// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The window-system capability boundary.
//!
//! The framework never names a platform: everything it needs from an OS
//! window and its GL context is the [SystemWindow] trait. Platform
//! crates (GLX, WGL, AGL) provide implementations; [HeadlessWindow] is
//! the built-in one for tests, benchmarks and display-less render
//! nodes.

use crate::types::PixelViewport;
use crate::{ClientError, ClientResult};

/// Everything the framework needs from an OS window plus GL context.
///
/// A window is owned by its pipe's task; no call crosses pipes.
pub trait SystemWindow: Send {
    /// Create the window and context. Returns the realised pixel
    /// viewport, which may differ from the requested one.
    fn create(&mut self, pvp: &PixelViewport) -> ClientResult<PixelViewport>;

    /// Destroy the window and context
    fn destroy(&mut self);

    /// Make the GL context current on the calling task
    fn make_current(&mut self) -> ClientResult<()>;

    /// Swap front and back buffers
    fn swap(&mut self) -> ClientResult<()>;

    /// Finish the GL command stream; called before entering swap
    /// barriers
    fn finish(&mut self) {}

    /// Bind the window's draw framebuffer
    fn bind_frame_buffer(&mut self) -> ClientResult<()> {
        Ok(())
    }

    /// The realised pixel viewport
    fn pixel_viewport(&self) -> PixelViewport;
}

/// A window without a display: creation always succeeds at the
/// requested geometry, swaps are counted and otherwise no-ops
#[derive(Debug, Default)]
pub struct HeadlessWindow {
    pvp: PixelViewport,
    created: bool,
    /// Number of buffer swaps issued on this window
    pub swap_count: u64,
    /// Number of finish calls issued on this window
    pub finish_count: u64,
}

impl SystemWindow for HeadlessWindow {
    fn create(&mut self, pvp: &PixelViewport) -> ClientResult<PixelViewport> {
        if !pvp.is_valid() {
            return Err(ClientError::WindowSystem(format!(
                "refusing window with invalid viewport {pvp:?}"
            )));
        }
        self.pvp = *pvp;
        self.created = true;
        Ok(self.pvp)
    }

    fn destroy(&mut self) {
        self.created = false;
    }

    fn make_current(&mut self) -> ClientResult<()> {
        if !self.created {
            return Err(ClientError::WindowSystem("window not created".into()));
        }
        Ok(())
    }

    fn swap(&mut self) -> ClientResult<()> {
        if !self.created {
            return Err(ClientError::WindowSystem("window not created".into()));
        }
        self.swap_count += 1;
        Ok(())
    }

    fn finish(&mut self) {
        self.finish_count += 1;
    }

    fn pixel_viewport(&self) -> PixelViewport {
        self.pvp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_window_reports_requested_geometry() {
        let mut window = HeadlessWindow::default();
        let pvp = PixelViewport {
            x: 0,
            y: 0,
            w: 320,
            h: 240,
        };
        assert_eq!(window.create(&pvp).unwrap(), pvp);
        window.swap().unwrap();
        assert_eq!(window.swap_count, 1);
    }

    #[test]
    fn invalid_geometry_is_refused() {
        let mut window = HeadlessWindow::default();
        let pvp = PixelViewport::default();
        assert!(window.create(&pvp).is_err());
    }
}
