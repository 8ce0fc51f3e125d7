// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Server-side pipe controllers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use frameweave::commands::{NodeCommand, PipeCommand};
use frameweave_net::{ObjectId, RequestId};

use crate::config::SendCtx;
use crate::spec::PipeSpec;
use crate::window::ServerWindow;
use crate::{EntityState, ServerResult};

/// The server-side mirror of one render pipe
pub struct ServerPipe {
    name: String,
    device: u32,
    windows: Vec<Arc<ServerWindow>>,
    oid: Mutex<ObjectId>,
    state: Mutex<EntityState>,
    used: AtomicU32,
    pending: Mutex<Option<RequestId>>,
    error: Mutex<String>,
}

impl ServerPipe {
    pub(crate) fn new(spec: &PipeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            device: spec.device,
            windows: spec.windows.iter().map(|w| Arc::new(ServerWindow::new(w))).collect(),
            oid: Mutex::new(ObjectId::INVALID),
            state: Mutex::new(EntityState::Stopped),
            used: AtomicU32::new(0),
            pending: Mutex::new(None),
            error: Mutex::new(String::new()),
        }
    }

    /// The pipe's configured name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The GPU / display index of this pipe
    pub fn device(&self) -> u32 {
        self.device
    }

    /// The pipe's entity object id
    pub fn id(&self) -> ObjectId {
        *self.oid.lock().expect("pipe oid lock poisoned")
    }

    pub(crate) fn set_id(&self, id: ObjectId) {
        *self.oid.lock().expect("pipe oid lock poisoned") = id;
    }

    /// The pipe's windows
    pub fn windows(&self) -> &[Arc<ServerWindow>] {
        &self.windows
    }

    /// Number of used windows; drives the `make_current` hint
    pub fn used_windows(&self) -> usize {
        self.windows.iter().filter(|w| w.is_used()).count()
    }

    /// The pipe's lifecycle state
    pub fn state(&self) -> EntityState {
        *self.state.lock().expect("pipe state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: EntityState) {
        *self.state.lock().expect("pipe state lock poisoned") = state;
    }

    /// Is any window of this pipe used?
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn set_used(&self, used: u32) {
        self.used.store(used, Ordering::Relaxed);
    }

    /// The last failure reported for this pipe
    pub fn error_message(&self) -> String {
        self.error.lock().expect("pipe error lock poisoned").clone()
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        *self.error.lock().expect("pipe error lock poisoned") = message.into();
    }

    pub(crate) fn start_init(&self, ctx: &SendCtx<'_>) -> ServerResult<()> {
        self.set_state(EntityState::Initialising);
        let request = ctx.requests.register();
        *self.pending.lock().expect("pipe pending lock poisoned") = Some(request);
        PipeCommand::ConfigInit {
            request,
            device: self.device,
            name: self.name.clone(),
        }
        .send(ctx.session, ctx.node, self.id())?;

        for window in &self.windows {
            if window.is_used() {
                PipeCommand::CreateWindow {
                    window: window.id(),
                }
                .send(ctx.session, ctx.node, self.id())?;
                window.start_init(ctx)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn sync_init(&self, ctx: &SendCtx<'_>) -> bool {
        let mut success = true;
        for window in &self.windows {
            if window.is_used() && !window.sync_init(ctx).await {
                self.set_error(format!(
                    "window '{}': {}",
                    window.name(),
                    window.error_message()
                ));
                success = false;
            }
        }
        match self.take_pending() {
            Some(request) => match ctx.requests.wait_timeout(request, ctx.timeout).await {
                Ok(value) if value.is_success() && success => {
                    self.set_state(EntityState::Running);
                    true
                }
                Ok(_) => {
                    self.set_state(EntityState::Stopping);
                    false
                }
                Err(err) => {
                    self.set_error(err.to_string());
                    self.set_state(EntityState::Stopping);
                    false
                }
            },
            None => success,
        }
    }

    pub(crate) fn start_exit(&self, ctx: &SendCtx<'_>) -> ServerResult<()> {
        self.set_state(EntityState::Stopping);
        for window in &self.windows {
            if window.state() != EntityState::Stopped {
                window.start_exit(ctx)?;
            }
        }
        let request = ctx.requests.register();
        *self.pending.lock().expect("pipe pending lock poisoned") = Some(request);
        PipeCommand::ConfigExit { request }.send(ctx.session, ctx.node, self.id())?;
        Ok(())
    }

    pub(crate) async fn sync_exit(&self, ctx: &SendCtx<'_>, node_oid: ObjectId) -> bool {
        let mut success = true;
        for window in &self.windows {
            if window.state() == EntityState::Stopping && !window.sync_exit(ctx).await {
                success = false;
            }
            if window.is_used() {
                PipeCommand::DestroyWindow {
                    window: window.id(),
                }
                .send(ctx.session, ctx.node, self.id())
                .ok();
            }
        }
        if let Some(request) = self.take_pending() {
            success &= ctx
                .requests
                .wait_timeout(request, ctx.timeout)
                .await
                .map(|v| v.is_success())
                .unwrap_or(false);
        }
        NodeCommand::DestroyPipe { pipe: self.id() }
            .send(ctx.session, ctx.node, node_oid)
            .ok();
        self.set_state(EntityState::Stopped);
        success
    }

    fn take_pending(&self) -> Option<RequestId> {
        self.pending
            .lock()
            .expect("pipe pending lock poisoned")
            .take()
    }
}
