// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Server-side window controllers.
//!
//! Besides the uniform split-phase init/exit, the window is where swap
//! synchronisation attaches: the planner assigns each window to at most
//! one swap group, and the per-frame update makes the window finish its
//! GL stream, enter the group's barrier and only then swap.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use frameweave::commands::WindowCommand;
use frameweave::types::PixelViewport;
use frameweave_net::{ObjectId, RequestId};

use crate::channel::ServerChannel;
use crate::config::SendCtx;
use crate::spec::WindowSpec;
use crate::{EntityState, ServerResult};

/// The server-side mirror of one render window
pub struct ServerWindow {
    name: String,
    pvp: Mutex<PixelViewport>,
    channels: Vec<Arc<ServerChannel>>,
    swap_group: Mutex<Option<String>>,
    oid: Mutex<ObjectId>,
    state: Mutex<EntityState>,
    used: AtomicU32,
    pending: Mutex<Option<RequestId>>,
    error: Mutex<String>,
}

impl ServerWindow {
    pub(crate) fn new(spec: &WindowSpec) -> Self {
        Self {
            name: spec.name.clone(),
            pvp: Mutex::new(spec.pvp),
            channels: spec.channels.iter().map(|c| Arc::new(ServerChannel::new(c))).collect(),
            swap_group: Mutex::new(None),
            oid: Mutex::new(ObjectId::INVALID),
            state: Mutex::new(EntityState::Stopped),
            used: AtomicU32::new(0),
            pending: Mutex::new(None),
            error: Mutex::new(String::new()),
        }
    }

    /// The window's configured name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The window's entity object id
    pub fn id(&self) -> ObjectId {
        *self.oid.lock().expect("window oid lock poisoned")
    }

    pub(crate) fn set_id(&self, id: ObjectId) {
        *self.oid.lock().expect("window oid lock poisoned") = id;
    }

    /// The window's channels
    pub fn channels(&self) -> &[Arc<ServerChannel>] {
        &self.channels
    }

    /// The realised pixel viewport, updated from the init reply
    pub fn pixel_viewport(&self) -> PixelViewport {
        *self.pvp.lock().expect("window pvp lock poisoned")
    }

    pub(crate) fn set_pixel_viewport(&self, pvp: PixelViewport) {
        if pvp.is_valid() {
            *self.pvp.lock().expect("window pvp lock poisoned") = pvp;
        }
    }

    /// The swap group assigned by the planner, if any
    pub fn swap_group(&self) -> Option<String> {
        self.swap_group
            .lock()
            .expect("window swap lock poisoned")
            .clone()
    }

    pub(crate) fn set_swap_group(&self, group: Option<String>) {
        *self.swap_group.lock().expect("window swap lock poisoned") = group;
    }

    /// The window's lifecycle state
    pub fn state(&self) -> EntityState {
        *self.state.lock().expect("window state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: EntityState) {
        *self.state.lock().expect("window state lock poisoned") = state;
    }

    /// Is any channel of this window used?
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn set_used(&self, used: u32) {
        self.used.store(used, Ordering::Relaxed);
    }

    /// The last failure reported for this window
    pub fn error_message(&self) -> String {
        self.error.lock().expect("window error lock poisoned").clone()
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        *self.error.lock().expect("window error lock poisoned") = message.into();
    }

    /// Look up a used channel by name
    pub fn channel_by_name(&self, name: &str) -> Option<Arc<ServerChannel>> {
        self.channels
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub(crate) fn start_init(&self, ctx: &SendCtx<'_>) -> ServerResult<()> {
        self.set_state(EntityState::Initialising);
        let request = ctx.requests.register();
        *self.pending.lock().expect("window pending lock poisoned") = Some(request);
        WindowCommand::ConfigInit {
            request,
            pvp: self.pixel_viewport(),
            name: self.name.clone(),
        }
        .send(ctx.session, ctx.node, self.id())?;

        for channel in &self.channels {
            if channel.is_used() {
                WindowCommand::CreateChannel {
                    channel: channel.id(),
                }
                .send(ctx.session, ctx.node, self.id())?;
                channel.start_init(ctx)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn sync_init(&self, ctx: &SendCtx<'_>) -> bool {
        let mut success = true;
        for channel in &self.channels {
            if channel.is_used() && !channel.sync_init(ctx).await {
                self.set_error(format!(
                    "channel '{}': {}",
                    channel.name(),
                    channel.error_message()
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
        for channel in &self.channels {
            if channel.state() != EntityState::Stopped {
                channel.start_exit(ctx)?;
            }
        }
        let request = ctx.requests.register();
        *self.pending.lock().expect("window pending lock poisoned") = Some(request);
        WindowCommand::ConfigExit { request }.send(ctx.session, ctx.node, self.id())?;
        Ok(())
    }

    pub(crate) async fn sync_exit(&self, ctx: &SendCtx<'_>) -> bool {
        let mut success = true;
        for channel in &self.channels {
            if channel.state() == EntityState::Stopping && !channel.sync_exit(ctx).await {
                success = false;
            }
            if channel.is_used() {
                WindowCommand::DestroyChannel {
                    channel: channel.id(),
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
        self.set_state(EntityState::Stopped);
        success
    }

    fn take_pending(&self) -> Option<RequestId> {
        self.pending
            .lock()
            .expect("window pending lock poisoned")
            .take()
    }
}
