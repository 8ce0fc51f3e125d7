// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Server-side channel controllers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use frameweave::commands::ChannelCommand;
use frameweave_net::{ObjectId, RequestId};

use crate::config::SendCtx;
use crate::spec::ChannelSpec;
use crate::{EntityState, ServerResult};

/// The server-side mirror of one render channel
pub struct ServerChannel {
    name: String,
    oid: Mutex<ObjectId>,
    state: Mutex<EntityState>,
    used: AtomicU32,
    pending: Mutex<Option<RequestId>>,
    error: Mutex<String>,
}

impl ServerChannel {
    pub(crate) fn new(spec: &ChannelSpec) -> Self {
        Self {
            name: spec.name.clone(),
            oid: Mutex::new(ObjectId::INVALID),
            state: Mutex::new(EntityState::Stopped),
            used: AtomicU32::new(0),
            pending: Mutex::new(None),
            error: Mutex::new(String::new()),
        }
    }

    /// The channel's configured name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The channel's entity object id
    pub fn id(&self) -> ObjectId {
        *self.oid.lock().expect("channel oid lock poisoned")
    }

    pub(crate) fn set_id(&self, id: ObjectId) {
        *self.oid.lock().expect("channel oid lock poisoned") = id;
    }

    /// The channel's lifecycle state
    pub fn state(&self) -> EntityState {
        *self.state.lock().expect("channel state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: EntityState) {
        *self.state.lock().expect("channel state lock poisoned") = state;
    }

    /// Is the channel referenced by an active compound?
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn set_used(&self, used: u32) {
        self.used.store(used, Ordering::Relaxed);
    }

    /// The last failure reported for this channel
    pub fn error_message(&self) -> String {
        self.error.lock().expect("channel error lock poisoned").clone()
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        *self.error.lock().expect("channel error lock poisoned") = message.into();
    }

    pub(crate) fn start_init(&self, ctx: &SendCtx<'_>) -> ServerResult<()> {
        self.set_state(EntityState::Initialising);
        let request = ctx.requests.register();
        *self.pending.lock().expect("channel pending lock poisoned") = Some(request);
        ChannelCommand::ConfigInit {
            request,
            name: self.name.clone(),
        }
        .send(ctx.session, ctx.node, self.id())?;
        Ok(())
    }

    pub(crate) async fn sync_init(&self, ctx: &SendCtx<'_>) -> bool {
        match self.take_pending() {
            Some(request) => match ctx.requests.wait_timeout(request, ctx.timeout).await {
                Ok(value) if value.is_success() => {
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
            None => true,
        }
    }

    pub(crate) fn start_exit(&self, ctx: &SendCtx<'_>) -> ServerResult<()> {
        self.set_state(EntityState::Stopping);
        let request = ctx.requests.register();
        *self.pending.lock().expect("channel pending lock poisoned") = Some(request);
        ChannelCommand::ConfigExit { request }.send(ctx.session, ctx.node, self.id())?;
        Ok(())
    }

    pub(crate) async fn sync_exit(&self, ctx: &SendCtx<'_>) -> bool {
        let ok = match self.take_pending() {
            Some(request) => ctx
                .requests
                .wait_timeout(request, ctx.timeout)
                .await
                .map(|v| v.is_success())
                .unwrap_or(false),
            None => true,
        };
        self.set_state(EntityState::Stopped);
        ok
    }

    fn take_pending(&self) -> Option<RequestId> {
        self.pending
            .lock()
            .expect("channel pending lock poisoned")
            .take()
    }
}
