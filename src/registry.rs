//! Process-scoped context registry.
//!
//! One [`ContextRuntime`] exists per process. It owns the collaborators every
//! context shares (forest, meta scheduler, operation issuer, transport),
//! hands out unique ids whose allocating process can be recovered from the
//! id alone, and maps context uids to live contexts:
//!
//! - contexts created on this process are held weakly; the owning task keeps
//!   them alive
//! - mirrors of contexts living elsewhere are held strongly until the
//!   original sends [`Message::RemoteContextFree`]
//!
//! Inbound messages are decoded by [`ContextRuntime::handle_message`].
//! Requests are dispatched from latency-priority meta tasks and may block
//! on a round trip to a third process. Responses never block and are
//! dispatched on the delivery thread, so a handler waiting for one cannot be
//! starved by the handlers queued behind it. Blocked request handlers still
//! hold their worker: a pool needs more workers than the depth of request
//! chains it takes part in (one hop for a mirror fetch, two for a version
//! owner request that fetches a mirror first).

use crate::config::{ConfigError, RuntimeConfig};
use crate::context::{InnerContext, TaskContext};
use crate::error::{ContextError, ErrorKind};
use crate::forest::RegionForest;
use crate::operation::OpIssuer;
use crate::runtime::{MetaScheduler, Priority};
use crate::sync::{Event, UserEvent};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{AddressSpace, UniqueId};
use crate::util::DetHashMap;
use crate::wire::Message;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Delivers encoded messages to other processes.
pub trait Transport: Send + Sync {
    /// Sends `bytes` to process `target`.
    ///
    /// Delivery must eventually call [`ContextRuntime::handle_message`] on the
    /// target with this process as the source. Messages between one pair of
    /// processes are delivered in send order.
    fn send(&self, target: AddressSpace, bytes: Vec<u8>);
}

enum ContextSlot {
    Local(Weak<InnerContext>),
    Remote(Arc<InnerContext>),
}

impl ContextSlot {
    fn get(&self) -> Option<Arc<InnerContext>> {
        match self {
            Self::Local(weak) => weak.upgrade(),
            Self::Remote(ctx) => Some(Arc::clone(ctx)),
        }
    }
}

/// Process-wide registry of contexts and shared collaborators.
pub struct ContextRuntime {
    config: RuntimeConfig,
    forest: Arc<dyn RegionForest>,
    scheduler: Arc<dyn MetaScheduler>,
    issuer: Arc<dyn OpIssuer>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_uid: AtomicU64,
    contexts: Mutex<DetHashMap<UniqueId, ContextSlot>>,
    pending_contexts: Mutex<DetHashMap<UniqueId, UserEvent>>,
    self_ref: Weak<Self>,
}

impl ContextRuntime {
    /// Creates the registry for the process named by `config.local_space`.
    pub fn new(
        config: RuntimeConfig,
        forest: Arc<dyn RegionForest>,
        scheduler: Arc<dyn MetaScheduler>,
        issuer: Arc<dyn OpIssuer>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        debug!(
            space = %config.local_space,
            total = config.total_spaces,
            "context runtime created"
        );
        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            forest,
            scheduler,
            issuer,
            transport: RwLock::new(None),
            next_uid: AtomicU64::new(1),
            contexts: Mutex::new(DetHashMap::default()),
            pending_contexts: Mutex::new(DetHashMap::default()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Installs the transport used for outbound messages.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// This process.
    #[must_use]
    pub const fn local_space(&self) -> AddressSpace {
        self.config.local_space
    }

    /// Number of processes.
    #[must_use]
    pub const fn total_spaces(&self) -> u32 {
        self.config.total_spaces
    }

    /// Region forest shared by every context.
    #[must_use]
    pub fn forest(&self) -> &dyn RegionForest {
        &*self.forest
    }

    /// Meta-task scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &dyn MetaScheduler {
        &*self.scheduler
    }

    /// Issuer of runtime-internal operations.
    #[must_use]
    pub fn issuer(&self) -> &dyn OpIssuer {
        &*self.issuer
    }

    /// Allocates a unique id owned by this process.
    ///
    /// Ids are `local + k * total` for increasing `k`, so
    /// [`ContextRuntime::runtime_owner`] recovers the allocating process.
    pub fn next_unique_id(&self) -> UniqueId {
        let k = self.next_uid.fetch_add(1, Ordering::Relaxed);
        UniqueId::new(k * u64::from(self.total_spaces()) + u64::from(self.local_space().as_u32()))
    }

    /// Process that allocated `uid`.
    #[must_use]
    pub fn runtime_owner(&self, uid: UniqueId) -> AddressSpace {
        #[allow(clippy::cast_possible_truncation)]
        let owner = (uid.as_u64() % u64::from(self.total_spaces())) as u32;
        AddressSpace::new(owner)
    }

    pub(crate) fn register_context(&self, ctx: &Arc<InnerContext>) {
        let uid = ctx.context_uid();
        trace!(ctx = %uid, "context registered");
        self.contexts
            .lock()
            .insert(uid, ContextSlot::Local(Arc::downgrade(ctx)));
    }

    pub(crate) fn unregister_context(&self, uid: UniqueId) {
        let mut contexts = self.contexts.lock();
        if matches!(contexts.get(&uid), Some(ContextSlot::Local(_))) {
            contexts.remove(&uid);
            trace!(ctx = %uid, "context unregistered");
        }
    }

    /// Returns the context for `uid` if it is present on this process.
    #[must_use]
    pub fn lookup_context(&self, uid: UniqueId) -> Option<Arc<InnerContext>> {
        self.contexts.lock().get(&uid).and_then(ContextSlot::get)
    }

    /// Returns the context for `uid`, fetching a mirror from its owning
    /// process if needed.
    ///
    /// Concurrent requests for the same uid share one round trip. Blocks
    /// until the mirror arrives.
    pub fn find_context(&self, uid: UniqueId) -> Result<Arc<InnerContext>, ContextError> {
        if let Some(ctx) = self.lookup_context(uid) {
            return Ok(ctx);
        }
        let owner = self.runtime_owner(uid);
        if owner == self.local_space() {
            return Err(ContextError::new(
                ErrorKind::MissingContext,
                format!("context {uid} is not registered on its owning process {owner}"),
            ));
        }
        let (wait_on, send_request) = {
            let mut pending = self.pending_contexts.lock();
            // The response may have landed between the lookup and this lock.
            if let Some(ctx) = self.lookup_context(uid) {
                return Ok(ctx);
            }
            match pending.get(&uid) {
                Some(event) => (event.event(), false),
                None => {
                    let event = UserEvent::new();
                    pending.insert(uid, event.clone());
                    (event.event(), true)
                }
            }
        };
        if send_request {
            debug!(ctx = %uid, owner = %owner, "requesting remote context");
            self.send(
                owner,
                &Message::RemoteContextRequest {
                    context: uid,
                    source: self.local_space(),
                },
            )?;
        }
        wait_on.wait();
        self.lookup_context(uid).ok_or_else(|| {
            ContextError::new(
                ErrorKind::MissingContext,
                format!("context {uid} was freed before its mirror could be used"),
            )
        })
    }

    /// Encodes and sends `msg` to `target`.
    pub fn send(&self, target: AddressSpace, msg: &Message) -> Result<(), ContextError> {
        let bytes = msg.encode()?;
        let transport = self.transport.read().clone().ok_or_else(|| {
            ContextError::new(
                ErrorKind::Wire,
                format!("no transport attached to send {} to {target}", msg.name()),
            )
        })?;
        trace!(kind = msg.name(), target = %target, bytes = bytes.len(), "send");
        transport.send(target, bytes);
        Ok(())
    }

    /// Entry point for bytes delivered by the transport.
    ///
    /// Undecodable messages are dropped with a warning. Responses are
    /// handled before this returns. Everything else is handled in a
    /// latency-priority meta task; the returned event triggers once handling
    /// finished.
    pub fn handle_message(&self, source: AddressSpace, bytes: &[u8]) -> Event {
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(source = %source, error = %err, "dropping undecodable message");
                return Event::NONE;
            }
        };
        let Some(runtime) = self.self_ref.upgrade() else {
            return Event::NONE;
        };
        if msg.is_response() {
            runtime.dispatch_logged(source, msg);
            return Event::NONE;
        }
        self.scheduler.issue(
            Priority::Latency,
            Event::NONE,
            Box::new(move || runtime.dispatch_logged(source, msg)),
        )
    }

    fn dispatch_logged(self: &Arc<Self>, source: AddressSpace, msg: Message) {
        let kind = msg.name();
        if let Err(err) = self.dispatch(source, msg) {
            warn!(source = %source, kind, error = %err, "message handling failed");
        }
    }

    fn dispatch(self: &Arc<Self>, source: AddressSpace, msg: Message) -> Result<(), ContextError> {
        trace!(kind = msg.name(), source = %source, "dispatch");
        match msg {
            Message::VersionOwnerRequest {
                context,
                node,
                source: requester,
            } => {
                let ctx = self.find_context(context)?;
                let owner = ctx.get_version_owner(node, requester)?;
                self.send(
                    requester,
                    &Message::VersionOwnerResponse {
                        context,
                        node,
                        owner,
                    },
                )
            }
            Message::VersionOwnerResponse {
                context,
                node,
                owner,
            } => {
                let ctx = self.require_present(context)?;
                ctx.process_version_owner_response(node, owner);
                Ok(())
            }
            Message::RemoteContextRequest {
                context,
                source: requester,
            } => {
                let ctx = self.require_present(context)?;
                ctx.send_remote_context(requester)
            }
            Message::RemoteContextResponse { payload } => {
                let uid = payload.context;
                let ctx = InnerContext::unpack_remote(self, payload)?;
                self.contexts.lock().insert(uid, ContextSlot::Remote(ctx));
                let waiter = self.pending_contexts.lock().remove(&uid);
                debug!(ctx = %uid, source = %source, "remote context installed");
                if let Some(waiter) = waiter {
                    waiter.trigger();
                }
                Ok(())
            }
            Message::RemoteContextFree { context } => {
                let slot = {
                    let mut contexts = self.contexts.lock();
                    if matches!(contexts.get(&context), Some(ContextSlot::Remote(_))) {
                        contexts.remove(&context)
                    } else {
                        None
                    }
                };
                if slot.is_some() {
                    debug!(ctx = %context, "remote context freed");
                }
                // The mirror is dropped here, outside the registry lock.
                drop(slot);
                Ok(())
            }
            Message::CreateTopViewRequest {
                context,
                manager,
                source: requester,
            } => {
                let ctx = self.find_context(context)?;
                let view = ctx.create_instance_top_view(manager, requester)?;
                self.send(
                    requester,
                    &Message::CreateTopViewResponse {
                        context,
                        manager,
                        view,
                    },
                )
            }
            Message::CreateTopViewResponse {
                context,
                manager,
                view,
            } => {
                let ctx = self.require_present(context)?;
                ctx.process_top_view_response(manager, view);
                Ok(())
            }
        }
    }

    fn require_present(&self, uid: UniqueId) -> Result<Arc<InnerContext>, ContextError> {
        self.lookup_context(uid).ok_or_else(|| {
            ContextError::new(
                ErrorKind::MissingContext,
                format!("context {uid} is not present on {}", self.local_space()),
            )
        })
    }

    /// Number of contexts (local and mirrored) currently registered.
    #[must_use]
    pub fn registered_contexts(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl fmt::Debug for ContextRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRuntime")
            .field("local_space", &self.local_space())
            .field("total_spaces", &self.total_spaces())
            .field("contexts", &self.contexts.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingIssuer, harness_runtime};

    #[test]
    fn uids_encode_their_owner() {
        let runtime = harness_runtime(RuntimeConfig::for_space(2, 3));
        for _ in 0..8 {
            let uid = runtime.next_unique_id();
            assert_eq!(runtime.runtime_owner(uid), AddressSpace::new(2));
        }
    }

    #[test]
    fn locally_owned_unknown_context_is_missing() {
        let runtime = harness_runtime(RuntimeConfig::default());
        let uid = runtime.next_unique_id();
        let err = runtime.find_context(uid).expect_err("nothing registered");
        assert_eq!(err.kind(), ErrorKind::MissingContext);
    }

    #[test]
    fn send_without_transport_fails() {
        let runtime = harness_runtime(RuntimeConfig::for_space(0, 2));
        let err = runtime
            .send(
                AddressSpace::new(1),
                &Message::RemoteContextFree {
                    context: UniqueId::new(4),
                },
            )
            .expect_err("no transport");
        assert_eq!(err.kind(), ErrorKind::Wire);
    }

    #[test]
    fn garbage_messages_are_dropped() {
        let runtime = harness_runtime(RuntimeConfig::default());
        assert!(runtime.handle_message(AddressSpace::new(0), &[0xc1]).is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let forest = Arc::new(crate::test_utils::MemoryForest::new());
        let result = ContextRuntime::new(
            RuntimeConfig::for_space(4, 2),
            forest,
            Arc::new(crate::runtime::InlineScheduler::new()),
            Arc::new(RecordingIssuer::new()),
        );
        assert!(result.is_err());
    }
}
