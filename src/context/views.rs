//! Context-specific views of physical instances.
//!
//! At most one view exists per (context, instance manager). Views of
//! managers owned elsewhere are built on the owning process; the request
//! is made once and concurrent callers wait on the same event. Local
//! construction is deduplicated through `pending_top_views`: the first
//! caller builds, later callers lazily create a shared event and wait.

use super::inner::InnerContext;
use crate::error::{ContextError, ErrorKind};
use crate::sync::{Event, UserEvent};
use crate::tracing_compat::{debug, trace};
use crate::types::{AddressSpace, ManagerId, ViewId};
use crate::wire::Message;

enum LocalStep {
    Done(ViewId),
    Wait(Event),
    Build,
}

impl InnerContext {
    /// The view of `manager` in this context, building it if needed.
    ///
    /// `source` is the process the request originated from. Blocks while
    /// another caller builds the same view or while a remote owner answers.
    pub fn create_instance_top_view(
        &self,
        manager: ManagerId,
        source: AddressSpace,
    ) -> Result<ViewId, ContextError> {
        let owner = self.forest().manager_owner(manager);
        if owner == self.runtime().local_space() {
            Ok(self.create_local_top_view(manager, source))
        } else {
            self.request_remote_top_view(manager, owner)
        }
    }

    fn create_local_top_view(&self, manager: ManagerId, source: AddressSpace) -> ViewId {
        loop {
            let step = {
                let mut state = self.lock();
                if let Some(view) = state.ext.top_views.get(&manager) {
                    LocalStep::Done(*view)
                } else if let Some(waiters) = state.ext.pending_top_views.get_mut(&manager) {
                    LocalStep::Wait(waiters.get_or_insert_with(UserEvent::new).event())
                } else {
                    state.ext.pending_top_views.insert(manager, None);
                    LocalStep::Build
                }
            };
            match step {
                LocalStep::Done(view) => return view,
                LocalStep::Wait(event) => {
                    trace!(ctx = %self.uid(), %manager, "waiting for view construction");
                    event.wait();
                }
                LocalStep::Build => {
                    let view = self.forest().create_instance_top_view(manager, self.uid(), source);
                    let waiters = {
                        let mut state = self.lock();
                        state.ext.top_views.insert(manager, view);
                        state.ext.pending_top_views.remove(&manager).flatten()
                    };
                    debug!(ctx = %self.uid(), %manager, %view, "top view built");
                    if let Some(waiters) = waiters {
                        waiters.trigger();
                    }
                    return view;
                }
            }
        }
    }

    fn request_remote_top_view(&self, manager: ManagerId, owner: AddressSpace) -> Result<ViewId, ContextError> {
        let (wait_on, send_request) = {
            let mut state = self.lock();
            if let Some(view) = state.ext.top_views.get(&manager) {
                return Ok(*view);
            }
            match state.ext.pending_remote_views.get(&manager) {
                Some(pending) => (pending.event(), false),
                None => {
                    let pending = UserEvent::new();
                    state.ext.pending_remote_views.insert(manager, pending.clone());
                    (pending.event(), true)
                }
            }
        };
        if send_request {
            debug!(ctx = %self.uid(), %manager, %owner, "requesting remote top view");
            let sent = self.runtime().send(
                owner,
                &Message::CreateTopViewRequest {
                    context: self.uid(),
                    manager,
                    source: self.runtime().local_space(),
                },
            );
            if let Err(err) = sent {
                let pending = self.lock().ext.pending_remote_views.remove(&manager);
                if let Some(pending) = pending {
                    pending.trigger();
                }
                return Err(err);
            }
        }
        wait_on.wait();
        self.lock().ext.top_views.get(&manager).copied().ok_or_else(|| {
            ContextError::new(
                ErrorKind::MissingContext,
                format!("view request for {manager} in context {} was abandoned", self.uid()),
            )
        })
    }

    /// Installs a view built by the manager's owner and wakes its waiters.
    pub fn process_top_view_response(&self, manager: ManagerId, view: ViewId) {
        let pending = {
            let mut state = self.lock();
            state.ext.top_views.insert(manager, view);
            state.ext.pending_remote_views.remove(&manager)
        };
        debug!(ctx = %self.uid(), %manager, %view, "remote top view received");
        if let Some(pending) = pending {
            pending.trigger();
        }
    }

    /// The instance behind `manager` was deleted; forget its view.
    ///
    /// Returns the evicted view, if one was cached.
    pub fn notify_instance_deletion(&self, manager: ManagerId) -> Option<ViewId> {
        let evicted = self.lock().ext.top_views.remove(&manager);
        if let Some(view) = evicted {
            trace!(ctx = %self.uid(), %manager, %view, "top view evicted");
        }
        evicted
    }

    /// Cached view of `manager`, if any.
    #[must_use]
    pub fn cached_top_view(&self, manager: ManagerId) -> Option<ViewId> {
        self.lock().ext.top_views.get(&manager).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::core::TaskRegions;
    use crate::operation::OwnerTask;
    use crate::test_utils::{MemoryForest, RecordingOwner, harness_runtime_with};
    use std::sync::Arc;

    fn context(forest: &Arc<MemoryForest>, space: u32, total: u32) -> (Arc<RecordingOwner>, Arc<InnerContext>) {
        let runtime = harness_runtime_with(RuntimeConfig::for_space(space, total), Arc::clone(forest));
        let owner = RecordingOwner::new(&runtime, "viewer");
        let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
        let ctx = InnerContext::new(&runtime, &dyn_owner, TaskRegions::default());
        (owner, ctx)
    }

    #[test]
    fn local_views_are_built_once() {
        let forest = Arc::new(MemoryForest::new());
        let (_owner, ctx) = context(&forest, 0, 1);
        let local = AddressSpace::new(0);
        let first = ctx.create_instance_top_view(ManagerId(4), local).expect("view");
        let second = ctx.create_instance_top_view(ManagerId(4), local).expect("view");
        assert_eq!(first, second);
        assert_eq!(forest.views_built(ManagerId(4)), 1);
        assert_ne!(ctx.create_instance_top_view(ManagerId(5), local).expect("view"), first);
    }

    #[test]
    fn deletion_evicts_and_forces_a_rebuild() {
        let forest = Arc::new(MemoryForest::new());
        let (_owner, ctx) = context(&forest, 0, 1);
        let local = AddressSpace::new(0);
        let view = ctx.create_instance_top_view(ManagerId(1), local).expect("view");
        assert_eq!(ctx.notify_instance_deletion(ManagerId(1)), Some(view));
        assert_eq!(ctx.cached_top_view(ManagerId(1)), None);
        assert_eq!(ctx.notify_instance_deletion(ManagerId(1)), None);
        ctx.create_instance_top_view(ManagerId(1), local).expect("view");
        assert_eq!(forest.views_built(ManagerId(1)), 2);
    }

    #[test]
    fn remote_response_fills_the_cache() {
        let forest = Arc::new(MemoryForest::new());
        forest.set_manager_owner(ManagerId(8), AddressSpace::new(1));
        let (_owner, ctx) = context(&forest, 0, 2);
        ctx.process_top_view_response(ManagerId(8), ViewId(99));
        assert_eq!(
            ctx.create_instance_top_view(ManagerId(8), AddressSpace::new(0)),
            Ok(ViewId(99))
        );
        assert_eq!(forest.views_built(ManagerId(8)), 0);
    }

    #[test]
    fn unsendable_remote_request_fails() {
        let forest = Arc::new(MemoryForest::new());
        forest.set_manager_owner(ManagerId(8), AddressSpace::new(1));
        let (_owner, ctx) = context(&forest, 0, 2);
        let err = ctx
            .create_instance_top_view(ManagerId(8), AddressSpace::new(0))
            .expect_err("no transport");
        assert_eq!(err.kind(), ErrorKind::Wire);
        assert!(ctx.lock().ext.pending_remote_views.is_empty());
    }
}
