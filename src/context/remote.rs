//! Remote mirrors of contexts.
//!
//! When a child runs on another process, that process needs enough of the
//! parent's context to check privileges and resolve regions. The original
//! packs itself into a [`RemoteContextPayload`]; the receiving runtime
//! unpacks it into an [`InnerContext`] of the remote flavor and keeps it
//! until the original is dropped and sends a free message.
//!
//! Mirrors never own the original's state. Version ownership questions go
//! back to the original's process; a mirror of a task context finds its own
//! parent lazily through the runtime.

use super::core::TaskRegions;
use super::inner::{InnerContext, Variant};
use super::TaskContext;
use crate::error::{ContextError, ErrorKind};
use crate::forest::RegionForest;
use crate::operation::TaskInfo;
use crate::registry::ContextRuntime;
use crate::sync::EventId;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{AddressSpace, UniqueId};
use crate::wire::{LocalFieldInfo, Message, RemoteContextBody, RemoteContextPayload, VersionBlob};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// What a mirror knows beyond the shared core.
pub(crate) struct RemoteInfo {
    pub(crate) top_level: bool,
    parent_uid: Option<UniqueId>,
    parent: Mutex<Option<Weak<InnerContext>>>,
    versions: Vec<VersionBlob>,
    completion: EventId,
    /// Fields this process allocated while unpacking; freed with the mirror.
    allocated_fields: Vec<LocalFieldInfo>,
}

impl RemoteInfo {
    fn top_level() -> Self {
        Self {
            top_level: true,
            parent_uid: None,
            parent: Mutex::new(None),
            versions: Vec::new(),
            completion: EventId::NONE,
            allocated_fields: Vec::new(),
        }
    }

    pub(crate) fn free_local_fields(&self, forest: &dyn RegionForest) {
        for field in &self.allocated_fields {
            forest.free_field(field.handle, field.fid);
        }
    }
}

impl InnerContext {
    /// Parent of a mirror, resolved once through the runtime and cached.
    pub(crate) fn remote_parent(&self, info: &RemoteInfo) -> Option<Arc<Self>> {
        let parent_uid = info.parent_uid?;
        if let Some(parent) = info.parent.lock().as_ref().and_then(Weak::upgrade) {
            return Some(parent);
        }
        match self.runtime().find_context(parent_uid) {
            Ok(parent) => {
                *info.parent.lock() = Some(Arc::downgrade(&parent));
                Some(parent)
            }
            Err(err) => {
                warn!(ctx = %self.uid(), parent = %parent_uid, error = %err, "mirror parent unavailable");
                None
            }
        }
    }

    /// Snapshot of this context for process `target`.
    ///
    /// The top-level context sends only its uid. A task context sends its
    /// requirements, the owner's version state per region, every local
    /// field visible to it and its parent's uid.
    pub fn pack_remote_context(&self, target: AddressSpace) -> Result<RemoteContextPayload, ContextError> {
        let uid = self.uid();
        let top_level = RemoteContextPayload {
            context: uid,
            top_level: true,
            body: None,
        };
        let body = match &self.variant {
            Variant::TopLevel => return Ok(top_level),
            Variant::Remote(info) if info.top_level => return Ok(top_level),
            Variant::Remote(info) => {
                let parent_context = info.parent_uid.ok_or_else(|| self.missing("parent"))?;
                self.body(info.versions.clone(), self.local_fields(), info.completion, parent_context)
            }
            Variant::Task => {
                let owner = self.owner().ok_or_else(|| self.missing("owner"))?;
                let parent = self.find_parent_context().ok_or_else(|| self.missing("parent"))?;
                let versions = self
                    .virtual_mapped
                    .iter()
                    .enumerate()
                    .map(|(idx, &full)| VersionBlob {
                        full,
                        bytes: owner.pack_version_state(idx, full),
                    })
                    .collect();
                let mut local_fields = Vec::new();
                self.find_enclosing_local_fields(&mut local_fields);
                self.body(
                    versions,
                    local_fields,
                    owner.completion_event().id(),
                    parent.context_uid(),
                )
            }
        };
        trace!(ctx = %uid, %target, regions = body.regions.len(), "context packed");
        Ok(RemoteContextPayload {
            context: uid,
            top_level: false,
            body: Some(body),
        })
    }

    fn body(
        &self,
        versions: Vec<VersionBlob>,
        local_fields: Vec<LocalFieldInfo>,
        completion: EventId,
        parent_context: UniqueId,
    ) -> RemoteContextBody {
        RemoteContextBody {
            task: self.info().clone(),
            regions: self.regions.clone(),
            indexes: self.indexes.clone(),
            parent_req_indexes: self.parent_req_indexes.clone(),
            virtual_mapped: self.virtual_mapped.clone(),
            versions,
            local_fields,
            completion,
            parent_context,
        }
    }

    fn missing(&self, what: &str) -> ContextError {
        ContextError::new(
            ErrorKind::MissingContext,
            format!("cannot pack task {}: its {what} is gone", self.info()),
        )
    }

    /// Answers a mirror request from `requester`.
    ///
    /// Originals remember every process they sent a mirror to and free the
    /// mirrors when dropped.
    pub fn send_remote_context(&self, requester: AddressSpace) -> Result<(), ContextError> {
        let payload = self.pack_remote_context(requester)?;
        self.runtime()
            .send(requester, &Message::RemoteContextResponse { payload })?;
        if matches!(self.variant, Variant::Task | Variant::TopLevel) {
            self.lock().ext.remote_instances.insert(requester);
        }
        debug!(ctx = %self.uid(), %requester, "context mirror sent");
        Ok(())
    }

    /// Builds a mirror from `payload`.
    ///
    /// Local fields of the original are allocated here too and freed when
    /// the mirror drops. The caller registers the mirror.
    pub fn unpack_remote(
        runtime: &Arc<ContextRuntime>,
        payload: RemoteContextPayload,
    ) -> Result<Arc<Self>, ContextError> {
        let uid = payload.context;
        if payload.top_level {
            let info = TaskInfo::new(uid, "top_level", -1);
            let ctx = Self::build(
                runtime,
                info,
                None,
                TaskRegions::default(),
                Variant::Remote(RemoteInfo::top_level()),
            );
            trace!(ctx = %uid, "top-level mirror unpacked");
            return Ok(ctx);
        }
        let body = payload.body.ok_or_else(|| {
            ContextError::new(
                ErrorKind::Wire,
                format!("mirror of context {uid} carries no body"),
            )
        })?;
        let forest = runtime.forest();
        let allocated_fields: Vec<LocalFieldInfo> = body
            .local_fields
            .iter()
            .filter(|field| forest.allocate_field(field.handle, field.fid, field.field_size, field.serdez, true))
            .copied()
            .collect();
        let setup = TaskRegions::new(body.regions)
            .with_indexes(body.indexes)
            .with_parent_indexes(body.parent_req_indexes)
            .with_virtual_mapped(body.virtual_mapped);
        let remote = RemoteInfo {
            top_level: false,
            parent_uid: Some(body.parent_context),
            parent: Mutex::new(None),
            versions: body.versions,
            completion: body.completion,
            allocated_fields,
        };
        let ctx = Self::build(runtime, body.task, None, setup, Variant::Remote(remote));
        ctx.lock().local_fields = body.local_fields;
        debug!(ctx = %uid, regions = ctx.regions().len(), "context mirror unpacked");
        Ok(ctx)
    }

    /// Version state the original sent, one blob per region. Empty for
    /// anything but a mirror of a task context.
    #[must_use]
    pub fn remote_versions(&self) -> &[VersionBlob] {
        match &self.variant {
            Variant::Remote(info) => &info.versions,
            Variant::Task | Variant::TopLevel => &[],
        }
    }

    /// Completion event of the mirrored task, if this is a mirror.
    #[must_use]
    pub fn remote_completion(&self) -> Option<EventId> {
        match &self.variant {
            Variant::Remote(info) if !info.top_level => Some(info.completion),
            _ => None,
        }
    }

    /// Processes a mirror of this context was sent to.
    #[must_use]
    pub fn remote_instances(&self) -> Vec<AddressSpace> {
        self.lock().ext.remote_instances.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::ContextKind;
    use crate::operation::OwnerTask;
    use crate::sync::UserEvent;
    use crate::test_utils::{MemoryForest, RecordingOwner, harness_runtime_with};
    use crate::types::{Coherence, FieldSpace, PrivilegeMode, RegionRequirement};

    #[test]
    fn task_context_round_trips_into_a_mirror() {
        let origin_forest = Arc::new(MemoryForest::new());
        let region = origin_forest.new_tree(3);
        let origin = harness_runtime_with(RuntimeConfig::for_space(0, 2), Arc::clone(&origin_forest));
        let owner = RecordingOwner::new(&origin, "stencil");
        let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
        let req = RegionRequirement::region(region, PrivilegeMode::READ_WRITE, Coherence::Exclusive, region)
            .with_fields([1]);
        let setup = TaskRegions::new(vec![req.clone()]).with_virtual_mapped(vec![true]);
        let ctx = InnerContext::new(&origin, &dyn_owner, setup);
        let reclaim = UserEvent::new();
        let field = ctx.add_local_field(FieldSpace::new(3), 40, 8, 0, reclaim.event());

        let payload = ctx.pack_remote_context(AddressSpace::new(1)).expect("pack");
        assert!(!payload.top_level);
        let body = payload.body.as_ref().expect("task body");
        assert_eq!(body.versions.len(), 1);
        assert!(body.versions[0].full);
        assert_eq!(body.versions[0].bytes, owner.pack_version_state(0, true));
        assert_eq!(body.completion, owner.completion_event().id());

        let mirror_forest = Arc::new(MemoryForest::new());
        let mirror_runtime = harness_runtime_with(RuntimeConfig::for_space(1, 2), Arc::clone(&mirror_forest));
        let mirror = InnerContext::unpack_remote(&mirror_runtime, payload).expect("unpack");
        assert_eq!(mirror.context_kind(), ContextKind::Remote);
        assert_eq!(mirror.uid(), ctx.uid());
        assert_eq!(mirror.regions(), &[req]);
        assert_eq!(mirror.virtual_mapped(), &[true]);
        assert_eq!(mirror.local_fields(), vec![field]);
        assert_eq!(mirror.remote_versions().len(), 1);
        assert_eq!(mirror.remote_completion(), Some(owner.completion_event().id()));
        assert!(mirror_forest.is_field_allocated(FieldSpace::new(3), 40));

        drop(mirror);
        assert!(!mirror_forest.is_field_allocated(FieldSpace::new(3), 40));
        reclaim.trigger();
    }

    #[test]
    fn top_level_mirror_is_its_own_top() {
        let forest = Arc::new(MemoryForest::new());
        let origin = harness_runtime_with(RuntimeConfig::for_space(0, 2), Arc::clone(&forest));
        let top = InnerContext::new_top_level(&origin);
        let payload = top.pack_remote_context(AddressSpace::new(1)).expect("pack");
        assert!(payload.top_level && payload.body.is_none());

        let remote = harness_runtime_with(RuntimeConfig::for_space(1, 2), Arc::new(MemoryForest::new()));
        let mirror = InnerContext::unpack_remote(&remote, payload).expect("unpack");
        assert_eq!(mirror.info().depth, -1);
        assert!(mirror.find_parent_context().is_none());
        assert!(mirror.find_top_context().is_some_and(|t| t.uid() == top.uid()));
        assert_eq!(mirror.remote_completion(), None);

        let repacked = mirror.pack_remote_context(AddressSpace::new(0)).expect("repack");
        assert!(repacked.top_level);
    }

    #[test]
    fn bodyless_task_payload_is_rejected() {
        let runtime = harness_runtime_with(RuntimeConfig::for_space(1, 2), Arc::new(MemoryForest::new()));
        let payload = RemoteContextPayload {
            context: UniqueId::new(6),
            top_level: false,
            body: None,
        };
        let err = InnerContext::unpack_remote(&runtime, payload).expect_err("no body");
        assert_eq!(err.kind(), ErrorKind::Wire);
    }

    #[test]
    fn unsent_mirror_is_not_recorded() {
        let runtime = harness_runtime_with(RuntimeConfig::for_space(0, 2), Arc::new(MemoryForest::new()));
        let top = InnerContext::new_top_level(&runtime);
        assert!(top.send_remote_context(AddressSpace::new(1)).is_err());
        assert!(top.remote_instances().is_empty());
    }
}
