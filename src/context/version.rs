//! Version ownership of region-tree nodes.
//!
//! For every node a context's children touch, exactly one process holds the
//! authoritative version state. The context that owns the region decides:
//! the first process to ask becomes the owner. Every other context variant
//! asks the deciding process once and caches the answer; concurrent askers
//! share one request.

use super::inner::{InnerContext, Variant, VersionOwner};
use crate::error::{ContextError, ErrorKind};
use crate::sync::UserEvent;
use crate::tracing_compat::{debug, trace};
use crate::types::{AddressSpace, RegionTreeNode};
use crate::wire::Message;

impl InnerContext {
    /// Process holding the version state of `node` for this context.
    ///
    /// `source` is the process asking. A task context assigns ownership to
    /// the first asker. The top-level context assigns for nodes created on
    /// this process and asks the node's owner otherwise. A remote mirror asks
    /// the process its original lives on. May block on a round trip.
    pub fn get_version_owner(
        &self,
        node: RegionTreeNode,
        source: AddressSpace,
    ) -> Result<AddressSpace, ContextError> {
        let local = self.runtime().local_space();
        match &self.variant {
            Variant::Task => Ok(self.assign_version_owner(node, source)),
            Variant::TopLevel => {
                let owner_space = self.forest().node_owner(node);
                if owner_space == local {
                    Ok(self.assign_version_owner(node, source))
                } else {
                    self.request_version_owner(node, owner_space)
                }
            }
            Variant::Remote(info) => {
                let owner_space = self.forest().node_owner(node);
                if info.top_level && owner_space == local {
                    return Ok(self.assign_version_owner(node, source));
                }
                let target = if info.top_level {
                    owner_space
                } else {
                    self.runtime().runtime_owner(self.uid())
                };
                self.request_version_owner(node, target)
            }
        }
    }

    fn assign_version_owner(&self, node: RegionTreeNode, source: AddressSpace) -> AddressSpace {
        let local = self.runtime().local_space();
        let mut state = self.lock();
        if let Some(owner) = state.ext.version_owners.get_mut(&node) {
            if owner.remote_only && source == local {
                owner.remote_only = false;
            }
            return owner.space;
        }
        state.ext.version_owners.insert(
            node,
            VersionOwner {
                space: source,
                remote_only: source != local,
            },
        );
        trace!(ctx = %self.uid(), %node, owner = %source, "version owner assigned");
        source
    }

    fn request_version_owner(
        &self,
        node: RegionTreeNode,
        target: AddressSpace,
    ) -> Result<AddressSpace, ContextError> {
        let (wait_on, send_request) = {
            let mut state = self.lock();
            if let Some(owner) = state.ext.version_owners.get(&node) {
                return Ok(owner.space);
            }
            match state.ext.pending_version_owners.get(&node) {
                Some(pending) => (pending.event(), false),
                None => {
                    let pending = UserEvent::new();
                    state.ext.pending_version_owners.insert(node, pending.clone());
                    (pending.event(), true)
                }
            }
        };
        if send_request {
            debug!(ctx = %self.uid(), %node, %target, "requesting version owner");
            let sent = self.runtime().send(
                target,
                &Message::VersionOwnerRequest {
                    context: self.uid(),
                    node,
                    source: self.runtime().local_space(),
                },
            );
            if let Err(err) = sent {
                let pending = self.lock().ext.pending_version_owners.remove(&node);
                if let Some(pending) = pending {
                    pending.trigger();
                }
                return Err(err);
            }
        }
        wait_on.wait();
        self.lock()
            .ext
            .version_owners
            .get(&node)
            .map(|owner| owner.space)
            .ok_or_else(|| {
                ContextError::new(
                    ErrorKind::MissingContext,
                    format!("version owner request for {node} in context {} was abandoned", self.uid()),
                )
            })
    }

    /// Installs the answer to a version owner request and wakes its waiters.
    pub fn process_version_owner_response(&self, node: RegionTreeNode, owner: AddressSpace) {
        let pending = {
            let mut state = self.lock();
            state.ext.version_owners.insert(
                node,
                VersionOwner {
                    space: owner,
                    remote_only: false,
                },
            );
            state.ext.pending_version_owners.remove(&node)
        };
        debug!(ctx = %self.uid(), %node, %owner, "version owner received");
        if let Some(pending) = pending {
            pending.trigger();
        }
    }

    /// Cached owner of `node`, without asking anyone.
    #[must_use]
    pub fn known_version_owner(&self, node: RegionTreeNode) -> Option<AddressSpace> {
        self.lock().ext.version_owners.get(&node).map(|owner| owner.space)
    }
}
