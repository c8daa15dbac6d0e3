//! Messages exchanged between processes.
//!
//! Payloads are MessagePack-encoded with `rmp-serde`; the transport only
//! ever sees opaque byte buffers. Events travel as [`EventId`]s.

use crate::error::{ContextError, ErrorKind};
use crate::operation::TaskInfo;
use crate::sync::EventId;
use crate::types::{
    AddressSpace, FieldId, FieldSpace, IndexSpaceRequirement, ManagerId, RegionRequirement,
    RegionTreeNode, SerdezId, UniqueId, ViewId,
};
use serde::{Deserialize, Serialize};

/// A field allocated local to one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFieldInfo {
    /// Field space the field lives in.
    pub handle: FieldSpace,
    /// Field id.
    pub fid: FieldId,
    /// Size of one element in bytes.
    pub field_size: usize,
    /// Custom serializer id, zero for none.
    pub serdez: SerdezId,
    /// Event after which the field may be reclaimed.
    pub reclaim_event: EventId,
}

/// Version state of one region requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBlob {
    /// True if `bytes` is the full state (virtually mapped requirement),
    /// false if it holds version numbers only.
    pub full: bool,
    /// Opaque state produced by the owner task.
    pub bytes: Vec<u8>,
}

/// Everything a remote process needs to mirror a non-top-level context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteContextBody {
    /// Owning task.
    pub task: TaskInfo,
    /// The task's region requirements.
    pub regions: Vec<RegionRequirement>,
    /// The task's index space requirements.
    pub indexes: Vec<IndexSpaceRequirement>,
    /// Index of each region's parent requirement in the parent context.
    pub parent_req_indexes: Vec<usize>,
    /// Virtual mapping flag of each region.
    pub virtual_mapped: Vec<bool>,
    /// Version state of each region.
    pub versions: Vec<VersionBlob>,
    /// Local fields of this context and every enclosing one.
    pub local_fields: Vec<LocalFieldInfo>,
    /// Completion event of the owning task.
    pub completion: EventId,
    /// Context the owning task was launched from.
    pub parent_context: UniqueId,
}

/// Snapshot of a context sent to a remote process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteContextPayload {
    /// Uid shared by the context and all its mirrors.
    pub context: UniqueId,
    /// True if the mirrored context is the top-level context.
    pub top_level: bool,
    /// Absent for the top-level context.
    pub body: Option<RemoteContextBody>,
}

/// A context protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Who owns the version state of `node` in `context`?
    VersionOwnerRequest {
        /// Context uid.
        context: UniqueId,
        /// Region tree node asked about.
        node: RegionTreeNode,
        /// Requesting process.
        source: AddressSpace,
    },
    /// Answer to [`Message::VersionOwnerRequest`].
    VersionOwnerResponse {
        /// Context uid.
        context: UniqueId,
        /// Region tree node.
        node: RegionTreeNode,
        /// Owning process.
        owner: AddressSpace,
    },
    /// Send me a mirror of `context`.
    RemoteContextRequest {
        /// Context uid.
        context: UniqueId,
        /// Requesting process.
        source: AddressSpace,
    },
    /// A context mirror.
    RemoteContextResponse {
        /// The packed context.
        payload: RemoteContextPayload,
    },
    /// The original context is gone; drop the mirror.
    RemoteContextFree {
        /// Context uid.
        context: UniqueId,
    },
    /// Build the view of `manager` for `context` on the manager's owner.
    CreateTopViewRequest {
        /// Context uid.
        context: UniqueId,
        /// Instance manager.
        manager: ManagerId,
        /// Requesting process.
        source: AddressSpace,
    },
    /// Answer to [`Message::CreateTopViewRequest`].
    CreateTopViewResponse {
        /// Context uid.
        context: UniqueId,
        /// Instance manager.
        manager: ManagerId,
        /// The constructed view.
        view: ViewId,
    },
}

impl Message {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::VersionOwnerRequest { .. } => "version_owner_request",
            Self::VersionOwnerResponse { .. } => "version_owner_response",
            Self::RemoteContextRequest { .. } => "remote_context_request",
            Self::RemoteContextResponse { .. } => "remote_context_response",
            Self::RemoteContextFree { .. } => "remote_context_free",
            Self::CreateTopViewRequest { .. } => "create_top_view_request",
            Self::CreateTopViewResponse { .. } => "create_top_view_response",
        }
    }

    /// True for answers to an earlier request. Handling one never blocks.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(
            self,
            Self::VersionOwnerResponse { .. }
                | Self::RemoteContextResponse { .. }
                | Self::CreateTopViewResponse { .. }
        )
    }

    /// Encodes the message.
    pub fn encode(&self) -> Result<Vec<u8>, ContextError> {
        rmp_serde::to_vec_named(self).map_err(|e| {
            ContextError::new(ErrorKind::Wire, format!("failed to encode {}: {e}", self.name()))
        })
    }

    /// Decodes a message produced by [`Message::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ContextError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ContextError::new(ErrorKind::Wire, format!("failed to decode message: {e}")))
    }
}
