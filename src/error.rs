//! Error types for task contexts.
//!
//! Two layers:
//!
//! - [`PrivilegeError`] is the sentinel returned by privilege checking. It is
//!   cheap, `Copy`, and carries no message; the caller decides how to report it.
//! - [`ContextError`] is a user-API misuse with an [`ErrorKind`] and a message
//!   naming the offending task. Every kind maps to a distinct process exit code.
//!
//! Misuse is not recoverable: by the time it is detected the dependence state
//! may be partially updated. Operations still return `Result` so the owning
//! layer decides where the process ends, via [`ContextError::terminate`] or
//! [`OrTerminate::or_terminate`].

use crate::tracing_compat::error;
use crate::types::FieldId;
use core::fmt;
use thiserror::Error;

/// Classification of a user-API misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A trace was begun while another trace was active.
    IllegalNestedTrace,
    /// `end_trace` without a matching `begin_trace`.
    UnmatchedEndTrace,
    /// A task finished with a trace still open.
    IncompleteTrace,
    /// Acquire on a region with no matching restriction.
    UnrestrictedAcquire,
    /// Release on a region with no matching acquisition.
    UnacquiredRelease,
    /// Detach on a region with no matching attach.
    UnattachedDetach,
    /// Mapper produced a scheduling configuration with both minimums zero.
    InvalidContextConfiguration,
    /// No parent region requirement covers the child's requirement.
    BadParentRegion,
    /// No parent index requirement covers the child's requirement.
    BadParentIndex,
    /// A leaf task tried to launch a child operation.
    LeafChildLaunch,
    /// A leaf task tried to inline a child task.
    LeafInlineChild,
    /// A leaf context was asked to pack itself for a remote process.
    LeafPack,
    /// A context uid could not be resolved.
    MissingContext,
    /// A wire message could not be encoded or decoded.
    Wire,
}

impl ErrorKind {
    /// Process exit code used when this error terminates the process.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::IllegalNestedTrace => 64,
            Self::UnmatchedEndTrace => 65,
            Self::IncompleteTrace => 66,
            Self::UnrestrictedAcquire => 67,
            Self::UnacquiredRelease => 68,
            Self::UnattachedDetach => 69,
            Self::InvalidContextConfiguration => 70,
            Self::BadParentRegion => 71,
            Self::BadParentIndex => 72,
            Self::LeafChildLaunch => 73,
            Self::LeafInlineChild => 74,
            Self::LeafPack => 75,
            Self::MissingContext => 76,
            Self::Wire => 77,
        }
    }

    /// Short stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IllegalNestedTrace => "illegal nested trace",
            Self::UnmatchedEndTrace => "unmatched end trace",
            Self::IncompleteTrace => "incomplete trace",
            Self::UnrestrictedAcquire => "unrestricted acquire",
            Self::UnacquiredRelease => "unacquired release",
            Self::UnattachedDetach => "unattached detach",
            Self::InvalidContextConfiguration => "invalid context configuration",
            Self::BadParentRegion => "bad parent region",
            Self::BadParentIndex => "bad parent index",
            Self::LeafChildLaunch => "child launch from leaf task",
            Self::LeafInlineChild => "inline child from leaf task",
            Self::LeafPack => "pack of leaf context",
            Self::MissingContext => "missing context",
            Self::Wire => "wire format",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-API misuse detected by a context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ContextError {
    kind: ErrorKind,
    message: String,
}

impl ContextError {
    /// Creates an error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Descriptive message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Exit code of the kind.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Logs the error and exits the process with the kind's exit code.
    pub fn terminate(self) -> ! {
        error!(kind = %self.kind, code = self.exit_code(), "{}", self.message);
        std::process::exit(self.exit_code())
    }
}

/// Applies the fatal path to a result.
pub trait OrTerminate<T> {
    /// Returns the value, or terminates the process on error.
    fn or_terminate(self) -> T;
}

impl<T> OrTerminate<T> for Result<T, ContextError> {
    fn or_terminate(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => err.terminate(),
        }
    }
}

/// Sentinel result of a privilege check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivilegeError {
    /// No parent requirement holds all of the requested fields.
    BadParentRegion {
        /// A field that no parent covers, if known.
        field: Option<FieldId>,
    },
    /// No path from the parent region to the requested region.
    BadRegionPath,
    /// No path from the parent region to the requested partition.
    BadPartitionPath,
    /// Parent privileges do not cover the requested region privileges.
    BadRegionPrivileges {
        /// The field whose privileges were insufficient.
        field: FieldId,
    },
    /// Parent privileges do not cover the requested partition privileges.
    BadPartitionPrivileges {
        /// The field whose privileges were insufficient.
        field: FieldId,
    },
    /// No path from the parent index space to the requested one.
    BadIndexPath,
    /// Parent allocation privileges are insufficient.
    BadIndexPrivileges,
    /// No parent index requirement names the requested parent.
    BadParentIndex,
}

impl PrivilegeError {
    /// True for the "no parent matched" outcome, which lets a caller keep
    /// searching other candidate parents.
    #[must_use]
    pub const fn is_bad_parent(self) -> bool {
        matches!(self, Self::BadParentRegion { .. })
    }
}

impl fmt::Display for PrivilegeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadParentRegion { field: Some(fid) } => {
                write!(f, "no parent region requirement for field {fid}")
            }
            Self::BadParentRegion { field: None } => f.write_str("no parent region requirement"),
            Self::BadRegionPath => f.write_str("no path from parent region to region"),
            Self::BadPartitionPath => f.write_str("no path from parent region to partition"),
            Self::BadRegionPrivileges { field } => {
                write!(f, "insufficient region privileges on field {field}")
            }
            Self::BadPartitionPrivileges { field } => {
                write!(f, "insufficient partition privileges on field {field}")
            }
            Self::BadIndexPath => f.write_str("no path from parent index space"),
            Self::BadIndexPrivileges => f.write_str("insufficient index space privileges"),
            Self::BadParentIndex => f.write_str("no parent index space requirement"),
        }
    }
}

impl std::error::Error for PrivilegeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::IllegalNestedTrace,
            ErrorKind::UnmatchedEndTrace,
            ErrorKind::IncompleteTrace,
            ErrorKind::UnrestrictedAcquire,
            ErrorKind::UnacquiredRelease,
            ErrorKind::UnattachedDetach,
            ErrorKind::InvalidContextConfiguration,
            ErrorKind::BadParentRegion,
            ErrorKind::BadParentIndex,
            ErrorKind::LeafChildLaunch,
            ErrorKind::LeafInlineChild,
            ErrorKind::LeafPack,
            ErrorKind::MissingContext,
            ErrorKind::Wire,
        ];
        let codes: std::collections::BTreeSet<i32> =
            kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = ContextError::new(ErrorKind::UnmatchedEndTrace, "task foo (#4)");
        assert_eq!(err.to_string(), "unmatched end trace: task foo (#4)");
        assert_eq!(err.kind(), ErrorKind::UnmatchedEndTrace);
    }

    #[test]
    fn ok_passes_through() {
        let value: Result<u32, ContextError> = Ok(3);
        assert_eq!(value.or_terminate(), 3);
    }

    #[test]
    fn bad_parent_is_searchable() {
        assert!(PrivilegeError::BadParentRegion { field: None }.is_bad_parent());
        assert!(!PrivilegeError::BadRegionPath.is_bad_parent());
    }
}
