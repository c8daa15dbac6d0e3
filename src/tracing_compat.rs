//! Logging facade.
//!
//! With the `tracing-integration` feature the macros below are the `tracing`
//! crate's own. Without it their arguments are only type-checked inside a
//! dead branch, so context hot paths (child registration, window accounting)
//! pay nothing for their log lines and log-only bindings still count as used.
//!
//! ```rust,ignore
//! use taskctx::tracing_compat::{debug, trace};
//!
//! trace!(ctx = %uid, op = %op_uid, "child executed");
//! let _span = debug_span!("end_task", ctx = %uid).entered();
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{Level, Span, debug, debug_span, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// Borrows every field value and formats the message of a no-op event.
    #[doc(hidden)]
    #[macro_export]
    macro_rules! __noop_fields {
        () => {};
        ($fmt:literal $($args:tt)*) => {
            let _ = format_args!($fmt $($args)*);
        };
        ($key:ident = % $val:expr $(, $($rest:tt)*)?) => {
            let _ = &$val;
            $($crate::__noop_fields!($($rest)*);)?
        };
        ($key:ident = ? $val:expr $(, $($rest:tt)*)?) => {
            let _ = &$val;
            $($crate::__noop_fields!($($rest)*);)?
        };
        ($key:ident = $val:expr $(, $($rest:tt)*)?) => {
            let _ = &$val;
            $($crate::__noop_fields!($($rest)*);)?
        };
        (% $val:ident $(, $($rest:tt)*)?) => {
            let _ = &$val;
            $($crate::__noop_fields!($($rest)*);)?
        };
        (? $val:ident $(, $($rest:tt)*)?) => {
            let _ = &$val;
            $($crate::__noop_fields!($($rest)*);)?
        };
        ($val:ident $(, $($rest:tt)*)?) => {
            let _ = &$val;
            $($crate::__noop_fields!($($rest)*);)?
        };
    }

    /// No-op trace-level event.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {
            if false {
                $crate::__noop_fields!($($arg)*);
            }
        };
    }

    /// No-op debug-level event.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {
            if false {
                $crate::__noop_fields!($($arg)*);
            }
        };
    }

    /// No-op info-level event.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {
            if false {
                $crate::__noop_fields!($($arg)*);
            }
        };
    }

    /// No-op warn-level event.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {
            if false {
                $crate::__noop_fields!($($arg)*);
            }
        };
    }

    /// No-op error-level event.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {
            if false {
                $crate::__noop_fields!($($arg)*);
            }
        };
    }

    /// No-op debug span.
    #[macro_export]
    macro_rules! debug_span {
        ($name:literal $(, $($fields:tt)*)?) => {{
            if false {
                $crate::__noop_fields!($($($fields)*)?);
            }
            $crate::tracing_compat::NoopSpan
        }};
    }

    pub use crate::{debug, debug_span, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

/// Span returned by the span macros when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy)]
pub struct NoopSpan;

#[cfg(not(feature = "tracing-integration"))]
impl NoopSpan {
    /// Returns a guard that does nothing.
    #[inline]
    #[must_use]
    pub const fn enter(&self) -> NoopGuard {
        NoopGuard
    }

    /// Returns self.
    #[inline]
    #[must_use]
    pub const fn entered(self) -> Self {
        self
    }
}

/// Guard returned by [`NoopSpan::enter`].
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug)]
pub struct NoopGuard;

/// Span type when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
pub type Span = NoopSpan;

/// Level placeholder when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level;

#[cfg(not(feature = "tracing-integration"))]
impl Level {
    /// Trace.
    pub const TRACE: Self = Self;
    /// Debug.
    pub const DEBUG: Self = Self;
    /// Info.
    pub const INFO: Self = Self;
    /// Warn.
    pub const WARN: Self = Self;
    /// Error.
    pub const ERROR: Self = Self;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    #[test]
    fn macros_accept_structured_fields() {
        init_test_logging();
        crate::test_phase!("macros_accept_structured_fields");
        let uid = crate::types::UniqueId::new(7);
        trace!(ctx = %uid, "child registered");
        debug!(ctx = %uid, outstanding = 3, "window wait");
        info!("context configured");
        warn!(ctx = ?uid, "unknown context");
        error!(code = 70, "bad configuration");
        let _guard = debug_span!("end_task", ctx = %uid).entered();
        crate::test_complete!("macros_accept_structured_fields");
    }

    #[test]
    #[deny(unused_variables)]
    fn log_only_values_count_as_used() {
        let source = crate::types::AddressSpace::new(1);
        let kind = "remote_context_free";
        let err = crate::error::ContextError::new(crate::error::ErrorKind::Wire, "bad frame");
        warn!(source = %source, kind, error = %err, "message handling failed");
        let depth = 3;
        debug!("queue depth {depth}");
        let generation = 2_u64;
        trace!(?generation, "fence updated");
        let _guard = debug_span!("dispatch", source = ?source).entered();
    }
}
