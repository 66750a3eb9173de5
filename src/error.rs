//! Unified error handling for ndscope
//!
//! This module provides a centralized error type for everything the scope
//! tree can report. It implements error categorization so callers can tell
//! apart:
//! - Lifecycle violations (a closed scope was used - a programming error
//!   in scope management upstream)
//! - User errors (bad arguments to an allocation entry point)
//! - Backend errors (the native collaborator failed)
//! - Storage errors (load/save file issues)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;

/// Unified error type for ndscope
///
/// This enum consolidates every error the scope tree and the allocation
/// entry points can surface. It supports categorization via the
/// `category()` method so tooling can distinguish "you used a scope after
/// closing it" from "you passed a bad argument".
#[derive(Debug, thiserror::Error)]
pub enum NdScopeError {
    // ========== Lifecycle Errors ==========
    /// Attach or detach was called on a scope that has already been closed
    #[error("scope has already been closed")]
    ScopeClosed,

    // ========== Configuration Errors ==========
    /// Invalid argument to an allocation entry point
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ========== Backend Errors ==========
    /// Native allocation failed
    #[error("native allocation failed: {0}")]
    AllocationFailed(String),

    /// Native release of a handle failed
    #[error("native release failed: {0}")]
    ReleaseFailed(String),

    /// The backend does not implement the requested operator
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    // ========== Storage Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Loading arrays from storage failed
    #[error("load failed: {0}")]
    LoadFailed(String),

    /// Saving arrays to storage failed
    #[error("save failed: {0}")]
    SaveFailed(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a thread panicked while holding a registry lock)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl NdScopeError {
    /// Categorize the error for handling decisions
    ///
    /// # Examples
    /// ```ignore
    /// match error.category() {
    ///     ErrorCategory::Lifecycle => panic!("scope misuse upstream"),
    ///     ErrorCategory::User => println!("fix the argument"),
    ///     _ => return Err(error),
    /// }
    /// ```
    pub fn category(&self) -> ErrorCategory {
        match self {
            // Lifecycle violations - scope misuse, never retried
            NdScopeError::ScopeClosed => ErrorCategory::Lifecycle,

            // User errors - actionable by the caller
            NdScopeError::InvalidArgument(_) => ErrorCategory::User,

            // Backend errors - native collaborator failures
            NdScopeError::AllocationFailed(_)
            | NdScopeError::ReleaseFailed(_)
            | NdScopeError::UnknownOperator(_) => ErrorCategory::Backend,

            // Storage errors - file issues during load/save
            NdScopeError::IoError(_)
            | NdScopeError::LoadFailed(_)
            | NdScopeError::SaveFailed(_) => ErrorCategory::Storage,

            // Internal errors - bugs
            NdScopeError::InternalError(_) | NdScopeError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if this is a lifecycle violation (a closed scope was used)
    ///
    /// Lifecycle violations indicate a programming error in scope
    /// management upstream and should never be retried.
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(self.category(), ErrorCategory::Lifecycle)
    }

    /// Check if this is a user-facing error (actionable by the caller)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// Categories help determine how to handle errors:
/// - Lifecycle: scope misuse, fix the calling code
/// - User: invalid argument, fix the input
/// - Backend: native collaborator failure
/// - Storage: file or format problem
/// - Internal: log and report as a bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Lifecycle violation - a closed scope was used
    Lifecycle,
    /// User error - invalid argument or configuration
    User,
    /// Backend error - native allocation/release failure
    Backend,
    /// Storage error - load/save problem
    Storage,
    /// Internal error - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Lifecycle => write!(f, "Lifecycle"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Storage => write!(f, "Storage"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Note: From<std::io::Error> is auto-derived by #[from] on the IoError variant

impl<T> From<std::sync::PoisonError<T>> for NdScopeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        NdScopeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using NdScopeError
pub type NdResult<T> = std::result::Result<T, NdScopeError>;

/// Create an invalid-argument error with context
///
/// # Examples
/// ```ignore
/// return Err(invalid_argument!("step must be non-zero"));
/// ```
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::error::NdScopeError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NdScopeError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("registry entry vanished"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::NdScopeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NdScopeError::InternalError(format!($fmt, $($arg)*))
    };
}
