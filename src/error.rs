//! Error types for hexkernel.
//!
//! Every variant is a distinct failure mode a caller can observe through the
//! message interface. Messages are intentionally minimal: they say *what*
//! was refused, never which internal check refused it.
//!
//! Internal-consistency failures (corrupted ACL tables, corrupted memory
//! block checksums, impossible object-table state) are never represented
//! here. They go through [`trap`], which logs and panics.

use std::fmt;

/// Which argument of a message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgPosition {
    /// The attribute or message value itself.
    Value,
    /// The first data (string/buffer) argument.
    Str1,
    /// The second data argument.
    Str2,
    /// The first numeric argument.
    Num1,
    /// The second numeric argument.
    Num2,
}

impl fmt::Display for ArgPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Value => "value",
            Self::Str1 => "string 1",
            Self::Str2 => "string 2",
            Self::Num1 => "numeric 1",
            Self::Num2 => "numeric 2",
        };
        f.write_str(name)
    }
}

/// The single error type for all kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// The handle does not name an object the caller may address.
    #[error("invalid object")]
    InvalidObject,

    /// A message argument is out of range or of the wrong shape.
    #[error("bad argument: {0}")]
    BadArgument(ArgPosition),

    /// Secure memory could not be allocated.
    #[error("out of memory")]
    Memory,

    /// The object has not been initialised (or has no key loaded).
    #[error("object not initialised")]
    NotInitialised,

    /// The object, attribute or dependency is already initialised.
    #[error("object already initialised")]
    AlreadyInitialised,

    /// The operation failed.
    #[error("operation failed")]
    Failed,

    /// The requested action is not available for this object.
    #[error("action not available")]
    NotAvailable,

    /// The caller lacks permission for the operation.
    #[error("permission denied")]
    Permission,

    /// The operation is still in progress and its result cannot be delivered.
    #[error("operation incomplete")]
    Incomplete,

    /// The operation has already completed.
    #[error("operation already complete")]
    Complete,

    /// Waiting for a busy object exceeded the iteration cap.
    #[error("timed out waiting for object")]
    Timeout,

    /// The request is structurally invalid.
    #[error("invalid request")]
    Invalid,

    /// The object was signalled or destroyed.
    #[error("object signalled")]
    Signalled,

    /// A size or count limit was exceeded.
    #[error("overflow")]
    Overflow,

    /// Not enough data is available.
    #[error("underflow")]
    Underflow,

    /// Data failed an integrity or format check.
    #[error("bad data")]
    BadData,

    /// A signature did not verify.
    #[error("bad signature")]
    Signature,

    /// The requested item does not exist.
    #[error("not found")]
    NotFound,

    /// The item already exists.
    #[error("duplicate item")]
    Duplicate,

    /// The kernel is shutting down and only accepts teardown messages.
    #[error("kernel shutting down")]
    ShuttingDown,

    /// The configuration is inconsistent.
    #[error("invalid configuration")]
    Config,
}

impl KernelError {
    /// The signed status code for this error. Zero is reserved for success.
    pub fn status(self) -> i32 {
        match self {
            Self::BadArgument(ArgPosition::Value) => -1001,
            Self::BadArgument(ArgPosition::Str1) => -1002,
            Self::BadArgument(ArgPosition::Str2) => -1003,
            Self::BadArgument(ArgPosition::Num1) => -1004,
            Self::BadArgument(ArgPosition::Num2) => -1005,
            Self::InvalidObject => -1000,
            Self::Memory => -10,
            Self::NotInitialised => -11,
            Self::AlreadyInitialised => -12,
            Self::Failed => -15,
            Self::NotAvailable => -20,
            Self::Permission | Self::ShuttingDown => -21,
            Self::Incomplete => -23,
            Self::Complete => -24,
            Self::Timeout => -25,
            Self::Invalid | Self::Config => -26,
            Self::Signalled => -27,
            Self::Overflow => -30,
            Self::Underflow => -31,
            Self::BadData => -32,
            Self::Signature => -33,
            Self::NotFound => -43,
            Self::Duplicate => -44,
        }
    }
}

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Collapse a result into the signed status space used at the message API.
pub fn status_of<T>(result: &KernelResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

// ---------------------------------------------------------------------------
// Fatal traps
// ---------------------------------------------------------------------------

/// Abort on an internal-consistency violation.
///
/// Continuing after one of these would mean operating on security state that
/// may be attacker-controlled, so the error is never returned to a caller.
#[cold]
#[track_caller]
pub(crate) fn trap(reason: fmt::Arguments<'_>) -> ! {
    log::error!("kernel trap: {reason}");
    panic!("kernel trap: {reason}");
}

/// Format a trap reason and abort. See [`trap`].
macro_rules! kernel_trap {
    ($($arg:tt)*) => {
        $crate::error::trap(format_args!($($arg)*))
    };
}
pub(crate) use kernel_trap;
