//! Error taxonomy shared by all primitives.

use thiserror::Error;

/// Result type for waitable operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Outcomes a waitable operation can fail with.
///
/// Misuse (counter underflow, double unlock, ...) is deliberately not a
/// variant: it is clamped, counted where a counter exists, and logged, but
/// never surfaced to the completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The operation was aborted by `stop`, `cancel_all` or an explicit
    /// cancel, or the primitive was torn down while the waiter was pending.
    #[error("operation cancelled")]
    Cancelled,

    /// A timed wait elapsed before the inner event fired.
    #[error("operation timed out")]
    TimedOut,

    /// A constructor or operation precondition was violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
