//! FIFO queue and publish-subscribe dispatcher over strands.
//!
//! The [`Queue`] is the composition the semaphore was shaped for: the
//! semaphore's permit count mirrors the item count, `push` releases, readers
//! acquire and then drain. Queue and semaphore share one strand, so the
//! semaphore's completions already run where the item buffer may be touched
//! and no second hop is needed.
//!
//! The [`Dispatcher`] fans published items out by copy, one owned queue per
//! subscriber; consumers that fall behind only delay themselves.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::Dispatcher;
pub use queue::Queue;

pub use strand_core::{Executor, Strand, SyncError, SyncResult};
