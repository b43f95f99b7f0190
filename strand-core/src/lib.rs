//! Core building blocks for strand-based asynchronous synchronization.
//!
//! This crate provides the pieces every primitive in the workspace is built
//! from:
//! - [`Executor`]: a thin binding to the tokio runtime's work-stealing pool
//! - [`Strand`]: a cooperative serializer that runs posted tasks one at a time
//! - [`Deadline`]: a one-shot, re-armable timer
//! - [`RaceArbiter`]: exactly-once arbitration between a timed wait's two
//!   possible finishers (the inner operation and the timeout)
//! - handler erasure for one-shot completions and the waiter-id allocator
//!
//! Higher-level primitives (semaphore, mutex, queue, ...) live in
//! `strand-sync` and `strand-pubsub`. The rule they all share: every state
//! mutation of a primitive happens inside a task posted to its strand, and
//! completions run as the last action of a strand task, never while the
//! primitive's state is borrowed.

pub mod deadline;
pub mod error;
pub mod executor;
pub mod handler;
pub mod id;
pub mod race;
pub mod strand;

pub use deadline::Deadline;
pub use error::{SyncError, SyncResult};
pub use executor::Executor;
pub use handler::{BoolCompletion, Completion, Waiter};
pub use id::{IdSource, NULL_ID};
pub use race::RaceArbiter;
pub use strand::Strand;
