//! Asynchronous synchronization primitives over strands.
//!
//! Every primitive in this crate follows one discipline: all of its state
//! lives behind a [`strand_core::Strand`], every mutation runs inside a task
//! posted to that strand, and completions are invoked as the last action of
//! a strand task, after the state borrow has ended. No primitive ever calls
//! user code while its state is borrowed, and no kernel lock is held across
//! a suspension point.
//!
//! Each waitable operation comes in up to three flavors:
//! - a callback core (`*_with`) that takes a one-shot completion,
//! - an async wrapper returning [`strand_core::SyncResult`]; a waiter that is
//!   dropped by `cancel`/`stop`/teardown surfaces as `Err(Cancelled)`,
//! - where meaningful, a timed variant built on
//!   [`strand_core::RaceArbiter`] + [`strand_core::Deadline`] and/or a
//!   non-waiting try variant.
//!
//! Primitives are cheap cloneable handles; clones share the same state.
//! Constructing a primitive with [`Strand`]-sharing (`with_strand`) puts
//! several primitives on one serializer so their operations order against
//! each other with no extra hop.
//!
//! [`Strand`]: strand_core::Strand

pub mod auto_event;
pub mod barrier;
pub mod event;
pub mod latch;
pub mod mutex;
pub mod periodic;
pub mod rate_limiter;
pub mod semaphore;
pub mod waitgroup;

pub use auto_event::AutoResetEvent;
pub use barrier::Barrier;
pub use event::Event;
pub use latch::Latch;
pub use mutex::{Mutex, MutexGuard};
pub use periodic::PeriodicTimer;
pub use rate_limiter::RateLimiter;
pub use semaphore::Semaphore;
pub use waitgroup::WaitGroup;

pub use strand_core::{Deadline, Executor, Strand, SyncError, SyncResult};
