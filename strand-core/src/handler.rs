//! One-shot completion slots.
//!
//! Primitives own their suspended callers as type-erased completions. Two
//! shapes exist: nullary for plain waits and boolean for timed waits. A
//! [`Waiter`] couples a completion with the 64-bit id the cancel path uses
//! for O(1) removal; its slot can be vacated so a record can be freed without
//! any risk of accidental invocation.

/// Type-erased nullary completion.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Type-erased boolean completion; `true` means the event happened, `false`
/// means the wait timed out.
pub type BoolCompletion = Box<dyn FnOnce(bool) + Send + 'static>;

/// A registered waiter record.
///
/// Consumed by exactly one of: a wake ([`Waiter::fire`]), a cancellation
/// (dropping the record, or [`Waiter::revoke`] followed by a later no-op
/// fire), or primitive teardown (plain drop).
pub struct Waiter {
    id: u64,
    slot: Option<Completion>,
}

impl Waiter {
    pub fn new(id: u64, completion: Completion) -> Self {
        Self {
            id,
            slot: Some(completion),
        }
    }

    /// The id this waiter was registered under; [`crate::NULL_ID`] never
    /// appears here.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver the completion. A no-op if the slot was revoked.
    pub fn fire(mut self) {
        if let Some(completion) = self.slot.take() {
            completion();
        }
    }

    /// Drop the completion without invoking it; a subsequent `fire` is a
    /// no-op.
    pub fn revoke(&mut self) {
        self.slot = None;
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id)
            .field("armed", &self.slot.is_some())
            .finish()
    }
}
