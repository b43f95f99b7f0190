//! Binding to the runtime's task executor.

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Handle to the thread pool that runs strand drains and timer tasks.
///
/// This is a thin wrapper over [`tokio::runtime::Handle`]; it exists so the
/// primitives take one executor type regardless of how the runtime was
/// obtained.
#[derive(Clone, Debug)]
pub struct Executor {
    handle: Handle,
}

impl Executor {
    /// Bind to the runtime the caller is currently running on.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime, as
    /// [`Handle::current`] does.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    /// Bind to an explicit runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Spawn a future onto the pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}
