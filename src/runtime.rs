//! Runtime abstraction for the scheduler's background work
//!
//! The queue spawns its processing loop on a tokio runtime handle captured at
//! construction time. Handles returned by [`spawn_on`] let the owner observe or
//! abort the task without holding on to tokio types.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{Result, TileError};

/// Handle to a spawned async task
pub trait AsyncHandle: Send + Sync {
    /// Check if the task is finished
    fn is_finished(&self) -> bool;

    /// Abort the task at its next suspension point
    fn cancel(&self);
}

struct TokioHandle(JoinHandle<()>);

impl AsyncHandle for TokioHandle {
    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    fn cancel(&self) {
        self.0.abort();
    }
}

/// The runtime the caller is currently running on
pub fn current_handle() -> Result<Handle> {
    Handle::try_current().map_err(|_| TileError::NoRuntime)
}

/// Spawn a future on the given runtime
pub fn spawn_on<F>(handle: &Handle, future: F) -> Box<dyn AsyncHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::new(TokioHandle(handle.spawn(future)))
}

/// Async delay on the tokio timer
pub async fn async_delay(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawned_task_finishes() {
        let handle = spawn_on(&current_handle().unwrap(), async {
            async_delay(Duration::from_millis(5)).await;
        });

        assert!(!handle.is_finished());
        async_delay(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_aborts_task() {
        let handle = spawn_on(&current_handle().unwrap(), async {
            async_delay(Duration::from_secs(3600)).await;
        });

        handle.cancel();
        tokio::task::yield_now().await;
        async_delay(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }

    #[test]
    fn test_no_runtime_outside_tokio() {
        assert_eq!(current_handle().err(), Some(TileError::NoRuntime));
    }
}
