/*!
 * Worker pool for asynchronous commands.
 *
 * Each device owns one pool. Submitted work runs as a tokio task that first
 * takes a permit from the pool's semaphore, so at most `size` commands are
 * queued on the device lock at once. Closing the pool fails every task still
 * waiting for a permit with [`DeviceError::Cancelled`]; tasks that already hold
 * one run to completion.
 */
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{DeviceError, Result};
use crate::format::Response;

/// Completion callback for an asynchronous command
pub type Callback = Box<dyn FnOnce(std::result::Result<&Response, &DeviceError>) + Send + 'static>;

/// Bounded pool of command tasks
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` tasks at once (at least one)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// The maximum number of concurrently running tasks
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Spawn `work` on the pool. Must be called from within a tokio runtime.
    pub fn spawn<F, T>(&self, work: F) -> CommandHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let task = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| {
                debug!("Worker pool closed before the task started");
                DeviceError::Cancelled
            })?;
            trace!("Worker task started");
            work.await
        });
        CommandHandle { task }
    }

    /// Stop accepting work and cancel tasks that have not started
    pub fn close(&self) {
        if !self.permits.is_closed() {
            debug!(size = self.size, "Closing worker pool");
            self.permits.close();
        }
    }
}

/// Handle to the eventual result of an asynchronous command.
///
/// Awaiting the handle yields the command's result. A task that was cancelled
/// resolves to [`DeviceError::Cancelled`], one that panicked to
/// [`DeviceError::TaskFailed`].
#[derive(Debug)]
pub struct CommandHandle<T = Response> {
    task: JoinHandle<Result<T>>,
}

impl<T> CommandHandle<T> {
    /// Whether the command has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the command. Awaiting the handle afterwards yields `Cancelled`
    /// unless it had already completed.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> From<JoinHandle<Result<T>>> for CommandHandle<T> {
    fn from(task: JoinHandle<Result<T>>) -> Self {
        Self { task }
    }
}

impl<T> Future for CommandHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_returns_result() {
        let pool = WorkerPool::new(2);
        let handle = pool.spawn(async { Ok(Response::Number(1.0)) });
        assert_eq!(handle.await.unwrap(), Response::Number(1.0));

        let handle = pool.spawn(async { Err::<(), _>(DeviceError::NoTransport) });
        assert!(matches!(handle.await, Err(DeviceError::NoTransport)));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_close_cancels_waiting_tasks() {
        let pool = WorkerPool::new(1);
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let running = pool.spawn(async move {
            let _ = wait.await;
            Ok("done")
        });
        // Let the first task take the only permit
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = pool.spawn(async { Ok("never") });

        pool.close();
        assert!(pool.is_closed());
        release.send(()).unwrap();

        assert_eq!(running.await.unwrap(), "done");
        assert!(matches!(queued.await, Err(DeviceError::Cancelled)));
        assert!(matches!(pool.spawn(async { Ok(()) }).await, Err(DeviceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_abort_resolves_cancelled() {
        let pool = WorkerPool::new(1);
        let handle = pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        handle.abort();
        assert!(matches!(handle.await, Err(DeviceError::Cancelled)));
    }

    #[test]
    fn test_size_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
