use anyhow::anyhow;
use fleet_common::{FleetError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to an add/remove operation running on the fleet's bounded pool.
///
/// Awaiting it yields the operation's result. `cancel` only wins while the body
/// has not started; once remote I/O began the operation runs to completion.
/// Dropping the handle detaches the operation.
pub struct FleetOperation<T> {
    label: &'static str,
    state: Arc<AtomicU8>,
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> FleetOperation<T> {
    pub(crate) fn spawn<F, Fut>(pool: Arc<Semaphore>, label: &'static str, body: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let gate = state.clone();
        let handle = tokio::spawn(async move {
            if gate.load(Ordering::SeqCst) == CANCELLED {
                return Err(FleetError::Cancelled);
            }
            let _permit = pool
                .acquire_owned()
                .await
                .map_err(|_| FleetError::Cancelled)?;
            if gate
                .compare_exchange(PENDING, STARTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!(operation = label, "cancelled before start");
                return Err(FleetError::Cancelled);
            }
            body().await
        });
        Self {
            label,
            state,
            handle,
        }
    }
}

impl<T> FleetOperation<T> {
    /// Returns true if the operation will not run.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            debug!(operation = self.label, "cancel requested");
        }
        cancelled
    }

    pub fn has_started(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STARTED
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for FleetOperation<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let label = self.label;
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_err)) => Poll::Ready(Err(FleetError::Other(anyhow!(
                "{} task failed: {}",
                label,
                join_err
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_to_body_result() {
        let pool = Arc::new(Semaphore::new(1));
        let op = FleetOperation::spawn(pool, "test", || async { Ok(41 + 1) });
        assert_eq!(op.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancel_before_start_wins() {
        let pool = Arc::new(Semaphore::new(1));
        // Occupy the only slot so the second operation cannot start.
        let permit = pool.clone().acquire_owned().await.unwrap();
        let op = FleetOperation::spawn(pool.clone(), "test", || async { Ok(()) });
        assert!(op.cancel());
        assert!(!op.cancel());
        drop(permit);
        assert!(matches!(op.await, Err(FleetError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_after_start_is_refused() {
        let pool = Arc::new(Semaphore::new(1));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let op = FleetOperation::spawn(pool, "test", || async move {
            let _ = rx.await;
            Ok("done")
        });
        while !op.has_started() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!op.cancel());
        tx.send(()).unwrap();
        assert_eq!(op.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pool = Arc::new(Semaphore::new(2));
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ops: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                FleetOperation::spawn(pool.clone(), "test", move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for op in ops {
            op.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
