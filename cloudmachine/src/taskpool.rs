use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Future;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded worker pool shared by every domain client of one aggregate.
///
/// At most `max_workers` submitted futures run at a time; the rest wait for
/// a permit. After [`TaskPool::shutdown`] queued and running work is
/// cancelled and resolves to `None`.
pub struct TaskPool {
    semaphore: Arc<Semaphore>,
    cancel_token: CancellationToken,
    max_workers: usize,
    shut_down: AtomicBool,
}

impl TaskPool {
    pub fn new(max_workers: usize) -> TaskPool {
        let max_workers = max_workers.max(1);
        TaskPool {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            cancel_token: CancellationToken::new(),
            max_workers,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs `func` once a worker permit is available.
    pub fn spawn<F, T>(&self, func: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            let main = async {
                let Ok(_permit) = semaphore.acquire().await else {
                    return None;
                };
                Some(func.await)
            };

            tokio::select! {
                result = main => result,
                () = token.cancelled() => None,
            }
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.semaphore.close();
            self.cancel_token.cancel();
            log::debug!("Worker pool shut down");
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = TaskPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(()));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_work_after_shutdown_is_not_run() {
        let pool = TaskPool::new(1);
        pool.shutdown();

        let result = pool.spawn(async { 42 }).await.unwrap();

        assert_eq!(result, None);
        assert!(pool.is_shut_down());
    }
}
