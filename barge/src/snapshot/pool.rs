use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::error::{BargeResult, ErrorKind};

/// Bounded worker pool for batch imports.
///
/// [`BatchImportPool::submit`] blocks once `size` tasks are in flight, which
/// backpressures the splitter: batches are produced at most `size` ahead of
/// the loads draining them. The target connection pool further limits how
/// many of the admitted tasks run COPY concurrently.
pub struct BatchImportPool {
    join_set: JoinSet<BargeResult<()>>,
    semaphore: Arc<Semaphore>,
}

impl BatchImportPool {
    /// Creates a pool admitting at most `size` concurrent tasks.
    pub fn new(size: usize) -> Self {
        Self {
            join_set: JoinSet::new(),
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    /// Spawns a task once a slot frees up.
    pub async fn submit<F>(&mut self, future: F) -> BargeResult<()>
    where
        F: Future<Output = BargeResult<()>> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| {
                crate::barge_error!(ErrorKind::WorkerFailed, "Worker pool is closed")
                    .with_source(err)
            })?;

        self.join_set.spawn(async move {
            let _permit = permit;
            future.await
        });

        Ok(())
    }

    /// Waits for every submitted task to finish.
    ///
    /// All failures are logged; the first one is returned.
    pub async fn wait_all(&mut self) -> BargeResult<()> {
        let mut first_error = None;

        while let Some(result) = self.join_set.join_next().await {
            let result = match result {
                Ok(result) => result,
                Err(join_err) => Err(crate::barge_error!(
                    ErrorKind::WorkerFailed,
                    "Batch import worker panicked"
                )
                .with_source(join_err)),
            };

            if let Err(err) = result {
                error!(error = %err, "batch import worker failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_submitted_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = BatchImportPool::new(4);

        for _ in 0..16 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }

        pool.wait_all().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = BatchImportPool::new(3);

        for _ in 0..12 {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }

        pool.wait_all().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn first_failure_is_reported_after_all_tasks_finish() {
        let mut pool = BatchImportPool::new(2);

        pool.submit(async { Ok(()) }).await.unwrap();
        pool.submit(async {
            Err(crate::barge_error!(
                ErrorKind::CopyRejected,
                "Bulk load rejected by the target"
            ))
        })
        .await
        .unwrap();

        let err = pool.wait_all().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CopyRejected);
    }
}
