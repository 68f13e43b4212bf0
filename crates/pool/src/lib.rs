//! kcopy pool: bounded-concurrency executor for copy tasks.
//!
//! A batch is submitted and awaited as a whole; at most `size` jobs run at any instant and
//! every job yields exactly one [`CopyResult`], whether it succeeds, fails, panics or is
//! skipped because the run was cancelled.

#![forbid(unsafe_code)]

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use kcopy_core::{CopyError, CopyOutcome, CopyResult, CopyTask};
use metrics::{counter, gauge, histogram};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct WorkerPool {
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(size: usize, cancel: CancellationToken) -> CopyOutcome<Self> {
        if size == 0 {
            return Err(CopyError::Configuration("pool size must be at least 1".into()));
        }
        Ok(Self { size, cancel })
    }

    pub fn size(&self) -> usize { self.size }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Run every job through `work` and return one result per job (in completion order).
    ///
    /// Returns only after all spawned jobs have finished, so nothing outlives the batch.
    pub async fn run_batch<T, F, Fut>(&self, jobs: Vec<(CopyTask, T)>, work: F) -> Vec<CopyResult>
    where
        T: Send + 'static,
        F: Fn(CopyTask, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CopyOutcome<()>> + Send + 'static,
    {
        counter!("pool_batches_total", 1u64);
        let total = jobs.len();
        let work = Arc::new(work);
        let mut results = Vec::with_capacity(total);
        let mut pending: Vec<Option<CopyTask>> = vec![None; total];
        let mut join_set: JoinSet<(usize, CopyResult)> = JoinSet::new();

        for (idx, (task, payload)) in jobs.into_iter().enumerate() {
            while join_set.len() >= self.size {
                collect(join_set.join_next().await, &mut pending, &mut results);
            }
            if self.cancel.is_cancelled() {
                results.push(CopyResult::failure(task, CopyError::Cancelled));
                continue;
            }
            pending[idx] = Some(task.clone());
            let work = Arc::clone(&work);
            join_set.spawn(async move {
                let t0 = Instant::now();
                let run = AssertUnwindSafe(async { (*work)(task.clone(), payload).await }).catch_unwind().await;
                histogram!("copy_task_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                let result = match run {
                    Ok(Ok(())) => CopyResult::success(task),
                    Ok(Err(e)) => CopyResult::failure(task, e),
                    Err(_) => CopyResult::failure(task, CopyError::Internal("copy task panicked".into())),
                };
                (idx, result)
            });
            gauge!("pool_in_flight", join_set.len() as f64);
        }
        while !join_set.is_empty() {
            collect(join_set.join_next().await, &mut pending, &mut results);
        }
        gauge!("pool_in_flight", 0.0);

        // A task that never reported back (runtime shutdown) still gets its result.
        for task in pending.into_iter().flatten() {
            results.push(CopyResult::failure(task, CopyError::Internal("copy task aborted".into())));
        }
        let failed = results.iter().filter(|r| !r.is_success()).count();
        counter!("copy_tasks_total", total as u64);
        counter!("copy_task_failures_total", failed as u64);
        debug!(total, failed, size = self.size, "batch drained");
        results
    }
}

fn collect(
    joined: Option<Result<(usize, CopyResult), tokio::task::JoinError>>,
    pending: &mut [Option<CopyTask>],
    results: &mut Vec<CopyResult>,
) {
    match joined {
        Some(Ok((idx, result))) => {
            pending[idx] = None;
            results.push(result);
        }
        Some(Err(e)) => warn!(error = %e, "copy task did not complete"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcopy_core::{Direction, ResourceCoordinate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(name: &str) -> CopyTask {
        CopyTask::new(ResourceCoordinate::new("", "v1", "pods"), Some("default"), name, Direction::Download)
    }

    fn jobs(n: usize) -> Vec<(CopyTask, usize)> {
        (0..n).map(|i| (task(&format!("p{i}")), i)).collect()
    }

    #[derive(Default)]
    struct Gauge {
        running: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    async fn observed(gauge: Arc<Gauge>) -> CopyOutcome<()> {
        let now = gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        gauge.running.fetch_sub(1, Ordering::SeqCst);
        gauge.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn zero_size_is_configuration_error() {
        assert!(matches!(WorkerPool::new(0, CancellationToken::new()), Err(CopyError::Configuration(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_pods_two_workers() {
        let pool = WorkerPool::new(2, CancellationToken::new()).unwrap();
        let gauge = Arc::new(Gauge::default());
        let p = Arc::clone(&gauge);
        let results = pool.run_batch(jobs(3), move |_t, _i| observed(Arc::clone(&p))).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(gauge.done.load(Ordering::SeqCst), 3);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_pool_size() {
        for (batch, size) in [(1, 1), (7, 1), (10, 3), (25, 8), (4, 16)] {
            let pool = WorkerPool::new(size, CancellationToken::new()).unwrap();
            let gauge = Arc::new(Gauge::default());
            let p = Arc::clone(&gauge);
            let results = pool.run_batch(jobs(batch), move |_t, _i| observed(Arc::clone(&p))).await;
            assert_eq!(results.len(), batch);
            let peak = gauge.peak.load(Ordering::SeqCst);
            assert!(peak <= size, "batch={batch} size={size} peak={peak}");
            assert_eq!(gauge.running.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn failures_and_panics_stay_local() {
        let pool = WorkerPool::new(2, CancellationToken::new()).unwrap();
        let results = pool
            .run_batch(jobs(5), |_t, i| async move {
                match i {
                    1 => Err(CopyError::Transport("boom".into())),
                    3 => panic!("worker blew up"),
                    _ => Ok(()),
                }
            })
            .await;
        assert_eq!(results.len(), 5);
        let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).map(|r| r.task.object_name.clone()).collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.contains(&"p1".to_string()));
        assert!(failed.contains(&"p3".to_string()));
        let panicked = results.iter().find(|r| r.task.object_name == "p3").unwrap();
        assert!(matches!(panicked.error, Some(CopyError::Internal(_))));
    }

    #[tokio::test]
    async fn pool_is_reusable_across_batches() {
        let pool = WorkerPool::new(3, CancellationToken::new()).unwrap();
        for n in [4, 0, 9] {
            let results = pool.run_batch(jobs(n), |_t, _i| async { Ok(()) }).await;
            assert_eq!(results.len(), n);
        }
    }

    #[tokio::test]
    async fn cancelled_run_starts_nothing() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(2, cancel.clone()).unwrap();
        cancel.cancel();
        let started = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&started);
        let results = pool
            .run_batch(jobs(4), move |_t, _i| {
                let s = Arc::clone(&s);
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert!(results.iter().all(|r| r.error == Some(CopyError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_mid_batch_drains_in_flight() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(1, cancel.clone()).unwrap();
        let c = cancel.clone();
        let results = pool
            .run_batch(jobs(3), move |_t, i| {
                let c = c.clone();
                async move {
                    if i == 0 {
                        c.cancel();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(())
                }
            })
            .await;
        assert_eq!(results.len(), 3);
        let first = results.iter().find(|r| r.task.object_name == "p0").unwrap();
        assert!(first.is_success());
        assert_eq!(results.iter().filter(|r| r.error == Some(CopyError::Cancelled)).count(), 2);
    }
}
