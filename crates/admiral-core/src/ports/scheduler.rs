//! Scheduler port - 遅延後に job を 1 回実行する

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fire-and-forget delayed execution.
///
/// Used by the pollers between attempts. Implementations must not block the
/// caller.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, job: Job);
}

/// Spawns each job on the current tokio runtime after `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, job: Job) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            job.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn job_runs_after_the_delay() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        TokioScheduler.schedule(
            Duration::from_secs(20),
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(!ran.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
