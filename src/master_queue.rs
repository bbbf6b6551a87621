use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Serializes every call against the master account and spaces successive
/// calls at least `tick` apart, capping the master-side call rate
/// regardless of how many producers are racing to read master state.
///
/// Implemented as a single gate (an async mutex guarding the timestamp of
/// the last completed call) rather than a channel-and-worker actor: holding
/// the lock across a call already gives the same one-at-a-time semantics,
/// with less machinery and no separate background task to manage.
pub struct MasterCallQueue {
    last_call: Mutex<Instant>,
    tick: Duration,
}

impl MasterCallQueue {
    /// `tick` is the minimum spacing between successive master calls
    /// (default 300ms caps the master at ~3.3 calls/sec).
    pub fn spawn(tick: Duration) -> Self {
        Self {
            last_call: Mutex::new(Instant::now() - tick),
            tick,
        }
    }

    /// Runs `job` once the gate opens, serialized against every other
    /// caller of this queue.
    pub async fn call<F, Fut, T>(&self, job: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut last_call = self.last_call.lock().await;
        let elapsed = last_call.elapsed();
        if elapsed < self.tick {
            tokio::time::sleep(self.tick - elapsed).await;
        }
        let result = job().await;
        *last_call = Instant::now();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn calls_are_serialized_and_return_results() {
        let queue = Arc::new(MasterCallQueue::spawn(Duration::from_millis(5)));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let counter = counter.clone();
            let result = queue.call(|| async move { counter.fetch_add(1, Ordering::SeqCst) + i }).await;
            assert!(result >= i);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn enforces_minimum_spacing_between_calls() {
        let queue = MasterCallQueue::spawn(Duration::from_millis(50));
        let start = Instant::now();
        queue.call(|| async { 1 }).await;
        queue.call(|| async { 2 }).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
