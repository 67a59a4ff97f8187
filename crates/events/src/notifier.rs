//! Completion notifier: callers park on a job id until its outcome is known.
//!
//! Each pending job id has exactly one waiter entry. A second caller
//! waiting on the same job attaches to that entry and receives the same
//! outcome. The first terminal signal (completed, failed, cancelled)
//! destroys the entry and releases every attached caller; later signals
//! for the job find nothing and are no-ops. Each caller also has its own
//! deadline, which only detaches that caller.
//!
//! Signals are a best-effort fast path. The job store remains the durable
//! record of a job's terminal status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kiln_core::job::GenerationResult;
use kiln_core::types::JobId;
use tokio::sync::oneshot;

/// Why a wait ended without a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The job reported a failure.
    #[error("Job failed: {0}")]
    Failed(String),

    /// The job was cancelled.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// No outcome arrived before the caller's deadline. The job may still
    /// be running.
    #[error("Timed out after {timeout_ms}ms waiting for job {job_id}")]
    Timeout { job_id: JobId, timeout_ms: u64 },

    /// The notifier is shutting down and accepts no new waiters.
    #[error("Completion notifier is shutting down")]
    ShuttingDown,
}

type Outcome = Result<GenerationResult, WaitError>;

/// Reason attached to a cancellation signal for a single job.
pub const CANCELLED_REASON: &str = "cancelled by request";

struct WaiterEntry {
    subscribers: Vec<(u64, oneshot::Sender<Outcome>)>,
}

#[derive(Default)]
struct NotifierState {
    waiters: HashMap<JobId, WaiterEntry>,
    closed: bool,
}

/// Registry of callers awaiting job outcomes.
#[derive(Default)]
pub struct CompletionNotifier {
    state: Mutex<NotifierState>,
    next_subscriber: AtomicU64,
}

impl CompletionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `job_id` to reach a terminal outcome, for at most `timeout`.
    ///
    /// Whichever comes first wins: a completion resolves with the result,
    /// a failure or cancellation rejects with its reason, and the deadline
    /// rejects with [`WaitError::Timeout`].
    pub async fn await_completion(&self, job_id: &str, timeout: Duration) -> Outcome {
        let mut subscription = self.attach(job_id)?;

        tokio::select! {
            outcome = &mut subscription.rx => {
                outcome.unwrap_or_else(|_| Err(WaitError::Cancelled(
                    "notifier dropped".to_string(),
                )))
            }
            _ = tokio::time::sleep(timeout) => {
                // A signal may have raced the deadline; honour it if so.
                match subscription.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::debug!(
                            job_id,
                            timeout_ms = timeout.as_millis() as u64,
                            "Wait for job timed out",
                        );
                        Err(WaitError::Timeout {
                            job_id: job_id.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                }
            }
        }
    }

    /// Resolve every waiter of `job_id` with `result`.
    ///
    /// Returns `true` if any caller was waiting.
    pub fn signal_completed(&self, job_id: &str, result: GenerationResult) -> bool {
        self.resolve(job_id, Ok(result))
    }

    /// Reject every waiter of `job_id` with a failure reason.
    pub fn signal_failed(&self, job_id: &str, reason: impl Into<String>) -> bool {
        self.resolve(job_id, Err(WaitError::Failed(reason.into())))
    }

    /// Reject every waiter of `job_id` as cancelled.
    pub fn signal_cancelled(&self, job_id: &str) -> bool {
        self.resolve(
            job_id,
            Err(WaitError::Cancelled(CANCELLED_REASON.to_string())),
        )
    }

    /// Reject every pending waiter and refuse new ones.
    ///
    /// Only used during shutdown. Returns the number of job ids released.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(JobId, WaiterEntry)> = {
            let mut state = self.lock();
            state.closed = true;
            state.waiters.drain().collect()
        };

        let count = drained.len();
        for (_, entry) in drained {
            for (_, tx) in entry.subscribers {
                let _ = tx.send(Err(WaitError::Cancelled(reason.to_string())));
            }
        }

        if count > 0 {
            tracing::info!(count, reason, "Cancelled pending job waiters");
        }
        count
    }

    /// Number of job ids with at least one caller waiting.
    pub fn pending_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Whether any caller is waiting on `job_id`.
    pub fn is_pending(&self, job_id: &str) -> bool {
        self.lock().waiters.contains_key(job_id)
    }

    // ---- private helpers ----

    fn lock(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, job_id: &str) -> Result<Subscription<'_>, WaitError> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        if state.closed {
            return Err(WaitError::ShuttingDown);
        }
        let entry = state
            .waiters
            .entry(job_id.to_string())
            .or_insert_with(|| WaiterEntry {
                subscribers: Vec::new(),
            });
        if !entry.subscribers.is_empty() {
            tracing::debug!(job_id, "Attaching to existing waiter");
        }
        entry.subscribers.push((id, tx));

        Ok(Subscription {
            notifier: self,
            job_id: job_id.to_string(),
            id,
            rx,
        })
    }

    /// Remove one caller; the entry goes with its last caller.
    fn detach(&self, job_id: &str, id: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.waiters.get_mut(job_id) {
            entry.subscribers.retain(|(sub, _)| *sub != id);
            if entry.subscribers.is_empty() {
                state.waiters.remove(job_id);
            }
        }
    }

    fn resolve(&self, job_id: &str, outcome: Outcome) -> bool {
        let entry = self.lock().waiters.remove(job_id);

        match entry {
            Some(entry) => {
                for (_, tx) in entry.subscribers {
                    let _ = tx.send(outcome.clone());
                }
                true
            }
            None => {
                tracing::debug!(job_id, "No waiter for job signal");
                false
            }
        }
    }
}

/// One caller's attachment to a waiter entry. Dropping it detaches the
/// caller, so abandoned waits do not linger.
struct Subscription<'a> {
    notifier: &'a CompletionNotifier,
    job_id: JobId,
    id: u64,
    rx: oneshot::Receiver<Outcome>,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.notifier.detach(&self.job_id, self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;

    fn result(job_id: &str) -> GenerationResult {
        GenerationResult {
            job_id: job_id.to_string(),
            worker_id: "w1".to_string(),
            artifact: vec![1, 2, 3],
            completed_at: chrono::Utc::now(),
        }
    }

    async fn wait_until_pending(notifier: &CompletionNotifier, job_id: &str) {
        while !notifier.is_pending(job_id) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn completion_resolves_waiter() {
        let notifier = Arc::new(CompletionNotifier::new());
        let waiter = {
            let n = Arc::clone(&notifier);
            tokio::spawn(async move { n.await_completion("job-1", Duration::from_secs(5)).await })
        };
        wait_until_pending(&notifier, "job-1").await;

        assert!(notifier.signal_completed("job-1", result("job-1")));
        let outcome = waiter.await.expect("join");
        assert_eq!(outcome.expect("completed").artifact, vec![1, 2, 3]);
        assert_eq!(notifier.pending_count(), 0);
    }

    #[tokio::test]
    async fn first_signal_wins() {
        let notifier = Arc::new(CompletionNotifier::new());
        let waiter = {
            let n = Arc::clone(&notifier);
            tokio::spawn(async move { n.await_completion("job-2", Duration::from_secs(5)).await })
        };
        wait_until_pending(&notifier, "job-2").await;

        assert!(notifier.signal_completed("job-2", result("job-2")));
        assert!(!notifier.signal_failed("job-2", "late failure"));
        assert!(!notifier.signal_cancelled("job-2"));

        assert!(waiter.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn failure_rejects_with_reason() {
        let notifier = Arc::new(CompletionNotifier::new());
        let waiter = {
            let n = Arc::clone(&notifier);
            tokio::spawn(async move { n.await_completion("job-3", Duration::from_secs(5)).await })
        };
        wait_until_pending(&notifier, "job-3").await;

        notifier.signal_failed("job-3", "out of memory");
        notifier.signal_completed("job-3", result("job-3"));

        assert_matches!(
            waiter.await.expect("join"),
            Err(WaitError::Failed(reason)) if reason == "out of memory"
        );
    }

    #[tokio::test]
    async fn cancellation_rejects() {
        let notifier = Arc::new(CompletionNotifier::new());
        let waiter = {
            let n = Arc::clone(&notifier);
            tokio::spawn(async move { n.await_completion("job-4", Duration::from_secs(5)).await })
        };
        wait_until_pending(&notifier, "job-4").await;

        notifier.signal_cancelled("job-4");
        assert_matches!(waiter.await.expect("join"), Err(WaitError::Cancelled(_)));
    }

    #[tokio::test]
    async fn timeout_rejects_and_restores_pending_count() {
        let notifier = CompletionNotifier::new();
        let before = notifier.pending_count();

        let started = std::time::Instant::now();
        let outcome = notifier
            .await_completion("job-42", Duration::from_millis(100))
            .await;

        assert_matches!(
            outcome,
            Err(WaitError::Timeout { job_id, timeout_ms: 100 }) if job_id == "job-42"
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(notifier.pending_count(), before);

        // A late signal finds nobody waiting.
        assert!(!notifier.signal_completed("job-42", result("job-42")));
    }

    #[test]
    fn signal_without_waiter_is_noop() {
        let notifier = CompletionNotifier::new();
        assert!(!notifier.signal_completed("ghost", result("ghost")));
        assert!(!notifier.signal_failed("ghost", "x"));
        assert!(!notifier.signal_cancelled("ghost"));
        assert_eq!(notifier.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_waiter_attaches_to_same_entry() {
        let notifier = Arc::new(CompletionNotifier::new());
        let spawn_waiter = |n: Arc<CompletionNotifier>| {
            tokio::spawn(async move { n.await_completion("job-5", Duration::from_secs(5)).await })
        };
        let first = spawn_waiter(Arc::clone(&notifier));
        wait_until_pending(&notifier, "job-5").await;
        let second = spawn_waiter(Arc::clone(&notifier));
        // Let the second caller attach.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(notifier.pending_count(), 1);
        notifier.signal_completed("job-5", result("job-5"));

        assert!(first.await.expect("join").is_ok());
        assert!(second.await.expect("join").is_ok());
        assert_eq!(notifier.pending_count(), 0);
    }

    #[tokio::test]
    async fn short_timeout_detaches_only_its_caller() {
        let notifier = Arc::new(CompletionNotifier::new());
        let long = {
            let n = Arc::clone(&notifier);
            tokio::spawn(async move { n.await_completion("job-6", Duration::from_secs(5)).await })
        };
        wait_until_pending(&notifier, "job-6").await;

        let short = notifier
            .await_completion("job-6", Duration::from_millis(20))
            .await;
        assert_matches!(short, Err(WaitError::Timeout { .. }));
        assert!(notifier.is_pending("job-6"));

        notifier.signal_completed("job-6", result("job-6"));
        assert!(long.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn cancel_all_rejects_everyone_and_closes() {
        let notifier = Arc::new(CompletionNotifier::new());
        let a = {
            let n = Arc::clone(&notifier);
            tokio::spawn(async move { n.await_completion("a", Duration::from_secs(5)).await })
        };
        let b = {
            let n = Arc::clone(&notifier);
            tokio::spawn(async move { n.await_completion("b", Duration::from_secs(5)).await })
        };
        wait_until_pending(&notifier, "a").await;
        wait_until_pending(&notifier, "b").await;

        assert_eq!(notifier.cancel_all("shutdown"), 2);
        assert_matches!(a.await.expect("join"), Err(WaitError::Cancelled(r)) if r == "shutdown");
        assert_matches!(b.await.expect("join"), Err(WaitError::Cancelled(_)));

        let late = notifier.await_completion("c", Duration::from_secs(1)).await;
        assert_matches!(late, Err(WaitError::ShuttingDown));
        assert_eq!(notifier.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_wait_detaches() {
        let notifier = CompletionNotifier::new();
        {
            let fut = notifier.await_completion("job-8", Duration::from_secs(5));
            tokio::pin!(fut);
            // Poll once so the caller attaches, then abandon it.
            let _ = futures_poll_once(fut.as_mut()).await;
            assert!(notifier.is_pending("job-8"));
        }
        assert_eq!(notifier.pending_count(), 0);
    }

    async fn futures_poll_once<F: std::future::Future + Unpin>(fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            out = fut => Some(out),
            _ = std::future::ready(()) => None,
        }
    }
}
