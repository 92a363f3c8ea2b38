//! Completion polling for the submitted job.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compute::{ComputeBackend, TaskStatus};

/// Interval between state checks when the caller does not override it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How a completed wait resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// Every task belonging to the job reached a terminal state.
    Completed,
    /// The caller's cancellation token fired before completion.
    Cancelled,
}

/// Errors raised while polling task state.
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the task listing cannot be fetched.
    #[error("failed to list task states for job {job_id}: {source}")]
    Status {
        /// Job being polled.
        job_id: String,
        /// Backend error.
        #[source]
        source: E,
    },
}

/// Waits for every task in a job to reach a terminal state.
///
/// Terminal detection is state-based: a task whose command exited non-zero
/// still counts as complete. The wait carries no deadline of its own;
/// callers bound it through the cancellation token.
#[derive(Clone, Copy, Debug)]
pub struct CompletionPoller {
    interval: Duration,
}

impl Default for CompletionPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionPoller {
    /// Creates a poller using [`DEFAULT_POLL_INTERVAL`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the polling interval. Primarily used by tests to keep
    /// polling scenarios fast.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Polls until every task in the job is terminal or `cancel` fires.
    ///
    /// A round observing zero tasks is treated as not yet complete: the
    /// task is created before polling starts, so an empty listing is a
    /// transient service view, not completion.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Status`] when a task listing fails.
    pub async fn await_completion<C: ComputeBackend>(
        &self,
        backend: &C,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, PollError<C::Error>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }

            let states = backend
                .task_states(job_id)
                .await
                .map_err(|source| PollError::Status {
                    job_id: job_id.to_owned(),
                    source,
                })?;

            let pending = states.iter().filter(|state| !state.is_terminal()).count();
            if !states.is_empty() && pending == 0 {
                return Ok(WaitOutcome::Completed);
            }
            debug!(job_id, total = states.len(), pending, "tasks not yet complete");

            tokio::select! {
                () = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                () = sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCompute;
    use rstest::rstest;

    fn fast_poller() -> CompletionPoller {
        CompletionPoller::new().with_interval(Duration::from_millis(1))
    }

    #[rstest]
    #[tokio::test]
    async fn returns_on_first_terminal_observation() {
        let backend = ScriptedCompute::new();
        backend.push_states(vec![TaskStatus::Completed]);

        let outcome = fast_poller()
            .await_completion(&backend, "job", &CancellationToken::new())
            .await
            .expect("poll should succeed");
        assert_eq!(outcome, WaitOutcome::Completed);
        assert_eq!(backend.state_queries(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn keeps_polling_while_any_task_is_active() {
        let backend = ScriptedCompute::new();
        backend.push_states(vec![TaskStatus::Active]);
        backend.push_states(vec![TaskStatus::Running]);
        backend.push_states(vec![TaskStatus::Completed]);

        let outcome = fast_poller()
            .await_completion(&backend, "job", &CancellationToken::new())
            .await
            .expect("poll should succeed");
        assert_eq!(outcome, WaitOutcome::Completed);
        assert_eq!(backend.state_queries(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn non_zero_exit_is_still_terminal() {
        // The poller only sees states; a failed command still reports
        // Completed and the wait must end.
        let backend = ScriptedCompute::new();
        backend.push_states(vec![TaskStatus::Completed, TaskStatus::Completed]);

        let outcome = fast_poller()
            .await_completion(&backend, "job", &CancellationToken::new())
            .await
            .expect("poll should succeed");
        assert_eq!(outcome, WaitOutcome::Completed);
    }

    #[rstest]
    #[tokio::test]
    async fn empty_listing_is_not_completion() {
        let backend = ScriptedCompute::new();
        backend.push_states(Vec::new());
        backend.push_states(vec![TaskStatus::Completed]);

        let outcome = fast_poller()
            .await_completion(&backend, "job", &CancellationToken::new())
            .await
            .expect("poll should succeed");
        assert_eq!(outcome, WaitOutcome::Completed);
        assert_eq!(backend.state_queries(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let backend = ScriptedCompute::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = fast_poller()
            .await_completion(&backend, "job", &cancel)
            .await
            .expect("poll should resolve");
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert_eq!(backend.state_queries(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn cancellation_during_sleep_resolves_cancelled() {
        let backend = ScriptedCompute::new();
        backend.push_states(vec![TaskStatus::Running]);
        let cancel = CancellationToken::new();

        let poller = CompletionPoller::new().with_interval(Duration::from_secs(3600));
        let wait = poller.await_completion(&backend, "job", &cancel);
        tokio::pin!(wait);

        tokio::select! {
            _ = &mut wait => panic!("wait should not resolve before cancellation"),
            () = tokio::time::sleep(Duration::from_millis(10)) => cancel.cancel(),
        }
        let outcome = wait.await.expect("poll should resolve");
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[rstest]
    #[tokio::test]
    async fn listing_failures_are_surfaced() {
        let backend = ScriptedCompute::new();
        backend.fail_operation("task_states");

        let err = fast_poller()
            .await_completion(&backend, "job", &CancellationToken::new())
            .await
            .expect_err("poll should fail");
        let PollError::Status { job_id, .. } = err;
        assert_eq!(job_id, "job");
    }
}
