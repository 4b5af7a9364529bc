//! Completion waiting: observe a submitted stack operation until it settles.
//!
//! Two strategies, both bounded by a [`RetryPolicy`]:
//!
//! - [`WaitStrategy::PollForOutput`] returns as soon as the output key shows
//!   up, even if the stack is still in progress.
//! - [`WaitStrategy::PollToTerminal`] waits for a terminal status, then
//!   reads the outputs exactly once.
//!
//! Running out of attempts is not an error. The caller gets
//! `succeeded = false` and decides what a partial record means.

use crate::backend::StackBackend;
use crate::error::{BackendError, ProvisionError};
use crate::retry::{poll_bounded, Poll, PollOutcome, RetryPolicy, Sleeper};
use crate::types::{ConvergenceResult, StackDescription, StackStatus, UpsertOutcome};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    /// Stop as soon as the output is visible.
    ///
    /// On an updated stack the output from before the update is already
    /// there, so the first poll can return the old identifier. The pipeline
    /// waits for updates with [`WaitStrategy::PollToTerminal`] instead.
    #[default]
    PollForOutput,
    /// Wait for a terminal status, then read the output once.
    PollToTerminal,
}

impl WaitStrategy {
    /// Strategy to use after an upsert with `outcome`.
    pub fn for_outcome(self, outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Updated => WaitStrategy::PollToTerminal,
            _ => self,
        }
    }
}

impl FromStr for WaitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll-for-output" | "output" => Ok(WaitStrategy::PollForOutput),
            "poll-to-terminal" | "terminal" => Ok(WaitStrategy::PollToTerminal),
            other => Err(format!("unknown wait strategy '{}'", other)),
        }
    }
}

/// Waiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitConfig {
    pub strategy: WaitStrategy,
    pub policy: RetryPolicy,
    /// Attempts during which "stack does not exist" counts as not-yet-visible.
    pub not_found_grace_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            strategy: WaitStrategy::default(),
            policy: RetryPolicy::default(),
            not_found_grace_attempts: 3,
        }
    }
}

pub struct CompletionWaiter<'a, B: StackBackend, S: Sleeper> {
    backend: &'a B,
    sleeper: &'a S,
    config: WaitConfig,
}

impl<'a, B: StackBackend, S: Sleeper> CompletionWaiter<'a, B, S> {
    pub fn new(backend: &'a B, sleeper: &'a S, config: WaitConfig) -> Self {
        Self {
            backend,
            sleeper,
            config,
        }
    }

    /// Wait for `name` to converge and resolve `output_key` from its outputs.
    ///
    /// Fails with [`ProvisionError::ConvergenceFailed`] when the stack lands
    /// in a failure state, or with a backend error that is neither transient
    /// nor an early "does not exist".
    pub async fn await_identifier(
        &self,
        name: &str,
        output_key: &str,
    ) -> Result<ConvergenceResult, ProvisionError> {
        match self.config.strategy {
            WaitStrategy::PollForOutput => self.poll_for_output(name, output_key).await,
            WaitStrategy::PollToTerminal => self.poll_to_terminal(name, output_key).await,
        }
    }

    async fn poll_for_output(
        &self,
        name: &str,
        output_key: &str,
    ) -> Result<ConvergenceResult, ProvisionError> {
        let outcome = poll_bounded(&self.config.policy, self.sleeper, |attempt| async move {
            let Some(stack) = self.observe(name, attempt).await? else {
                return Ok(Poll::Pending);
            };
            if let Some(id) = stack.output(output_key) {
                return Ok(Poll::Ready(ConvergenceResult::resolved(id)));
            }
            if stack.status.is_failure() {
                return Err(failed(name, &stack.status));
            }
            if stack.status.is_success() {
                return Ok(Poll::Ready(ConvergenceResult::without_identifier()));
            }
            Ok::<_, ProvisionError>(Poll::Pending)
        })
        .await?;

        Ok(self.finish(name, outcome))
    }

    async fn poll_to_terminal(
        &self,
        name: &str,
        output_key: &str,
    ) -> Result<ConvergenceResult, ProvisionError> {
        let outcome = poll_bounded(&self.config.policy, self.sleeper, |attempt| async move {
            let poll = match self.observe(name, attempt).await? {
                Some(stack) if stack.status.is_terminal() => Poll::Ready(stack.status),
                _ => Poll::Pending,
            };
            Ok::<_, ProvisionError>(poll)
        })
        .await?;

        let status = match outcome {
            PollOutcome::Ready { value, .. } => value,
            PollOutcome::Exhausted { attempts } => {
                return Ok(self.finish(name, PollOutcome::Exhausted { attempts }));
            }
        };
        if status.is_failure() {
            return Err(failed(name, &status));
        }

        let stack = self.backend.describe_stack(name).await?;
        let result = match stack.output(output_key) {
            Some(id) => ConvergenceResult::resolved(id),
            None => ConvergenceResult::without_identifier(),
        };
        info!(stack = %name, %status, identifier = ?result.resolved_identifier, "stack converged");
        Ok(result)
    }

    /// One describe, with early absence and transient faults mapped to `None`.
    async fn observe(
        &self,
        name: &str,
        attempt: u32,
    ) -> Result<Option<StackDescription>, ProvisionError> {
        match self.backend.describe_stack(name).await {
            Ok(stack) => {
                debug!(stack = %name, attempt, status = %stack.status, "polled stack");
                Ok(Some(stack))
            }
            Err(BackendError::StackNotFound { .. })
                if attempt <= self.config.not_found_grace_attempts =>
            {
                debug!(stack = %name, attempt, "stack not describable yet");
                Ok(None)
            }
            Err(e) if e.is_transient() => {
                debug!(stack = %name, attempt, error = %e, "transient fault while polling");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&self, name: &str, outcome: PollOutcome<ConvergenceResult>) -> ConvergenceResult {
        match outcome {
            PollOutcome::Ready { value, attempts } => {
                info!(
                    stack = %name,
                    attempts,
                    identifier = ?value.resolved_identifier,
                    "stack converged"
                );
                value
            }
            PollOutcome::Exhausted { attempts } => {
                warn!(stack = %name, attempts, "gave up waiting for stack");
                ConvergenceResult::timed_out()
            }
        }
    }
}

/// Read a single output from an existing stack.
///
/// Unlike the waiter, a missing output is an error here: callers ask for
/// it because a later step needs it.
pub async fn lookup_output<B: StackBackend>(
    backend: &B,
    name: &str,
    output_key: &str,
) -> Result<String, ProvisionError> {
    let stack = backend.describe_stack(name).await?;
    stack
        .output(output_key)
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::OutputMissing {
            stack: name.to_string(),
            key: output_key.to_string(),
        })
}

fn failed(name: &str, status: &StackStatus) -> ProvisionError {
    ProvisionError::ConvergenceFailed {
        stack: name.to_string(),
        status: status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RecordingSleeper;
    use crate::types::{Pairs, StackRequest};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned describe results, then repeats the last one.
    struct Scripted {
        describes: Mutex<VecDeque<Result<StackDescription, BackendError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<StackDescription, BackendError>>) -> Self {
            Self {
                describes: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl StackBackend for Scripted {
        async fn describe_stack(&self, _name: &str) -> Result<StackDescription, BackendError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.describes.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }

        async fn create_stack(&self, _request: &StackRequest) -> Result<String, BackendError> {
            unreachable!("waiter never creates")
        }

        async fn update_stack(&self, _request: &StackRequest) -> Result<String, BackendError> {
            unreachable!("waiter never updates")
        }

        async fn delete_stack(&self, _name: &str) -> Result<(), BackendError> {
            unreachable!("waiter never deletes")
        }
    }

    fn stack(status: StackStatus, outputs: &[(&str, &str)]) -> Result<StackDescription, BackendError> {
        Ok(StackDescription {
            name: "ec2-web01".into(),
            status,
            outputs: outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Pairs>(),
        })
    }

    fn not_found() -> Result<StackDescription, BackendError> {
        Err(BackendError::StackNotFound {
            stack: "ec2-web01".into(),
        })
    }

    fn config(strategy: WaitStrategy, attempts: u32) -> WaitConfig {
        WaitConfig {
            strategy,
            policy: RetryPolicy::new(attempts, Duration::from_secs(15)),
            not_found_grace_attempts: 2,
        }
    }

    #[tokio::test]
    async fn test_poll_for_output_resolves_before_terminal() {
        let backend = Scripted::new(vec![
            not_found(),
            stack(StackStatus::CreateInProgress, &[]),
            stack(StackStatus::CreateInProgress, &[("InstanceId", "i-0abc")]),
        ]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollForOutput, 8));

        let result = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap();

        assert_eq!(result, ConvergenceResult::resolved("i-0abc"));
        assert_eq!(backend.calls(), 3);
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_poll_for_output_times_out_without_error() {
        let backend = Scripted::new(vec![stack(StackStatus::CreateInProgress, &[])]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollForOutput, 4));

        let result = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap();

        assert_eq!(result, ConvergenceResult::timed_out());
        assert_eq!(backend.calls(), 4);
        assert_eq!(sleeper.total(), Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_poll_for_output_terminal_without_key() {
        let backend = Scripted::new(vec![stack(StackStatus::CreateComplete, &[("Other", "x")])]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollForOutput, 8));

        let result = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap();

        assert_eq!(result, ConvergenceResult::without_identifier());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_found_after_grace_is_fatal() {
        let backend = Scripted::new(vec![not_found()]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollForOutput, 8));

        let err = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Backend(BackendError::StackNotFound { .. })
        ));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_faults_are_retried() {
        let backend = Scripted::new(vec![
            Err(BackendError::Throttled("rate exceeded".into())),
            Err(BackendError::Transport("connection reset".into())),
            stack(StackStatus::CreateComplete, &[("InstanceId", "i-1")]),
        ]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollToTerminal, 8));

        let result = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap();

        assert_eq!(result, ConvergenceResult::resolved("i-1"));
    }

    #[tokio::test]
    async fn test_poll_to_terminal_reads_outputs_once_after_success() {
        let backend = Scripted::new(vec![
            stack(StackStatus::UpdateInProgress, &[("InstanceId", "i-old")]),
            stack(StackStatus::UpdateCompleteCleanupInProgress, &[("InstanceId", "i-old")]),
            stack(StackStatus::UpdateComplete, &[("InstanceId", "i-new")]),
        ]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollToTerminal, 8));

        let result = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap();

        assert_eq!(result, ConvergenceResult::resolved("i-new"));
        // three polls plus the single outputs read
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test]
    async fn test_poll_to_terminal_failure_surfaces() {
        let backend = Scripted::new(vec![
            stack(StackStatus::CreateInProgress, &[]),
            stack(StackStatus::RollbackComplete, &[]),
        ]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollToTerminal, 8));

        let err = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap_err();

        match err {
            ProvisionError::ConvergenceFailed { stack, status } => {
                assert_eq!(stack, "ec2-web01");
                assert_eq!(status, "ROLLBACK_COMPLETE");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_poll_to_terminal_times_out() {
        let backend = Scripted::new(vec![stack(StackStatus::CreateInProgress, &[])]);
        let sleeper = RecordingSleeper::new();
        let waiter = CompletionWaiter::new(&backend, &sleeper, config(WaitStrategy::PollToTerminal, 3));

        let result = waiter.await_identifier("ec2-web01", "InstanceId").await.unwrap();

        assert!(!result.succeeded);
        assert!(result.resolved_identifier.is_none());
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_lookup_output() {
        let backend = Scripted::new(vec![stack(StackStatus::CreateComplete, &[("InstanceId", "i-9")])]);
        assert_eq!(
            lookup_output(&backend, "ec2-web01", "InstanceId").await.unwrap(),
            "i-9"
        );

        let err = lookup_output(&backend, "ec2-web01", "PublicIp").await.unwrap_err();
        assert!(matches!(err, ProvisionError::OutputMissing { .. }));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "poll-to-terminal".parse::<WaitStrategy>(),
            Ok(WaitStrategy::PollToTerminal)
        );
        assert_eq!("Output".parse::<WaitStrategy>(), Ok(WaitStrategy::PollForOutput));
        assert!("forever".parse::<WaitStrategy>().is_err());
    }

    #[test]
    fn test_updates_wait_for_terminal_status() {
        let configured = WaitStrategy::PollForOutput;
        assert_eq!(configured.for_outcome(UpsertOutcome::Created), WaitStrategy::PollForOutput);
        assert_eq!(configured.for_outcome(UpsertOutcome::Updated), WaitStrategy::PollToTerminal);
        assert_eq!(
            WaitStrategy::PollToTerminal.for_outcome(UpsertOutcome::Created),
            WaitStrategy::PollToTerminal
        );
    }
}
