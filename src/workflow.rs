//! Record Pipeline
//!
//! The state machine that drives one record: upsert, wait, post-configure.
//! It only transitions between steps and calls the
//! upserter, waiter and actuator. No parsing, no SDKs. Just logic.

use crate::actuator::PostConfigActuator;
use crate::backend::{CommandBackend, StackBackend};
use crate::error::ProvisionError;
use crate::record::{RecordAction, StackDefaults};
use crate::retry::Sleeper;
use crate::state::{RecordState, Step};
use crate::types::UpsertOutcome;
use crate::upsert::StackUpserter;
use crate::waiter::{CompletionWaiter, WaitConfig, WaitStrategy};
use tracing::{debug, info, warn};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Template, role, and shared parameters/tags for every request.
    pub defaults: StackDefaults,
    /// Output holding the provisioned resource's identifier.
    pub output_key: String,
    pub wait: WaitConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            defaults: StackDefaults::default(),
            output_key: "InstanceId".into(),
            wait: WaitConfig::default(),
        }
    }
}

/// Result of advancing one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Keep going, call advance() again.
    Continue,
    /// Done successfully.
    Complete,
    /// Stack submitted; convergence or post-configuration did not happen.
    Partial(String),
    Failed(String),
}

/// The per-record pipeline.
///
/// Parameterized by the backends; you provide the implementations.
pub struct RecordPipeline<'a, B: StackBackend, C: CommandBackend, S: Sleeper> {
    stacks: &'a B,
    commands: &'a C,
    sleeper: &'a S,
    config: PipelineConfig,
}

impl<'a, B: StackBackend, C: CommandBackend, S: Sleeper> RecordPipeline<'a, B, C, S> {
    pub fn new(stacks: &'a B, commands: &'a C, sleeper: &'a S, config: PipelineConfig) -> Self {
        Self {
            stacks,
            commands,
            sleeper,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Advance the record by one step.
    ///
    /// Each step does ONE thing, then transitions. Call this in a loop
    /// until you get something other than `Continue`.
    pub async fn advance(&self, state: &mut RecordState) -> Result<StepResult, ProvisionError> {
        debug!(stack = %state.stack_name(), step = state.step.name(), "advancing record");
        match state.step.clone() {
            Step::Start => self.step_start(state),
            Step::Upserting => self.step_upsert(state).await,
            Step::Waiting => self.step_wait(state).await,
            Step::Actuating { identifier } => self.step_actuate(state, &identifier).await,
            Step::Deleting => self.step_delete(state).await,
            Step::Complete => Ok(StepResult::Complete),
            Step::Partial { reason } => Ok(StepResult::Partial(reason)),
            Step::Failed { reason } => Ok(StepResult::Failed(reason)),
        }
    }

    /// Run until the record reaches a terminal step.
    ///
    /// On error the record is marked failed before the error is returned.
    pub async fn run_to_completion(
        &self,
        state: &mut RecordState,
    ) -> Result<StepResult, ProvisionError> {
        loop {
            match self.advance(state).await {
                Ok(StepResult::Continue) => continue,
                Ok(other) => return Ok(other),
                Err(e) => {
                    state.fail(e.to_string());
                    return Err(e);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // STEP IMPLEMENTATIONS
    // ═══════════════════════════════════════════════════════════════

    fn step_start(&self, state: &mut RecordState) -> Result<StepResult, ProvisionError> {
        match state.plan.action {
            RecordAction::Delete => state.transition(Step::Deleting),
            RecordAction::Upsert => state.transition(Step::Upserting),
        }
        Ok(StepResult::Continue)
    }

    async fn step_upsert(&self, state: &mut RecordState) -> Result<StepResult, ProvisionError> {
        let request = state.plan.to_request(&self.config.defaults);
        let outcome = StackUpserter::new(self.stacks).upsert(&request).await?;
        state.outcome = Some(outcome);

        if outcome == UpsertOutcome::NoChange {
            state.transition(Step::Complete);
            return Ok(StepResult::Complete);
        }

        state.transition(Step::Waiting);
        Ok(StepResult::Continue)
    }

    async fn step_wait(&self, state: &mut RecordState) -> Result<StepResult, ProvisionError> {
        if !state.outcome.is_some_and(|o| o.needs_convergence()) {
            return Err(ProvisionError::InvalidState(format!(
                "nothing to wait for on stack {}",
                state.stack_name()
            )));
        }

        let mut wait = self.config.wait.clone();
        if let Some(outcome) = state.outcome {
            wait.strategy = wait.strategy.for_outcome(outcome);
        }
        let strategy = wait.strategy;
        let attempts = wait.policy.max_attempts;

        let waiter = CompletionWaiter::new(self.stacks, self.sleeper, wait);
        let result = waiter
            .await_identifier(state.stack_name(), &self.config.output_key)
            .await?;

        if !result.succeeded {
            let reason = match strategy {
                WaitStrategy::PollForOutput => format!(
                    "no {} after {} attempts; post-configuration skipped",
                    self.config.output_key, attempts
                ),
                WaitStrategy::PollToTerminal => format!(
                    "stack not in a terminal status after {} attempts; post-configuration skipped",
                    attempts
                ),
            };
            warn!(stack = %state.stack_name(), %reason, "record partially complete");
            state.transition(Step::Partial {
                reason: reason.clone(),
            });
            return Ok(StepResult::Partial(reason));
        }

        state.resolved_identifier = result.resolved_identifier.clone();
        match (result.resolved_identifier, state.plan.directive.as_ref()) {
            (Some(identifier), Some(_)) => {
                state.transition(Step::Actuating { identifier });
                Ok(StepResult::Continue)
            }
            _ => {
                state.transition(Step::Complete);
                Ok(StepResult::Complete)
            }
        }
    }

    async fn step_actuate(
        &self,
        state: &mut RecordState,
        identifier: &str,
    ) -> Result<StepResult, ProvisionError> {
        let directive = state.plan.directive.clone().ok_or_else(|| {
            ProvisionError::InvalidState("directive missing at Actuating".into())
        })?;

        state.command_id = PostConfigActuator::new(self.commands)
            .apply(identifier, &directive)
            .await;
        state.transition(Step::Complete);
        Ok(StepResult::Complete)
    }

    async fn step_delete(&self, state: &mut RecordState) -> Result<StepResult, ProvisionError> {
        self.stacks.delete_stack(state.stack_name()).await?;
        info!(stack = %state.stack_name(), "stack deletion submitted");
        state.transition(Step::Complete);
        Ok(StepResult::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::record::{Record, RecordSchema};
    use crate::retry::RecordingSleeper;

    fn state(fields: &[(&str, &str)]) -> RecordState {
        let record: Record = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RecordState::new(RecordSchema::default().plan(1, &record).unwrap())
    }

    #[tokio::test]
    async fn test_advance_one_step_at_a_time() {
        let backend = InMemoryBackend::new();
        let sleeper = RecordingSleeper::new();
        let pipeline = RecordPipeline::new(&backend, &backend, &sleeper, PipelineConfig::default());
        let mut state = state(&[("StackName", "ec2-app01"), ("HostName", "APP01")]);

        assert_eq!(pipeline.advance(&mut state).await.unwrap(), StepResult::Continue);
        assert_eq!(state.step, Step::Upserting);

        assert_eq!(pipeline.advance(&mut state).await.unwrap(), StepResult::Continue);
        assert_eq!(state.step, Step::Waiting);
        assert_eq!(state.outcome, Some(UpsertOutcome::Created));

        assert_eq!(pipeline.advance(&mut state).await.unwrap(), StepResult::Continue);
        assert!(matches!(state.step, Step::Actuating { .. }));

        assert_eq!(pipeline.advance(&mut state).await.unwrap(), StepResult::Complete);
        assert!(state.command_id.is_some());

        // terminal steps are sticky
        assert_eq!(pipeline.advance(&mut state).await.unwrap(), StepResult::Complete);
    }

    #[tokio::test]
    async fn test_wait_without_submission_is_invalid() {
        let backend = InMemoryBackend::new();
        let sleeper = RecordingSleeper::new();
        let pipeline = RecordPipeline::new(&backend, &backend, &sleeper, PipelineConfig::default());
        let mut state = state(&[("StackName", "ec2-app01")]);
        state.transition(Step::Waiting);

        let err = pipeline.run_to_completion(&mut state).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidState(_)));
        assert!(state.is_failed());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_partial_reason_follows_strategy() {
        let backend = InMemoryBackend::with_config(crate::memory::SimulationConfig {
            settle_after: 10,
            ..Default::default()
        });
        let sleeper = RecordingSleeper::new();
        let mut config = PipelineConfig::default();
        config.wait.policy = crate::retry::RetryPolicy::new(2, std::time::Duration::from_secs(1));

        let pipeline = RecordPipeline::new(&backend, &backend, &sleeper, config.clone());
        let mut first = state(&[("StackName", "ec2-app01")]);
        let StepResult::Partial(reason) = pipeline.run_to_completion(&mut first).await.unwrap() else {
            panic!("expected a partial result");
        };
        assert_eq!(reason, "no InstanceId after 2 attempts; post-configuration skipped");

        config.wait.strategy = WaitStrategy::PollToTerminal;
        let pipeline = RecordPipeline::new(&backend, &backend, &sleeper, config);
        let mut second = state(&[("StackName", "ec2-app02")]);
        let StepResult::Partial(reason) = pipeline.run_to_completion(&mut second).await.unwrap() else {
            panic!("expected a partial result");
        };
        assert_eq!(
            reason,
            "stack not in a terminal status after 2 attempts; post-configuration skipped"
        );
    }
}
