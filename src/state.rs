//! Per-record state machine.
//!
//! `Start → Upserting → {NoChange → Complete, Created/Updated → Waiting}
//! → {timed out → Partial, resolved → Actuating} → Complete`.
//! A delete record goes `Start → Deleting → Complete`. Any fault moves the
//! record to `Failed`; the batch keeps going with the next record.

use crate::record::RecordPlan;
use crate::types::UpsertOutcome;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Start,
    Upserting,
    /// Waiting for the submitted operation to converge.
    Waiting,
    /// Sending the post-configuration command.
    Actuating { identifier: String },
    Deleting,
    Complete,
    /// Stack submitted, but convergence was not observed in time.
    Partial { reason: String },
    Failed { reason: String },
}

impl Step {
    /// Human-readable step name for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Start => "start",
            Step::Upserting => "upserting",
            Step::Waiting => "waiting",
            Step::Actuating { .. } => "actuating",
            Step::Deleting => "deleting",
            Step::Complete => "complete",
            Step::Partial { .. } => "partial",
            Step::Failed { .. } => "failed",
        }
    }
}

/// Everything known about one record's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordState {
    pub plan: RecordPlan,
    pub step: Step,
    pub outcome: Option<UpsertOutcome>,
    pub resolved_identifier: Option<String>,
    pub command_id: Option<String>,
    /// Unix timestamp of creation.
    pub started_at: u64,
    /// Unix timestamp of last transition.
    pub updated_at: u64,
}

impl RecordState {
    pub fn new(plan: RecordPlan) -> Self {
        let now = current_unix_time();
        Self {
            plan,
            step: Step::Start,
            outcome: None,
            resolved_identifier: None,
            command_id: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn stack_name(&self) -> &str {
        &self.plan.stack_name
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.step,
            Step::Complete | Step::Partial { .. } | Step::Failed { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.step, Step::Failed { .. })
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.step, Step::Complete)
    }

    pub fn transition(&mut self, step: Step) {
        self.step = step;
        self.updated_at = current_unix_time();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.transition(Step::Failed {
            reason: reason.into(),
        });
    }
}

fn current_unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordAction;
    use crate::types::Pairs;

    fn plan() -> RecordPlan {
        RecordPlan {
            index: 1,
            stack_name: "ec2-web01".into(),
            action: RecordAction::Upsert,
            parameters: Pairs::new(),
            tags: Pairs::new(),
            directive: None,
        }
    }

    #[test]
    fn test_new_state() {
        let state = RecordState::new(plan());
        assert_eq!(state.stack_name(), "ec2-web01");
        assert_eq!(state.step, Step::Start);
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        let mut state = RecordState::new(plan());

        state.transition(Step::Waiting);
        assert!(!state.is_terminal());

        state.transition(Step::Partial {
            reason: "timed out".into(),
        });
        assert!(state.is_terminal());
        assert!(!state.is_complete());

        state.fail("boom");
        assert!(state.is_failed());
        assert_eq!(state.step.name(), "failed");
    }
}
