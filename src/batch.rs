//! Batch processing: every record of one upload, one at a time.
//!
//! Records run sequentially in source order. A record that fails
//! validation is skipped; a record whose pipeline fails is marked failed;
//! either way the next record still runs. Two records naming the same
//! stack are not serialized beyond this ordering: the second one sees
//! whatever state the first submission left behind.

use crate::backend::{CommandBackend, StackBackend};
use crate::error::ProvisionError;
use crate::record::{Record, RecordSchema};
use crate::retry::Sleeper;
use crate::state::{RecordState, Step};
use crate::types::UpsertOutcome;
use crate::workflow::{RecordPipeline, StepResult};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

/// Final state of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordReport {
    pub index: usize,
    pub stack_name: Option<String>,
    /// Terminal step name, or `skipped`.
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<UpsertOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RecordReport {
    fn skipped(index: usize, stack_name: Option<String>, reason: String) -> Self {
        Self {
            index,
            stack_name,
            step: "skipped".into(),
            outcome: None,
            resolved_identifier: None,
            command_id: None,
            detail: Some(reason),
        }
    }

    fn from_state(state: &RecordState) -> Self {
        let detail = match &state.step {
            Step::Partial { reason } | Step::Failed { reason } => Some(reason.clone()),
            _ => None,
        };
        Self {
            index: state.plan.index,
            stack_name: Some(state.plan.stack_name.clone()),
            step: state.step.name().into(),
            outcome: state.outcome,
            resolved_identifier: state.resolved_identifier.clone(),
            command_id: state.command_id.clone(),
            detail,
        }
    }
}

/// Summary of one upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records: Vec<RecordReport>,
}

pub struct BatchRunner<'a, B: StackBackend, C: CommandBackend, S: Sleeper> {
    pipeline: RecordPipeline<'a, B, C, S>,
    schema: RecordSchema,
}

impl<'a, B: StackBackend, C: CommandBackend, S: Sleeper> BatchRunner<'a, B, C, S> {
    pub fn new(pipeline: RecordPipeline<'a, B, C, S>, schema: RecordSchema) -> Self {
        Self { pipeline, schema }
    }

    /// Run every record through the pipeline.
    ///
    /// Only errors that are not scoped to a single record escape.
    pub async fn run(&self, records: &[Record]) -> Result<BatchReport, ProvisionError> {
        let mut report = BatchReport::default();

        for (i, record) in records.iter().enumerate() {
            let index = i + 1;
            report.processed += 1;

            let plan = match self.schema.plan(index, record) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(record = index, error = %e, "skipping record");
                    report.skipped += 1;
                    let name = record.get(&self.schema.stack_name_field).cloned();
                    report
                        .records
                        .push(RecordReport::skipped(index, name, e.to_string()));
                    continue;
                }
            };

            let span = info_span!("record", record = index, stack = %plan.stack_name);
            let mut state = RecordState::new(plan);
            let result = self
                .pipeline
                .run_to_completion(&mut state)
                .instrument(span)
                .await;

            match result {
                Ok(StepResult::Complete) => {
                    info!(record = index, stack = %state.stack_name(), outcome = ?state.outcome, "record complete");
                    report.succeeded += 1;
                }
                Ok(StepResult::Partial(_)) => report.partial += 1,
                Ok(StepResult::Failed(reason)) => {
                    error!(record = index, stack = %state.stack_name(), %reason, "record failed");
                    report.failed += 1;
                }
                Ok(StepResult::Continue) => {
                    return Err(ProvisionError::InvalidState(format!(
                        "record {} stopped before a terminal step",
                        index
                    )));
                }
                Err(e) if e.is_record_scoped() => {
                    error!(record = index, stack = %state.stack_name(), error = %e, "record failed");
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
            report.records.push(RecordReport::from_state(&state));
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            partial = report.partial,
            failed = report.failed,
            skipped = report.skipped,
            "batch finished"
        );
        Ok(report)
    }
}
