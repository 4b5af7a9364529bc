//! Hand records off to a durable workflow engine.
//!
//! Instead of provisioning in-process, each valid record starts one
//! workflow execution whose input carries the record's non-empty fields and
//! the template location. The workflow engine then runs its own
//! upsert/wait/configure states.

use crate::error::{BackendError, ProvisionError};
use crate::record::Record;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

/// Starts workflow executions.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    /// Start one execution with a JSON `input`. Returns the execution id.
    async fn start_execution(&self, input: &str) -> Result<String, BackendError>;
}

/// Input document for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionInput<'a> {
    #[serde(rename = "Input")]
    pub input: Record,
    #[serde(rename = "TemplateURL")]
    pub template_url: &'a str,
}

/// Template URL for an object in the same bucket as the upload.
pub fn template_url_for(region: &str, bucket: &str, template_key: &str) -> String {
    format!(
        "https://s3.{}.amazonaws.com/{}/{}",
        region,
        bucket,
        template_key.trim_start_matches('/')
    )
}

pub struct HandoffDispatcher<'a, L: WorkflowLauncher + ?Sized> {
    launcher: &'a L,
    required_columns: &'a [String],
}

impl<'a, L: WorkflowLauncher + ?Sized> HandoffDispatcher<'a, L> {
    pub fn new(launcher: &'a L, required_columns: &'a [String]) -> Self {
        Self {
            launcher,
            required_columns,
        }
    }

    /// Start one execution per complete record, in source order.
    ///
    /// Records missing a required column are skipped. A launcher fault
    /// stops the dispatch: executions already started are not rolled back.
    pub async fn dispatch(
        &self,
        records: &[Record],
        template_url: &str,
    ) -> Result<Vec<String>, ProvisionError> {
        let mut executions = Vec::new();

        for (i, record) in records.iter().enumerate() {
            let index = i + 1;
            let missing = self.missing_columns(record);
            if !missing.is_empty() {
                warn!(record = index, missing = %missing.join(", "), "skipping record: missing required columns");
                continue;
            }

            let input = ExecutionInput {
                input: record
                    .iter()
                    .filter(|(_, v)| !v.trim().is_empty())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                template_url,
            };
            let body = serde_json::to_string(&input)
                .map_err(|e| ProvisionError::Handoff(format!("failed to encode input: {}", e)))?;

            let execution = self
                .launcher
                .start_execution(&body)
                .await
                .map_err(|e| ProvisionError::Handoff(format!("record {}: {}", index, e)))?;
            info!(record = index, %execution, "workflow execution started");
            executions.push(execution);
        }

        info!(count = executions.len(), "started workflow executions");
        Ok(executions)
    }

    fn missing_columns(&self, record: &Record) -> Vec<&'a str> {
        self.required_columns
            .iter()
            .filter(|c| record.get(c.as_str()).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
            .collect()
    }
}
