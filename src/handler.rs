//! Per-upload invocation: storage event in, HTTP-style response out.
//!
//! Success is `200` with a JSON body. Malformed events, unreadable files
//! and configuration faults are `400`; backend and internal faults are
//! `500`. Nothing escapes as a panic or a bare error.

use crate::backend::{CommandBackend, StackBackend};
use crate::batch::BatchRunner;
use crate::config::{Mode, ProvisionConfig};
use crate::error::ProvisionError;
use crate::handoff::{HandoffDispatcher, WorkflowLauncher};
use crate::retry::Sleeper;
use crate::source::{load_records, ObjectSource};
use crate::workflow::RecordPipeline;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Object-created notification, as delivered by the storage service.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<StorageEventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageEventRecord {
    pub s3: StorageEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageEntity {
    pub bucket: BucketRef,
    pub object: ObjectKeyRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectKeyRef {
    pub key: String,
}

/// The uploaded object an invocation works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub bucket: String,
    pub key: String,
}

impl StorageEvent {
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, ProvisionError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| ProvisionError::Event(format!("not a storage event: {}", e)))
    }

    /// The first record's object, with its key URL-decoded.
    pub fn uploaded_object(&self) -> Result<UploadedObject, ProvisionError> {
        let record = self
            .records
            .first()
            .ok_or_else(|| ProvisionError::Event("event has no records".into()))?;
        Ok(UploadedObject {
            bucket: record.s3.bucket.name.clone(),
            key: decode_object_key(&record.s3.object.key)?,
        })
    }
}

/// Undo the form encoding applied to object keys in notifications.
pub fn decode_object_key(raw: &str) -> Result<String, ProvisionError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|e| ProvisionError::Event(format!("object key is not valid UTF-8: {}", e)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl InvocationResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: body.into(),
        }
    }

    pub fn from_error(err: &ProvisionError) -> Self {
        Self {
            status_code: err.status_code(),
            body: err.to_string(),
        }
    }
}

/// One invocation's collaborators.
pub struct Invocation<'a, B: StackBackend, C: CommandBackend, S: Sleeper> {
    config: &'a ProvisionConfig,
    stacks: &'a B,
    commands: &'a C,
    sleeper: &'a S,
    objects: &'a dyn ObjectSource,
    launcher: Option<&'a dyn WorkflowLauncher>,
}

impl<'a, B: StackBackend, C: CommandBackend, S: Sleeper> Invocation<'a, B, C, S> {
    pub fn new(
        config: &'a ProvisionConfig,
        stacks: &'a B,
        commands: &'a C,
        sleeper: &'a S,
        objects: &'a dyn ObjectSource,
    ) -> Self {
        Self {
            config,
            stacks,
            commands,
            sleeper,
            objects,
            launcher: None,
        }
    }

    pub fn with_launcher(mut self, launcher: &'a dyn WorkflowLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Handle a raw event document.
    pub async fn handle_json(&self, raw: &serde_json::Value) -> InvocationResponse {
        match StorageEvent::from_json(raw) {
            Ok(event) => self.handle(&event).await,
            Err(e) => {
                error!(error = %e, "rejecting event");
                InvocationResponse::from_error(&e)
            }
        }
    }

    pub async fn handle(&self, event: &StorageEvent) -> InvocationResponse {
        match self.try_handle(event).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, status = e.status_code(), "invocation failed");
                InvocationResponse::from_error(&e)
            }
        }
    }

    async fn try_handle(&self, event: &StorageEvent) -> Result<InvocationResponse, ProvisionError> {
        self.config.validate()?;
        let object = event.uploaded_object()?;
        info!(bucket = %object.bucket, key = %object.key, "processing upload");

        let records = load_records(self.objects, &object.bucket, &object.key).await?;

        match self.config.mode {
            Mode::Stack => self.provision(&object, &records).await,
            Mode::Workflow => self.hand_off(&object, &records).await,
        }
    }

    async fn provision(
        &self,
        object: &UploadedObject,
        records: &[crate::record::Record],
    ) -> Result<InvocationResponse, ProvisionError> {
        let pipeline_config = self.config.pipeline_config(&object.bucket, &object.key)?;
        let pipeline = RecordPipeline::new(self.stacks, self.commands, self.sleeper, pipeline_config);
        let runner = BatchRunner::new(pipeline, self.config.schema.clone());

        let report = runner.run(records).await?;
        let body = serde_json::to_string(&report)
            .map_err(|e| ProvisionError::InvalidState(format!("failed to encode report: {}", e)))?;
        Ok(InvocationResponse::ok(body))
    }

    async fn hand_off(
        &self,
        object: &UploadedObject,
        records: &[crate::record::Record],
    ) -> Result<InvocationResponse, ProvisionError> {
        let launcher = self.launcher.ok_or_else(|| {
            ProvisionError::Configuration("workflow mode needs a workflow launcher".into())
        })?;
        let template_url = self
            .config
            .template
            .as_ref()
            .map(|t| t.resolve(&object.bucket))
            .ok_or_else(|| ProvisionError::Configuration("TEMPLATE_URL or TEMPLATE_KEY is not set".into()))?;
        info!(%template_url, "using stack template");

        let executions = HandoffDispatcher::new(launcher, &self.config.required_columns)
            .dispatch(records, &template_url)
            .await?;
        let body = serde_json::to_string(&executions)
            .map_err(|e| ProvisionError::InvalidState(format!("failed to encode executions: {}", e)))?;
        Ok(InvocationResponse::ok(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("uploads/my+hosts%282%29.csv").unwrap(), "uploads/my hosts(2).csv");
        assert_eq!(decode_object_key("plain.csv").unwrap(), "plain.csv");
        assert!(decode_object_key("bad%FF.csv").is_err());
    }

    #[test]
    fn test_event_parsing() {
        let raw = json!({
            "Records": [{
                "s3": {
                    "bucket": {"name": "uploads"},
                    "object": {"key": "in/ec2+hosts.csv", "size": 120}
                }
            }]
        });
        let event = StorageEvent::from_json(&raw).unwrap();
        assert_eq!(
            event.uploaded_object().unwrap(),
            UploadedObject {
                bucket: "uploads".into(),
                key: "in/ec2 hosts.csv".into(),
            }
        );

        let empty = StorageEvent::from_json(&json!({})).unwrap();
        assert!(matches!(empty.uploaded_object(), Err(ProvisionError::Event(_))));

        assert!(StorageEvent::from_json(&json!({"Records": [{"s3": {}}]})).is_err());
    }

    #[test]
    fn test_response_framing() {
        let response = InvocationResponse::from_error(&ProvisionError::Event("bad".into()));
        assert_eq!(response.status_code, 400);
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"statusCode":400,"body":"invalid storage event: bad"}"#);
    }
}
