//! AWS adapters: CloudFormation stacks, SSM commands, S3 objects and
//! Step Functions executions.
//!
//! Each adapter classifies SDK faults into [`BackendError`] right here, so
//! nothing above this module ever inspects an error message.

use crate::backend::{CommandBackend, StackBackend};
use crate::config::CommandConfig;
use crate::error::BackendError;
use crate::handoff::WorkflowLauncher;
use crate::source::ObjectSource;
use crate::types::{Pairs, PostConfigCommand, StackDescription, StackRequest, StackStatus};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudformation::types::{Capability, Parameter, Tag};
use tracing::debug;

/// Shared SDK configuration from the default provider chain.
pub async fn load_sdk_config() -> SdkConfig {
    aws_config::load_defaults(BehaviorVersion::latest()).await
}

// ═══════════════════════════════════════════════════════════════
// FAULT CLASSIFICATION
// ═══════════════════════════════════════════════════════════════

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
];

/// Classify a service fault by its error code and message.
pub fn classify_fault(stack: &str, code: &str, message: &str) -> BackendError {
    if code == "ValidationError" && message.contains("does not exist") {
        return BackendError::StackNotFound {
            stack: stack.to_string(),
        };
    }
    if message.contains("No updates are to be performed") {
        return BackendError::NoUpdates {
            stack: stack.to_string(),
        };
    }
    if THROTTLING_CODES.contains(&code) {
        return BackendError::Throttled(message.to_string());
    }
    BackendError::service(code, message)
}

fn classify<E, R>(stack: &str, err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            BackendError::Transport(DisplayErrorContext(&err).to_string())
        }
        SdkError::ServiceError(_) => classify_fault(
            stack,
            err.code().unwrap_or("Unknown"),
            err.message().unwrap_or_default(),
        ),
        _ => BackendError::service("Unknown", DisplayErrorContext(&err).to_string()),
    }
}

// ═══════════════════════════════════════════════════════════════
// CLOUDFORMATION
// ═══════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct AwsStackBackend {
    client: aws_sdk_cloudformation::Client,
}

impl AwsStackBackend {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_cloudformation::Client::new(sdk_config),
        }
    }

    fn parameters(request: &StackRequest) -> Vec<Parameter> {
        request
            .parameters
            .iter()
            .map(|(key, value)| {
                Parameter::builder()
                    .parameter_key(key)
                    .parameter_value(value)
                    .build()
            })
            .collect()
    }

    fn tags(request: &StackRequest) -> Result<Vec<Tag>, BackendError> {
        request
            .tags
            .iter()
            .map(|(key, value)| {
                Ok(Tag::builder().key(key).value(value).build())
            })
            .collect()
    }
}

impl StackBackend for AwsStackBackend {
    async fn describe_stack(&self, name: &str) -> Result<StackDescription, BackendError> {
        let output = self
            .client
            .describe_stacks()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| classify(name, e))?;

        let stack = output.stacks().first().ok_or_else(|| BackendError::StackNotFound {
            stack: name.to_string(),
        })?;

        let status = stack
            .stack_status()
            .map(|s| StackStatus::from_code(s.as_str()))
            .unwrap_or_else(|| StackStatus::Other("UNKNOWN".into()));

        let outputs: Pairs = stack
            .outputs()
            .iter()
            .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
            .collect();

        debug!(stack = %name, %status, outputs = outputs.len(), "described stack");
        Ok(StackDescription {
            name: name.to_string(),
            status,
            outputs,
        })
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<String, BackendError> {
        let output = self
            .client
            .create_stack()
            .stack_name(&request.name)
            .template_url(&request.template_url)
            .role_arn(&request.role_arn)
            .capabilities(Capability::CapabilityIam)
            .set_parameters(Some(Self::parameters(request)))
            .set_tags(Some(Self::tags(request)?))
            .send()
            .await
            .map_err(|e| classify(&request.name, e))?;

        Ok(output.stack_id().unwrap_or_default().to_string())
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<String, BackendError> {
        let output = self
            .client
            .update_stack()
            .stack_name(&request.name)
            .template_url(&request.template_url)
            .role_arn(&request.role_arn)
            .capabilities(Capability::CapabilityIam)
            .set_parameters(Some(Self::parameters(request)))
            .set_tags(Some(Self::tags(request)?))
            .send()
            .await
            .map_err(|e| classify(&request.name, e))?;

        Ok(output.stack_id().unwrap_or_default().to_string())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), BackendError> {
        self.client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| classify(name, e))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
// SSM
// ═══════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct AwsCommandBackend {
    client: aws_sdk_ssm::Client,
    command: CommandConfig,
}

impl AwsCommandBackend {
    pub fn new(sdk_config: &SdkConfig, command: CommandConfig) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(sdk_config),
            command,
        }
    }
}

impl CommandBackend for AwsCommandBackend {
    async fn send_command(&self, command: &PostConfigCommand) -> Result<String, BackendError> {
        let script = self.command.render(&command.directive);
        let output = self
            .client
            .send_command()
            .instance_ids(&command.target_identifier)
            .document_name(&self.command.document_name)
            .parameters("commands", vec![script])
            .send()
            .await
            .map_err(|e| classify(&command.target_identifier, e))?;

        Ok(output
            .command()
            .and_then(|c| c.command_id())
            .unwrap_or_default()
            .to_string())
    }
}

// ═══════════════════════════════════════════════════════════════
// S3
// ═══════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct AwsObjectSource {
    client: aws_sdk_s3::Client,
}

impl AwsObjectSource {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl ObjectSource for AwsObjectSource {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BackendError> {
        let subject = format!("s3://{}/{}", bucket, key);
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(&subject, e))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BackendError::Transport(format!("reading {}: {}", subject, e)))?;
        Ok(body.into_bytes().to_vec())
    }
}

// ═══════════════════════════════════════════════════════════════
// STEP FUNCTIONS
// ═══════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct AwsWorkflowLauncher {
    client: aws_sdk_sfn::Client,
    state_machine_arn: String,
}

impl AwsWorkflowLauncher {
    pub fn new(sdk_config: &SdkConfig, state_machine_arn: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sfn::Client::new(sdk_config),
            state_machine_arn: state_machine_arn.into(),
        }
    }
}

#[async_trait]
impl WorkflowLauncher for AwsWorkflowLauncher {
    async fn start_execution(&self, input: &str) -> Result<String, BackendError> {
        let output = self
            .client
            .start_execution()
            .state_machine_arn(&self.state_machine_arn)
            .input(input)
            .send()
            .await
            .map_err(|e| classify(&self.state_machine_arn, e))?;

        Ok(output.execution_arn().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_fault() {
        assert_eq!(
            classify_fault("ec2-web01", "ValidationError", "Stack with id ec2-web01 does not exist"),
            BackendError::StackNotFound {
                stack: "ec2-web01".into()
            }
        );
        assert_eq!(
            classify_fault("ec2-web01", "ValidationError", "No updates are to be performed."),
            BackendError::NoUpdates {
                stack: "ec2-web01".into()
            }
        );
        assert!(classify_fault("ec2-web01", "Throttling", "Rate exceeded").is_transient());
        assert_eq!(
            classify_fault("ec2-web01", "ValidationError", "Template format error"),
            BackendError::service("ValidationError", "Template format error")
        );
    }
}
