//! In-memory backends.
//!
//! A small simulation of the stack, command, object and workflow services.
//! Nothing is persisted and nothing leaves the process. Useful for:
//! - dry runs of an uploaded file (`stack-provision run --dry-run`)
//! - tests that need real upsert/converge semantics without a cloud account
//!
//! Stacks move from `*_IN_PROGRESS` to `*_COMPLETE` after a configurable
//! number of describes, and gain the configured output on success.

use crate::backend::{CommandBackend, StackBackend};
use crate::error::BackendError;
use crate::handoff::WorkflowLauncher;
use crate::source::ObjectSource;
use crate::types::{Pairs, PostConfigCommand, StackDescription, StackRequest, StackStatus};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// How the simulated stack service behaves.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// In-progress describes before a submitted operation settles.
    pub settle_after: u32,
    /// Output added on successful convergence. `None` simulates a template without it.
    pub output_key: Option<String>,
    /// Describes right after a create that still report "does not exist".
    pub hidden_describes: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            settle_after: 1,
            output_key: Some("InstanceId".into()),
            hidden_describes: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct SimStack {
    request: StackRequest,
    status: StackStatus,
    outputs: Pairs,
    pending: u32,
    hidden: u32,
}

#[derive(Default)]
pub struct InMemoryBackend {
    config: SimulationConfig,
    stacks: Mutex<IndexMap<String, SimStack>>,
    failing: Mutex<HashSet<String>>,
    rolling_back: Mutex<HashSet<String>>,
    fail_commands: AtomicBool,
    commands: Mutex<Vec<PostConfigCommand>>,
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    executions: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_config(SimulationConfig::default())
    }

    pub fn with_config(config: SimulationConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Make every create/update of `name` fail with a service fault.
    pub fn fail_stack(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    /// Make operations on `name` converge to a rollback state.
    pub fn roll_back_stack(&self, name: &str) {
        lock(&self.rolling_back).insert(name.to_string());
    }

    pub fn fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub fn put_object(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Every backend call so far, as `operation:subject`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn commands(&self) -> Vec<PostConfigCommand> {
        lock(&self.commands).clone()
    }

    /// Inputs of every started workflow execution.
    pub fn executions(&self) -> Vec<String> {
        lock(&self.executions).clone()
    }

    /// Current view of a stack without advancing the simulation.
    pub fn peek(&self, name: &str) -> Option<StackDescription> {
        lock(&self.stacks).get(name).map(|s| describe(name, s))
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_failing(&self, name: &str) -> Result<(), BackendError> {
        if lock(&self.failing).contains(name) {
            return Err(BackendError::service(
                "ValidationError",
                format!("simulated failure for stack {}", name),
            ));
        }
        Ok(())
    }

    fn settle(&self, name: &str, stack: &mut SimStack) {
        let rolled_back = lock(&self.rolling_back).contains(name);
        stack.status = match (&stack.status, rolled_back) {
            (StackStatus::CreateInProgress, false) => StackStatus::CreateComplete,
            (StackStatus::CreateInProgress, true) => StackStatus::RollbackComplete,
            (StackStatus::UpdateInProgress, false) => StackStatus::UpdateComplete,
            (StackStatus::UpdateInProgress, true) => StackStatus::UpdateRollbackComplete,
            (other, _) => other.clone(),
        };
        if stack.status.is_success() {
            if let Some(key) = &self.config.output_key {
                if !stack.outputs.contains_key(key) {
                    let id = format!("i-{:017x}", self.next_id());
                    stack.outputs.insert(key.clone(), id);
                }
            }
        }
    }
}

impl StackBackend for InMemoryBackend {
    async fn describe_stack(&self, name: &str) -> Result<StackDescription, BackendError> {
        self.record(format!("describe:{}", name));
        let mut stacks = lock(&self.stacks);
        let stack = stacks.get_mut(name).ok_or_else(|| not_found(name))?;

        if stack.hidden > 0 {
            stack.hidden -= 1;
            return Err(not_found(name));
        }
        if !stack.status.is_terminal() {
            if stack.pending > 0 {
                stack.pending -= 1;
            } else {
                self.settle(name, stack);
            }
        }
        Ok(describe(name, stack))
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<String, BackendError> {
        self.record(format!("create:{}", request.name));
        self.check_failing(&request.name)?;

        let mut stacks = lock(&self.stacks);
        if stacks.contains_key(&request.name) {
            return Err(BackendError::service(
                "AlreadyExistsException",
                format!("Stack [{}] already exists", request.name),
            ));
        }
        stacks.insert(
            request.name.clone(),
            SimStack {
                request: request.clone(),
                status: StackStatus::CreateInProgress,
                outputs: Pairs::new(),
                pending: self.config.settle_after,
                hidden: self.config.hidden_describes,
            },
        );
        Ok(format!("arn:sim:stack/{}/{}", request.name, self.next_id()))
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<String, BackendError> {
        self.record(format!("update:{}", request.name));
        self.check_failing(&request.name)?;

        let mut stacks = lock(&self.stacks);
        let stack = stacks
            .get_mut(&request.name)
            .ok_or_else(|| not_found(&request.name))?;

        if !stack.status.is_terminal() {
            return Err(BackendError::service(
                "ValidationError",
                format!(
                    "Stack:{} is in {} state and can not be updated.",
                    request.name, stack.status
                ),
            ));
        }
        if stack.request == *request {
            return Err(BackendError::NoUpdates {
                stack: request.name.clone(),
            });
        }

        stack.request = request.clone();
        stack.status = StackStatus::UpdateInProgress;
        stack.pending = self.config.settle_after;
        Ok(format!("arn:sim:stack/{}/{}", request.name, self.next_id()))
    }

    async fn delete_stack(&self, name: &str) -> Result<(), BackendError> {
        self.record(format!("delete:{}", name));
        lock(&self.stacks).shift_remove(name);
        Ok(())
    }
}

impl CommandBackend for InMemoryBackend {
    async fn send_command(&self, command: &PostConfigCommand) -> Result<String, BackendError> {
        self.record(format!("command:{}", command.target_identifier));
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(BackendError::service(
                "InvalidInstanceId",
                format!("instance {} is not managed", command.target_identifier),
            ));
        }
        lock(&self.commands).push(command.clone());
        Ok(format!("cmd-{}", self.next_id()))
    }
}

#[async_trait]
impl ObjectSource for InMemoryBackend {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BackendError> {
        self.record(format!("get_object:{}/{}", bucket, key));
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                BackendError::service("NoSuchKey", format!("s3://{}/{} not found", bucket, key))
            })
    }
}

#[async_trait]
impl WorkflowLauncher for InMemoryBackend {
    async fn start_execution(&self, input: &str) -> Result<String, BackendError> {
        self.record("start_execution".to_string());
        let mut executions = lock(&self.executions);
        executions.push(input.to_string());
        Ok(format!("arn:sim:execution:{}", executions.len()))
    }
}

fn describe(name: &str, stack: &SimStack) -> StackDescription {
    StackDescription {
        name: name.to_string(),
        status: stack.status.clone(),
        outputs: stack.outputs.clone(),
    }
}

fn not_found(name: &str) -> BackendError {
    BackendError::StackNotFound {
        stack: name.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(instance_type: &str) -> StackRequest {
        StackRequest::new("ec2-web01", "https://t", "arn:role")
            .with_parameter("InstanceType", instance_type)
    }

    #[tokio::test]
    async fn test_create_settles_with_output() {
        let backend = InMemoryBackend::new();
        backend.create_stack(&request("t3.micro")).await.unwrap();

        let first = backend.describe_stack("ec2-web01").await.unwrap();
        assert_eq!(first.status, StackStatus::CreateInProgress);
        assert!(first.output("InstanceId").is_none());

        let second = backend.describe_stack("ec2-web01").await.unwrap();
        assert_eq!(second.status, StackStatus::CreateComplete);
        assert!(second.output("InstanceId").unwrap().starts_with("i-"));
    }

    #[tokio::test]
    async fn test_update_rules() {
        let backend = InMemoryBackend::with_config(SimulationConfig {
            settle_after: 0,
            ..Default::default()
        });
        backend.create_stack(&request("t3.micro")).await.unwrap();

        // still in progress until described
        assert!(matches!(
            backend.update_stack(&request("t3.small")).await,
            Err(BackendError::Service { .. })
        ));

        backend.describe_stack("ec2-web01").await.unwrap();
        assert_eq!(
            backend.update_stack(&request("t3.micro")).await,
            Err(BackendError::NoUpdates {
                stack: "ec2-web01".into()
            })
        );
        assert!(backend.update_stack(&request("t3.small")).await.is_ok());
    }

    #[tokio::test]
    async fn test_hidden_describes_and_rollback() {
        let backend = InMemoryBackend::with_config(SimulationConfig {
            settle_after: 0,
            hidden_describes: 1,
            ..Default::default()
        });
        backend.roll_back_stack("ec2-web01");
        backend.create_stack(&request("t3.micro")).await.unwrap();

        assert!(matches!(
            backend.describe_stack("ec2-web01").await,
            Err(BackendError::StackNotFound { .. })
        ));
        let stack = backend.describe_stack("ec2-web01").await.unwrap();
        assert_eq!(stack.status, StackStatus::RollbackComplete);
        assert!(stack.outputs.is_empty());
    }
}
