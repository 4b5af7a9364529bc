//! Convergent stack upsert: create if absent, update if present.

use crate::backend::StackBackend;
use crate::error::{BackendError, ProvisionError};
use crate::types::{StackRequest, UpsertOutcome};
use tracing::{debug, info};

/// Decides between create and update and submits the operation.
///
/// Submission is asynchronous on the backend side: the returned outcome
/// means "accepted", not "finished". Pair with
/// [`CompletionWaiter`](crate::waiter::CompletionWaiter) to observe the end.
pub struct StackUpserter<'a, B: StackBackend> {
    backend: &'a B,
}

impl<'a, B: StackBackend> StackUpserter<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Create or update `request.name`.
    ///
    /// "Does not exist" on the existence query selects the create path and
    /// "no updates" on the update path yields [`UpsertOutcome::NoChange`].
    /// Every other backend fault is returned as is.
    pub async fn upsert(&self, request: &StackRequest) -> Result<UpsertOutcome, ProvisionError> {
        match self.backend.describe_stack(&request.name).await {
            Ok(current) => {
                debug!(stack = %request.name, status = %current.status, "stack exists, updating");
                match self.backend.update_stack(request).await {
                    Ok(stack_id) => {
                        info!(stack = %request.name, %stack_id, "stack update submitted");
                        Ok(UpsertOutcome::Updated)
                    }
                    Err(BackendError::NoUpdates { .. }) => {
                        info!(stack = %request.name, "no updates to perform");
                        Ok(UpsertOutcome::NoChange)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(BackendError::StackNotFound { .. }) => {
                debug!(stack = %request.name, "stack absent, creating");
                let stack_id = self.backend.create_stack(request).await?;
                info!(stack = %request.name, %stack_id, "stack creation submitted");
                Ok(UpsertOutcome::Created)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    fn request(instance_type: &str) -> StackRequest {
        StackRequest::new("ec2-web01", "https://t", "arn:role")
            .with_parameter("InstanceType", instance_type)
            .with_tag("Env", "prod")
    }

    #[tokio::test]
    async fn test_upsert_outcomes() {
        let backend = InMemoryBackend::new();
        let upserter = StackUpserter::new(&backend);

        assert_eq!(upserter.upsert(&request("t3.micro")).await.unwrap(), UpsertOutcome::Created);
        backend.describe_stack("ec2-web01").await.unwrap();
        backend.describe_stack("ec2-web01").await.unwrap();

        assert_eq!(upserter.upsert(&request("t3.micro")).await.unwrap(), UpsertOutcome::NoChange);
        assert_eq!(upserter.upsert(&request("t3.large")).await.unwrap(), UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn test_other_faults_propagate() {
        let backend = InMemoryBackend::new();
        backend.fail_stack("ec2-web01");

        let err = StackUpserter::new(&backend)
            .upsert(&request("t3.micro"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Backend(BackendError::Service { .. })));
        assert_eq!(backend.calls(), vec!["describe:ec2-web01", "create:ec2-web01"]);
    }
}
