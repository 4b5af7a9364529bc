//! The backend seams: StackBackend and CommandBackend.
//!
//! These are the only abstraction points for provisioning APIs. The
//! pipeline is pure logic: it doesn't know about SDKs, regions, or
//! credentials. Implementations classify every fault into a
//! [`BackendError`] before returning it.

use crate::error::BackendError;
use crate::types::{PostConfigCommand, StackDescription, StackRequest};
use std::future::Future;

/// Declarative stack operations, addressed by stack name.
pub trait StackBackend: Send + Sync {
    /// Describe the stack's current status and outputs.
    ///
    /// Returns [`BackendError::StackNotFound`] when the stack is absent.
    fn describe_stack(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<StackDescription, BackendError>> + Send;

    /// Submit a create. Returns the backend's stack id once accepted.
    fn create_stack(
        &self,
        request: &StackRequest,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    /// Submit an update. Returns [`BackendError::NoUpdates`] when the
    /// request matches the current stack.
    fn update_stack(
        &self,
        request: &StackRequest,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    /// Submit a delete. Deleting an absent stack is not an error.
    fn delete_stack(&self, name: &str) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// One-shot remote commands addressed to a resource identifier.
pub trait CommandBackend: Send + Sync {
    /// Send the command. Returns the backend's command id; completion is not awaited.
    fn send_command(
        &self,
        command: &PostConfigCommand,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;
}
