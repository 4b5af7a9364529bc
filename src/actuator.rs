//! Post-convergence configuration, best effort.

use crate::backend::CommandBackend;
use crate::types::PostConfigCommand;
use tracing::{info, warn};

/// Sends one configuration command to a freshly converged resource.
///
/// Never fails upward: the stack already converged, so a failed command
/// only means the secondary configuration did not happen. Callers must not
/// invoke it with an empty directive.
pub struct PostConfigActuator<'a, C: CommandBackend> {
    backend: &'a C,
}

impl<'a, C: CommandBackend> PostConfigActuator<'a, C> {
    pub fn new(backend: &'a C) -> Self {
        Self { backend }
    }

    /// Returns the backend's command id when the command was accepted.
    pub async fn apply(&self, target_identifier: &str, directive: &str) -> Option<String> {
        let command = PostConfigCommand {
            target_identifier: target_identifier.to_string(),
            directive: directive.to_string(),
        };

        match self.backend.send_command(&command).await {
            Ok(command_id) => {
                info!(target = %target_identifier, %directive, %command_id, "post-configuration command sent");
                Some(command_id)
            }
            Err(e) => {
                warn!(target = %target_identifier, %directive, error = %e, "post-configuration command failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::sync::Mutex;

    struct Commands {
        fail: bool,
        sent: Mutex<Vec<PostConfigCommand>>,
    }

    impl CommandBackend for Commands {
        async fn send_command(&self, command: &PostConfigCommand) -> Result<String, BackendError> {
            if self.fail {
                return Err(BackendError::service("InvalidInstanceId", "not managed"));
            }
            self.sent.lock().unwrap().push(command.clone());
            Ok("cmd-1".into())
        }
    }

    #[tokio::test]
    async fn test_apply_sends_command() {
        let backend = Commands {
            fail: false,
            sent: Mutex::new(Vec::new()),
        };
        let actuator = PostConfigActuator::new(&backend);

        assert_eq!(actuator.apply("i-0abc", "WEB01").await.as_deref(), Some("cmd-1"));

        let sent = backend.sent.lock().unwrap();
        assert_eq!(
            sent.as_slice(),
            &[PostConfigCommand {
                target_identifier: "i-0abc".into(),
                directive: "WEB01".into(),
            }]
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_apply_swallows_backend_fault() {
        let backend = Commands {
            fail: true,
            sent: Mutex::new(Vec::new()),
        };
        let actuator = PostConfigActuator::new(&backend);

        assert!(actuator.apply("i-0abc", "WEB01").await.is_none());
        assert!(logs_contain("post-configuration command failed"));
    }
}
