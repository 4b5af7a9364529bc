//! Error types for the provisioning pipeline.
//!
//! No `anyhow` leakage. Explicit, typed errors. Backend clients classify
//! their faults into [`BackendError`] at the boundary so the pipeline never
//! has to read a human-readable message.

/// A fault reported by a provisioning backend, already classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The named stack is not known to the backend (or not yet describable).
    #[error("stack {stack} does not exist")]
    StackNotFound { stack: String },

    /// An update was submitted but nothing would change.
    #[error("no updates are to be performed on stack {stack}")]
    NoUpdates { stack: String },

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("backend fault: code={code}, message={message}")]
    Service { code: String, message: String },
}

impl BackendError {
    /// Whether a later attempt of the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Throttled(_) | BackendError::Transport(_))
    }

    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Service {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid record: {0}")]
    RecordValidation(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("stack {stack} converged to failure state {status}")]
    ConvergenceFailed { stack: String, status: String },

    #[error("stack {stack} has no output named {key}")]
    OutputMissing { stack: String, key: String },

    #[error("record source error: {0}")]
    Source(String),

    #[error("invalid storage event: {0}")]
    Event(String),

    #[error("workflow handoff failed: {0}")]
    Handoff(String),

    #[error("invalid pipeline state: {0}")]
    InvalidState(String),
}

impl ProvisionError {
    /// HTTP-style status for the per-invocation response.
    pub fn status_code(&self) -> u16 {
        match self {
            ProvisionError::Configuration(_)
            | ProvisionError::Event(_)
            | ProvisionError::Source(_)
            | ProvisionError::RecordValidation(_) => 400,
            _ => 500,
        }
    }

    /// Whether the error stays inside one record's pipeline.
    ///
    /// Only configuration faults abort a whole invocation.
    pub fn is_record_scoped(&self) -> bool {
        !matches!(self, ProvisionError::Configuration(_))
    }

    /// Whether this error might be recoverable by retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProvisionError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}
