//! Stack Provision Library
//!
//! Upload-driven provisioning: every record of an uploaded file becomes one
//! declarative stack, upserted, waited on until it exposes the provisioned
//! resource's identifier, and then post-configured with a one-shot command.
//!
//! # Design
//!
//! The pipeline logic is not coupled to any cloud SDK. You implement
//! [`StackBackend`] and [`CommandBackend`] (plus [`ObjectSource`] and
//! [`WorkflowLauncher`] for the invocation layer) with your infrastructure,
//! and the pipeline handles the state machine. [`InMemoryBackend`] simulates
//! all four for dry runs and tests; the `aws` feature adds real adapters.
//!
//! # Usage
//!
//! ```ignore
//! use stack_provision::{
//!     InMemoryBackend, PipelineConfig, RecordPipeline, RecordSchema, RecordState,
//!     StepResult, TokioSleeper,
//! };
//!
//! let backend = InMemoryBackend::new();
//! let pipeline = RecordPipeline::new(&backend, &backend, &TokioSleeper, PipelineConfig::default());
//!
//! let plan = RecordSchema::default().plan(1, &record)?;
//! let mut state = RecordState::new(plan);
//!
//! match pipeline.run_to_completion(&mut state).await? {
//!     StepResult::Complete => println!("provisioned {:?}", state.resolved_identifier),
//!     StepResult::Partial(reason) => println!("partial: {}", reason),
//!     StepResult::Failed(reason) => println!("failed: {}", reason),
//!     StepResult::Continue => unreachable!(),
//! }
//! ```

pub mod actuator;
pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod handler;
pub mod handoff;
pub mod memory;
pub mod record;
pub mod retry;
pub mod source;
pub mod state;
pub mod types;
pub mod upsert;
pub mod waiter;
pub mod workflow;

#[cfg(feature = "aws")]
pub mod aws;

// Re-export the main types at crate root for convenience
pub use actuator::PostConfigActuator;
pub use backend::{CommandBackend, StackBackend};
pub use batch::{BatchReport, BatchRunner, RecordReport};
pub use config::{CommandConfig, Mode, NetworkPlacement, ProvisionConfig, TemplateLocation};
pub use error::{BackendError, ProvisionError};
pub use handler::{decode_object_key, Invocation, InvocationResponse, StorageEvent, UploadedObject};
pub use handoff::{template_url_for, ExecutionInput, HandoffDispatcher, WorkflowLauncher};
pub use memory::{InMemoryBackend, SimulationConfig};
pub use record::{Record, RecordAction, RecordPlan, RecordSchema, StackDefaults};
pub use retry::{poll_bounded, Poll, PollOutcome, RecordingSleeper, RetryPolicy, Sleeper, TokioSleeper};
pub use source::{load_records, parse_records, FileFormat, ObjectSource};
pub use state::{RecordState, Step};
pub use types::{
    ConvergenceResult, Pairs, PostConfigCommand, StackDescription, StackRequest, StackStatus,
    UpsertOutcome,
};
pub use upsert::StackUpserter;
pub use waiter::{lookup_output, CompletionWaiter, WaitConfig, WaitStrategy};
pub use workflow::{PipelineConfig, RecordPipeline, StepResult};
