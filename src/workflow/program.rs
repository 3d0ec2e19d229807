//! Contract between the executor and the workflow program.
//!
//! The program is the cooperative dispatcher driving user workflow code. It
//! is constructed externally and injected; the executor invokes it under its
//! own mutex and the program must never block on I/O. Determinism of
//! [`WorkflowProgram::event_loop`] given the same event history is the
//! program's obligation; the bookkeeper's non-determinism check is the
//! runtime guard.

use crate::client::WorkflowQuery;
use crate::error::WorkerError;
use crate::worker::context::WorkflowContext;
use crate::workflow::command::WorkflowFailure;
use crate::workflow::event::HistoryEvent;
use serde_json::Value;

/// How replay corruption (non-determinism, state machine violations) is
/// handled for a workflow type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowErrorPolicy {
    /// Fail the workflow task; the service will retry it, blocking the
    /// workflow until the worker is fixed.
    #[default]
    BlockWorkflow,
    /// Convert the error into a workflow failure and close the execution.
    FailWorkflow,
}

/// Per-workflow-type options the executor consults.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowImplementationOptions {
    pub error_policy: WorkflowErrorPolicy,
}

/// How a pass of the program's event loop ended abnormally.
#[derive(Debug)]
pub enum ProgramError {
    /// A failure raised by the workflow's own code; closes the execution
    /// with a fail-workflow command.
    Failure(WorkflowFailure),
    /// Workflow code observed cancellation. Expected when cancellation was
    /// requested; otherwise mapped to an unexpected failure.
    Canceled { message: String },
    /// Anything else escaping the program (a panic caught by the
    /// dispatcher, a broken invariant).
    Unexpected { message: String },
}

/// The workflow program driven by the executor.
pub trait WorkflowProgram: Send {
    /// Initialize from the `WorkflowExecutionStarted` event.
    fn start(
        &mut self,
        started_event: &HistoryEvent,
        ctx: &mut WorkflowContext,
    ) -> std::result::Result<(), ProgramError>;

    /// Run workflow code until it blocks on unresolved futures. Returns
    /// whether the workflow is complete.
    fn event_loop(
        &mut self,
        ctx: &mut WorkflowContext,
    ) -> std::result::Result<bool, ProgramError>;

    /// Deliver a signal ahead of the batch's event loop pass.
    fn handle_signal(
        &mut self,
        ctx: &mut WorkflowContext,
        name: &str,
        input: Option<Value>,
        event_id: i64,
    );

    /// Cancellation hook, invoked when the service requests cancellation.
    fn cancel(&mut self, ctx: &mut WorkflowContext, cause: &str);

    /// Earliest time workflow code is waiting for, in epoch milliseconds.
    /// Zero when nothing is time-blocked.
    fn next_wake_up_time_ms(&self) -> i64;

    /// Evaluate a query against current (post-replay) workflow state.
    fn query(&mut self, query: &WorkflowQuery) -> crate::error::Result<Option<Value>>;

    /// Workflow result once complete.
    fn output(&mut self) -> Option<Value>;

    /// Map an error that escaped workflow code into a workflow failure.
    fn map_unexpected_error(&self, message: &str) -> WorkflowFailure {
        WorkflowFailure {
            message: message.to_string(),
            failure_type: Some("UnexpectedError".to_string()),
            details: None,
        }
    }

    /// Map an executor-detected error (under the fail-workflow policy) into
    /// a workflow failure.
    fn map_engine_error(&self, error: &WorkerError) -> WorkflowFailure {
        WorkflowFailure {
            message: error.to_string(),
            failure_type: Some("NonDeterministicWorkflowError".to_string()),
            details: None,
        }
    }

    /// Options the executor consults for error handling.
    fn implementation_options(&self) -> WorkflowImplementationOptions {
        WorkflowImplementationOptions::default()
    }

    /// Release program resources once the run is finished or evicted.
    fn close(&mut self) {}
}
