//! Per-command state machines.
//!
//! Every command the workflow emits gets a small FSM tracking its lifecycle
//! against the history events the service appends for it. The kinds share
//! one protocol - [`CommandStateMachine`] - with kind-specific transition
//! tables; any input outside a kind's table is replay corruption and fails
//! with the machine's full state history attached.

pub mod activity;
pub mod child_workflow;
pub mod command_id;
pub mod external;
pub mod single_shot;
pub mod timer;

pub use command_id::{CommandId, CommandTarget};

use crate::error::{Result, WorkerError};
use crate::workflow::command::Command;
use crate::workflow::event::HistoryEvent;

/// Lifecycle states shared by all command kinds. Each kind's transition
/// table covers a subset; `Completed` is the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    CommandSent,
    Initiated,
    Started,
    CanceledBeforeInitiated,
    CanceledAfterInitiated,
    CanceledAfterStarted,
    CancellationCommandSent,
    Completed,
}

/// Shared bookkeeping: id, current state, and the linear audit log of
/// `(action, resulting-state)` entries used in violation messages.
#[derive(Debug)]
pub(crate) struct MachineBase {
    id: CommandId,
    state: CommandState,
    state_history: Vec<String>,
}

impl MachineBase {
    pub(crate) fn new(id: CommandId) -> Self {
        Self {
            id,
            state: CommandState::Created,
            state_history: vec![format!("{:?}", CommandState::Created)],
        }
    }

    pub(crate) fn id(&self) -> CommandId {
        self.id
    }

    pub(crate) fn state(&self) -> CommandState {
        self.state
    }

    pub(crate) fn state_history(&self) -> &[String] {
        &self.state_history
    }

    /// Record the incoming action ahead of the transition decision, so a
    /// violation message shows what was attempted.
    pub(crate) fn begin(&mut self, action: &str) {
        self.state_history.push(action.to_string());
    }

    pub(crate) fn set_state(&mut self, next: CommandState) {
        self.state = next;
        self.state_history.push(format!("{next:?}"));
    }

    /// Record a deliberate no-change transition.
    pub(crate) fn keep_state(&mut self) {
        self.state_history.push(format!("{:?}", self.state));
    }

    pub(crate) fn fail_transition(&self, kind: &str) -> WorkerError {
        WorkerError::StateMachine(format!(
            "{kind} command {}: illegal state transition, state history: {:?}",
            self.id, self.state_history
        ))
    }
}

pub(crate) fn unsupported_operation(
    kind: &str,
    id: CommandId,
    operation: &str,
) -> WorkerError {
    WorkerError::StateMachine(format!(
        "{kind} command {id}: operation {operation} is not supported for this command kind"
    ))
}

/// Protocol shared by every command kind. Operations a kind cannot receive
/// keep the default implementation, which fails the workflow task.
pub(crate) trait CommandStateMachine: Send {
    /// Kind name used in diagnostics.
    fn kind(&self) -> &'static str;

    fn id(&self) -> CommandId;

    fn state(&self) -> CommandState;

    fn state_history(&self) -> &[String];

    /// Terminal check; consumers stop routing events to done machines.
    fn is_done(&self) -> bool {
        self.state() == CommandState::Completed
    }

    /// The concrete command to emit for the current state, if any.
    fn command(&self) -> Option<Command>;

    /// Commands were handed to the service: `Created` machines become
    /// `CommandSent`, pending cancellations become `CancellationCommandSent`.
    fn handle_command_sent(&mut self);

    /// Request cancellation. The callback runs when cancellation completes
    /// without server involvement; the return value mirrors it.
    fn cancel(&mut self, immediate_callback: Option<&mut dyn FnMut()>) -> Result<bool>;

    fn handle_initiated_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        Err(unsupported_operation(
            self.kind(),
            self.id(),
            "handleInitiatedEvent",
        ))
    }

    fn handle_initiation_failed_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        Err(unsupported_operation(
            self.kind(),
            self.id(),
            "handleInitiationFailedEvent",
        ))
    }

    fn handle_started_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        Err(unsupported_operation(
            self.kind(),
            self.id(),
            "handleStartedEvent",
        ))
    }

    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        Err(unsupported_operation(
            self.kind(),
            self.id(),
            "handleCompletionEvent",
        ))
    }

    fn handle_cancellation_initiated_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        Err(unsupported_operation(
            self.kind(),
            self.id(),
            "handleCancellationInitiatedEvent",
        ))
    }

    fn handle_cancellation_failure_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        Err(unsupported_operation(
            self.kind(),
            self.id(),
            "handleCancellationFailureEvent",
        ))
    }

    fn handle_cancellation_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        Err(unsupported_operation(
            self.kind(),
            self.id(),
            "handleCancellationEvent",
        ))
    }
}
