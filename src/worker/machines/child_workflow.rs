//! Child workflow command state machine.
//!
//! Cancellation of a running child goes through a linked cancel-external
//! command (created by the bookkeeper); this machine parks in a canceled
//! state and waits for the child's own terminal event.

use crate::error::Result;
use crate::worker::machines::{
    CommandId, CommandState, CommandStateMachine, MachineBase,
};
use crate::workflow::command::{Command, StartChildWorkflowExecutionAttributes};
use crate::workflow::event::HistoryEvent;

const KIND: &str = "child workflow";

pub(crate) struct ChildWorkflowStateMachine {
    base: MachineBase,
    attributes: StartChildWorkflowExecutionAttributes,
}

impl ChildWorkflowStateMachine {
    pub(crate) fn new(id: CommandId, attributes: StartChildWorkflowExecutionAttributes) -> Self {
        Self {
            base: MachineBase::new(id),
            attributes,
        }
    }
}

impl CommandStateMachine for ChildWorkflowStateMachine {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn id(&self) -> CommandId {
        self.base.id()
    }

    fn state(&self) -> CommandState {
        self.base.state()
    }

    fn state_history(&self) -> &[String] {
        self.base.state_history()
    }

    fn command(&self) -> Option<Command> {
        match self.base.state() {
            CommandState::Created => Some(Command::StartChildWorkflowExecution(
                self.attributes.clone(),
            )),
            _ => None,
        }
    }

    fn handle_command_sent(&mut self) {
        if self.base.state() == CommandState::Created {
            self.base.begin("handleCommandSent");
            self.base.set_state(CommandState::CommandSent);
        }
    }

    fn cancel(&mut self, immediate_callback: Option<&mut dyn FnMut()>) -> Result<bool> {
        self.base.begin("cancel");
        match self.base.state() {
            CommandState::Created => {
                self.base.set_state(CommandState::Completed);
                if let Some(callback) = immediate_callback {
                    callback();
                }
                Ok(true)
            }
            CommandState::CommandSent => {
                self.base.set_state(CommandState::CanceledBeforeInitiated);
                if let Some(callback) = immediate_callback {
                    callback();
                }
                Ok(true)
            }
            CommandState::Initiated => {
                self.base.set_state(CommandState::CanceledAfterInitiated);
                Ok(false)
            }
            CommandState::Started => {
                self.base.set_state(CommandState::CanceledAfterStarted);
                Ok(false)
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `StartChildWorkflowExecutionInitiated` receipt.
    fn handle_initiated_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleInitiatedEvent");
        match self.base.state() {
            CommandState::CommandSent => {
                self.base.set_state(CommandState::Initiated);
                Ok(())
            }
            CommandState::CanceledBeforeInitiated => {
                self.base.set_state(CommandState::CanceledAfterInitiated);
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `StartChildWorkflowExecutionFailed` - the start itself was rejected.
    fn handle_initiation_failed_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleInitiationFailedEvent");
        match self.base.state() {
            CommandState::Initiated | CommandState::CanceledAfterInitiated => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `ChildWorkflowExecutionStarted`.
    fn handle_started_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleStartedEvent");
        match self.base.state() {
            CommandState::Initiated => {
                self.base.set_state(CommandState::Started);
                Ok(())
            }
            CommandState::CanceledAfterInitiated => {
                self.base.set_state(CommandState::CanceledAfterStarted);
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `ChildWorkflowExecutionCompleted` / `Failed` / `TimedOut` /
    /// `Terminated`.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCompletionEvent");
        match self.base.state() {
            CommandState::Initiated
            | CommandState::Started
            | CommandState::CanceledAfterInitiated
            | CommandState::CanceledAfterStarted => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            CommandState::Completed => {
                self.base.keep_state();
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `ChildWorkflowExecutionCanceled`.
    fn handle_cancellation_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCancellationEvent");
        match self.base.state() {
            CommandState::Initiated
            | CommandState::Started
            | CommandState::CanceledAfterInitiated
            | CommandState::CanceledAfterStarted => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }
}
