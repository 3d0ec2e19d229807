//! State machines for commands targeting external workflow executions:
//! signals and cancellation requests. Both share the same short lifecycle.

use crate::error::Result;
use crate::worker::machines::{
    CommandId, CommandState, CommandStateMachine, MachineBase,
};
use crate::workflow::command::{
    Command, RequestCancelExternalWorkflowExecutionAttributes,
    SignalExternalWorkflowExecutionAttributes,
};
use crate::workflow::event::HistoryEvent;

const SIGNAL_KIND: &str = "signal";
const CANCEL_KIND: &str = "cancel external";

pub(crate) struct SignalStateMachine {
    base: MachineBase,
    attributes: SignalExternalWorkflowExecutionAttributes,
    canceled: bool,
}

impl SignalStateMachine {
    pub(crate) fn new(id: CommandId, attributes: SignalExternalWorkflowExecutionAttributes) -> Self {
        Self {
            base: MachineBase::new(id),
            attributes,
            canceled: false,
        }
    }
}

impl CommandStateMachine for SignalStateMachine {
    fn kind(&self) -> &'static str {
        SIGNAL_KIND
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

    /// A canceled signal is done even before the server confirms, so
    /// consumers stop polling it.
    fn is_done(&self) -> bool {
        self.base.state() == CommandState::Completed || self.canceled
    }

    fn command(&self) -> Option<Command> {
        match self.base.state() {
            CommandState::Created => Some(Command::SignalExternalWorkflowExecution(
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
        let result = match self.base.state() {
            CommandState::Created | CommandState::Initiated => {
                self.base.set_state(CommandState::Completed);
                if let Some(callback) = immediate_callback {
                    callback();
                }
                true
            }
            CommandState::CommandSent => {
                self.base.set_state(CommandState::CanceledBeforeInitiated);
                if let Some(callback) = immediate_callback {
                    callback();
                }
                true
            }
            _ => return Err(self.base.fail_transition(SIGNAL_KIND)),
        };
        self.canceled = true;
        Ok(result)
    }

    /// `SignalExternalWorkflowExecutionInitiated` receipt.
    fn handle_initiated_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleInitiatedEvent");
        match self.base.state() {
            CommandState::CommandSent => {
                self.base.set_state(CommandState::Initiated);
                Ok(())
            }
            CommandState::CanceledBeforeInitiated => {
                self.base.keep_state();
                Ok(())
            }
            _ => Err(self.base.fail_transition(SIGNAL_KIND)),
        }
    }

    /// `ExternalWorkflowExecutionSignaled` or
    /// `SignalExternalWorkflowExecutionFailed`.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCompletionEvent");
        match self.base.state() {
            CommandState::CommandSent
            | CommandState::Initiated
            | CommandState::CanceledBeforeInitiated => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            CommandState::Completed => {
                self.base.keep_state();
                Ok(())
            }
            _ => Err(self.base.fail_transition(SIGNAL_KIND)),
        }
    }
}

pub(crate) struct CancelExternalStateMachine {
    base: MachineBase,
    attributes: RequestCancelExternalWorkflowExecutionAttributes,
    canceled: bool,
}

impl CancelExternalStateMachine {
    pub(crate) fn new(
        id: CommandId,
        attributes: RequestCancelExternalWorkflowExecutionAttributes,
    ) -> Self {
        Self {
            base: MachineBase::new(id),
            attributes,
            canceled: false,
        }
    }
}

impl CommandStateMachine for CancelExternalStateMachine {
    fn kind(&self) -> &'static str {
        CANCEL_KIND
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

    fn is_done(&self) -> bool {
        self.base.state() == CommandState::Completed || self.canceled
    }

    fn command(&self) -> Option<Command> {
        match self.base.state() {
            CommandState::Created => Some(Command::RequestCancelExternalWorkflowExecution(
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
        let result = match self.base.state() {
            CommandState::Created | CommandState::Initiated => {
                self.base.set_state(CommandState::Completed);
                if let Some(callback) = immediate_callback {
                    callback();
                }
                true
            }
            CommandState::CommandSent => {
                self.base.set_state(CommandState::CanceledBeforeInitiated);
                if let Some(callback) = immediate_callback {
                    callback();
                }
                true
            }
            _ => return Err(self.base.fail_transition(CANCEL_KIND)),
        };
        self.canceled = true;
        Ok(result)
    }

    /// `RequestCancelExternalWorkflowExecutionInitiated` receipt.
    fn handle_initiated_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleInitiatedEvent");
        match self.base.state() {
            CommandState::CommandSent => {
                self.base.set_state(CommandState::Initiated);
                Ok(())
            }
            CommandState::CanceledBeforeInitiated => {
                self.base.keep_state();
                Ok(())
            }
            _ => Err(self.base.fail_transition(CANCEL_KIND)),
        }
    }

    /// `ExternalWorkflowExecutionCancelRequested` or
    /// `RequestCancelExternalWorkflowExecutionFailed`.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCompletionEvent");
        match self.base.state() {
            CommandState::CommandSent
            | CommandState::Initiated
            | CommandState::CanceledBeforeInitiated => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            CommandState::Completed => {
                self.base.keep_state();
                Ok(())
            }
            _ => Err(self.base.fail_transition(CANCEL_KIND)),
        }
    }
}
