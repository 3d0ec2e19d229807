//! Timer command state machine.

use crate::error::Result;
use crate::worker::machines::{
    CommandId, CommandState, CommandStateMachine, MachineBase,
};
use crate::workflow::command::{Command, StartTimerAttributes};
use crate::workflow::event::HistoryEvent;

const KIND: &str = "timer";

pub(crate) struct TimerStateMachine {
    base: MachineBase,
    attributes: StartTimerAttributes,
}

impl TimerStateMachine {
    pub(crate) fn new(id: CommandId, attributes: StartTimerAttributes) -> Self {
        Self {
            base: MachineBase::new(id),
            attributes,
        }
    }
}

impl CommandStateMachine for TimerStateMachine {
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
            CommandState::Created => Some(Command::StartTimer(self.attributes.clone())),
            CommandState::CanceledAfterInitiated => Some(Command::CancelTimer {
                timer_id: self.attributes.timer_id.clone(),
            }),
            _ => None,
        }
    }

    fn handle_command_sent(&mut self) {
        match self.base.state() {
            CommandState::Created => {
                self.base.begin("handleCommandSent");
                self.base.set_state(CommandState::CommandSent);
            }
            CommandState::CanceledAfterInitiated => {
                self.base.begin("handleCommandSent");
                self.base.set_state(CommandState::CancellationCommandSent);
            }
            _ => {}
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
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `TimerStarted` receipt.
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

    /// `TimerFired`.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCompletionEvent");
        match self.base.state() {
            CommandState::Initiated
            | CommandState::CanceledAfterInitiated
            | CommandState::CancellationCommandSent => {
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

    /// `TimerCanceled`.
    fn handle_cancellation_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCancellationEvent");
        match self.base.state() {
            CommandState::CanceledAfterInitiated | CommandState::CancellationCommandSent => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }
}
