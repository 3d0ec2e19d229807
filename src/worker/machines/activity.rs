//! Activity command state machine.

use crate::error::Result;
use crate::worker::machines::{
    CommandId, CommandState, CommandStateMachine, MachineBase,
};
use crate::workflow::command::{Command, ScheduleActivityTaskAttributes};
use crate::workflow::event::HistoryEvent;

const KIND: &str = "activity";

pub(crate) struct ActivityStateMachine {
    base: MachineBase,
    attributes: ScheduleActivityTaskAttributes,
}

impl ActivityStateMachine {
    pub(crate) fn new(id: CommandId, attributes: ScheduleActivityTaskAttributes) -> Self {
        Self {
            base: MachineBase::new(id),
            attributes,
        }
    }
}

impl CommandStateMachine for ActivityStateMachine {
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
            CommandState::Created => {
                Some(Command::ScheduleActivityTask(self.attributes.clone()))
            }
            CommandState::CanceledAfterInitiated | CommandState::CanceledAfterStarted => {
                Some(Command::RequestCancelActivityTask {
                    scheduled_event_id: self.base.id().command_event_id,
                })
            }
            _ => None,
        }
    }

    fn handle_command_sent(&mut self) {
        match self.base.state() {
            CommandState::Created => {
                self.base.begin("handleCommandSent");
                self.base.set_state(CommandState::CommandSent);
            }
            CommandState::CanceledAfterInitiated | CommandState::CanceledAfterStarted => {
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
            CommandState::Started => {
                self.base.set_state(CommandState::CanceledAfterStarted);
                Ok(false)
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `ActivityTaskScheduled` receipt.
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

    /// `ActivityTaskStarted`.
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
            CommandState::CancellationCommandSent => {
                // Activity started before the cancel request reached it.
                self.base.keep_state();
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `ActivityTaskCompleted` / `Failed` / `TimedOut` / `Canceled`.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCompletionEvent");
        match self.base.state() {
            CommandState::Initiated
            | CommandState::Started
            | CommandState::CanceledAfterInitiated
            | CommandState::CanceledAfterStarted
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

    /// `ActivityTaskCancelRequested` receipt.
    fn handle_cancellation_initiated_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCancellationInitiatedEvent");
        match self.base.state() {
            CommandState::CancellationCommandSent => {
                self.base.keep_state();
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }

    /// `ActivityTaskCanceled`.
    fn handle_cancellation_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCancellationEvent");
        match self.base.state() {
            CommandState::CanceledAfterInitiated
            | CommandState::CanceledAfterStarted
            | CommandState::CancellationCommandSent => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            _ => Err(self.base.fail_transition(KIND)),
        }
    }
}
