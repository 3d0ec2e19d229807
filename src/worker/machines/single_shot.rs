//! Single-shot command machines: markers, search-attribute upserts, and the
//! workflow's own completion command. Each is produced by the workflow,
//! emitted once, and terminal upon its matching event in the same task.

use crate::error::Result;
use crate::worker::machines::{
    unsupported_operation, CommandId, CommandState, CommandStateMachine, MachineBase,
};
use crate::workflow::command::{Command, RecordMarkerAttributes};
use crate::workflow::event::HistoryEvent;
use serde_json::Value;

const MARKER_KIND: &str = "marker";
const UPSERT_KIND: &str = "upsert search attributes";
const COMPLETION_KIND: &str = "workflow completion";

fn single_shot_completion(
    base: &mut MachineBase,
    kind: &'static str,
) -> Result<()> {
    base.begin("handleCompletionEvent");
    match base.state() {
        CommandState::CommandSent => {
            base.set_state(CommandState::Completed);
            Ok(())
        }
        CommandState::Completed => {
            base.keep_state();
            Ok(())
        }
        _ => Err(base.fail_transition(kind)),
    }
}

pub(crate) struct MarkerStateMachine {
    base: MachineBase,
    attributes: RecordMarkerAttributes,
}

impl MarkerStateMachine {
    pub(crate) fn new(id: CommandId, attributes: RecordMarkerAttributes) -> Self {
        Self {
            base: MachineBase::new(id),
            attributes,
        }
    }
}

impl CommandStateMachine for MarkerStateMachine {
    fn kind(&self) -> &'static str {
        MARKER_KIND
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
            CommandState::Created => Some(Command::RecordMarker(self.attributes.clone())),
            _ => None,
        }
    }

    fn handle_command_sent(&mut self) {
        if self.base.state() == CommandState::Created {
            self.base.begin("handleCommandSent");
            self.base.set_state(CommandState::CommandSent);
        }
    }

    fn cancel(&mut self, _immediate_callback: Option<&mut dyn FnMut()>) -> Result<bool> {
        Err(unsupported_operation(MARKER_KIND, self.base.id(), "cancel"))
    }

    /// Matching `MarkerRecorded` event. Markers are surfaced ahead of the
    /// event loop that recreates their machine, so the event can arrive
    /// while the command is still unsent; it completes at the send
    /// boundary's re-dispatch instead.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        self.base.begin("handleCompletionEvent");
        match self.base.state() {
            CommandState::Created | CommandState::Completed => {
                self.base.keep_state();
                Ok(())
            }
            CommandState::CommandSent => {
                self.base.set_state(CommandState::Completed);
                Ok(())
            }
            _ => Err(self.base.fail_transition(MARKER_KIND)),
        }
    }
}

pub(crate) struct UpsertSearchAttributesStateMachine {
    base: MachineBase,
    search_attributes: Value,
}

impl UpsertSearchAttributesStateMachine {
    pub(crate) fn new(id: CommandId, search_attributes: Value) -> Self {
        Self {
            base: MachineBase::new(id),
            search_attributes,
        }
    }
}

impl CommandStateMachine for UpsertSearchAttributesStateMachine {
    fn kind(&self) -> &'static str {
        UPSERT_KIND
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
            CommandState::Created => Some(Command::UpsertWorkflowSearchAttributes {
                search_attributes: self.search_attributes.clone(),
            }),
            _ => None,
        }
    }

    fn handle_command_sent(&mut self) {
        if self.base.state() == CommandState::Created {
            self.base.begin("handleCommandSent");
            self.base.set_state(CommandState::CommandSent);
        }
    }

    fn cancel(&mut self, _immediate_callback: Option<&mut dyn FnMut()>) -> Result<bool> {
        Err(unsupported_operation(UPSERT_KIND, self.base.id(), "cancel"))
    }

    /// Matching `UpsertWorkflowSearchAttributes` event.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        single_shot_completion(&mut self.base, UPSERT_KIND)
    }
}

/// The workflow's own terminal command (complete, fail, cancel or
/// continue-as-new), completed by the corresponding workflow-execution
/// closing event on replay.
pub(crate) struct WorkflowCompletionStateMachine {
    base: MachineBase,
    command: Command,
}

impl WorkflowCompletionStateMachine {
    pub(crate) fn new(id: CommandId, command: Command) -> Self {
        Self {
            base: MachineBase::new(id),
            command,
        }
    }
}

impl CommandStateMachine for WorkflowCompletionStateMachine {
    fn kind(&self) -> &'static str {
        COMPLETION_KIND
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
            CommandState::Created => Some(self.command.clone()),
            _ => None,
        }
    }

    fn handle_command_sent(&mut self) {
        if self.base.state() == CommandState::Created {
            self.base.begin("handleCommandSent");
            self.base.set_state(CommandState::CommandSent);
        }
    }

    fn cancel(&mut self, _immediate_callback: Option<&mut dyn FnMut()>) -> Result<bool> {
        Err(unsupported_operation(
            COMPLETION_KIND,
            self.base.id(),
            "cancel",
        ))
    }

    /// Matching workflow-execution closing event.
    fn handle_completion_event(&mut self, _event: &HistoryEvent) -> Result<()> {
        single_shot_completion(&mut self.base, COMPLETION_KIND)
    }
}
