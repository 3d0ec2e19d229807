//! Identity of a single command across its lifecycle.

use std::fmt;

/// What kind of entity a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTarget {
    Activity,
    Timer,
    ChildWorkflow,
    Signal,
    CancelExternal,
    SelfWorkflow,
    UpsertSearchAttributes,
    Marker,
}

/// Stable key pairing a command with the history events it elicits.
///
/// `command_event_id` is the id of the event that materializes the command
/// (predicted at creation time from the workflow task's started event id),
/// so server events referencing that id route back to the machine that
/// issued the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId {
    pub target: CommandTarget,
    pub command_event_id: i64,
}

impl CommandId {
    pub fn new(target: CommandTarget, command_event_id: i64) -> Self {
        Self {
            target,
            command_event_id,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.target, self.command_event_id)
    }
}
