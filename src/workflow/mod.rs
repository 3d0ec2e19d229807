//! Workflow-facing types: history events, commands, task batching, and the
//! workflow program contract.

pub mod command;
pub mod event;
pub mod history;
pub mod program;

pub use command::Command;
pub use event::{EventType, HistoryEvent};
pub use history::WorkflowTaskBatch;
pub use program::{
    ProgramError, WorkflowErrorPolicy, WorkflowImplementationOptions, WorkflowProgram,
};
