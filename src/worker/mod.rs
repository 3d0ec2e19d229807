//! Worker-side replay machinery: state machines, bookkeeping, clock, local
//! activities, and the executor itself.

pub mod bookkeeper;
pub mod clock;
pub mod context;
pub mod executor;
pub mod local_activity;
pub mod machines;
pub mod metrics;

pub use bookkeeper::FORCE_IMMEDIATE_WORKFLOW_TASK_TIMER;
pub use clock::ReplayClock;
pub use context::{
    ActivityOutcome, CancelExternalOutcome, ChildWorkflowHandlers, ChildWorkflowOutcome,
    SignalOutcome, TimerOutcome, WorkflowContext,
};
pub use executor::{ReplayExecutor, WorkflowTaskResult};
pub use local_activity::{
    LocalActivityCompletionSink, LocalActivityPoller, LocalActivityRequest,
    LocalActivityResolution, LOCAL_ACTIVITY_MARKER_NAME,
};
pub use machines::{CommandId, CommandState, CommandTarget};
pub use metrics::ExecutorMetrics;
