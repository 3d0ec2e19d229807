//! Executor metrics collection.

/// Counters for one executor instance (one cached workflow run).
#[derive(Debug, Clone, Default)]
pub struct ExecutorMetrics {
    /// Workflow runs completed successfully.
    pub workflows_completed: u64,

    /// Workflow runs closed with a failure.
    pub workflows_failed: u64,

    /// Workflow runs closed by cancellation.
    pub workflows_canceled: u64,

    /// Workflow runs continued as a new execution.
    pub workflows_continued_as_new: u64,

    /// Workflow tasks that ended without a completion (failed back to the
    /// service for retry).
    pub workflow_tasks_without_completion: u64,

    /// Local activities executed live.
    pub local_activities_executed: u64,

    /// Local activities re-driven from markers during replay.
    pub local_activities_replayed: u64,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
