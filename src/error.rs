//! Error types for the Lodestar worker core.
//!
//! The executor distinguishes configuration problems (surfaced to the caller
//! before any workflow state is touched), replay corruption (non-determinism
//! and state machine violations, whose handling depends on the configured
//! [`WorkflowErrorPolicy`](crate::workflow::program::WorkflowErrorPolicy)),
//! and transport failures from the orchestration service.

/// Error type for replay executor operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// gRPC communication error. History pagination overrunning the workflow
    /// task timeout is reported as `deadline_exceeded`.
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration (retry policy validation, executor options)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Replayed history references a command this executor never produced,
    /// or disagrees with the executor's own progress through history.
    #[error("Nondeterministic workflow execution: {0}")]
    NonDeterminism(String),

    /// A command state machine received an input that is not in its
    /// transition table. The message carries the machine's full state
    /// history.
    #[error("Command state machine violation: {0}")]
    StateMachine(String),

    /// Internal invariant broken (negative wake-up delay, signal after the
    /// workflow closed, malformed history).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    /// True for the error class whose handling is governed by
    /// `WorkflowErrorPolicy`: replay corruption detected by the command
    /// bookkeeping rather than a failure of the workflow's own logic.
    pub fn is_replay_corruption(&self) -> bool {
        matches!(
            self,
            WorkerError::NonDeterminism(_)
                | WorkerError::StateMachine(_)
                | WorkerError::IllegalState(_)
        )
    }
}

/// Result type alias for worker core operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_corruption_classification() {
        assert!(WorkerError::NonDeterminism("bad".into()).is_replay_corruption());
        assert!(WorkerError::StateMachine("bad".into()).is_replay_corruption());
        assert!(WorkerError::IllegalState("bad".into()).is_replay_corruption());
        assert!(!WorkerError::Other("bad".into()).is_replay_corruption());
        assert!(!WorkerError::InvalidConfiguration("bad".into()).is_replay_corruption());
        assert!(
            !WorkerError::Grpc(tonic::Status::deadline_exceeded("late")).is_replay_corruption()
        );
    }

    #[test]
    fn test_grpc_status_conversion() {
        let err: WorkerError = tonic::Status::unavailable("down").into();
        assert!(err.to_string().contains("down"));
    }
}
