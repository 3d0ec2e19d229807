//! Commands the worker emits in response to a workflow task.
//!
//! A command is one instruction for the orchestration service ("start a
//! timer", "schedule an activity") which the service materializes into
//! history events. Commands are produced by the command state machines in
//! creation order and sent back with the workflow task completion.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attributes for scheduling an activity task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleActivityTaskAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_to_close_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_to_close_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

/// Attributes for starting a timer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTimerAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_ms: i64,
}

/// Attributes for recording a marker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMarkerAttributes {
    pub marker_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Attributes for starting a child workflow execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChildWorkflowExecutionAttributes {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_task_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

/// Attributes for signaling an external workflow execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalExternalWorkflowExecutionAttributes {
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub signal_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Only deliver when the target is a child of this workflow.
    #[serde(default)]
    pub child_workflow_only: bool,
}

/// Attributes for requesting cancellation of an external workflow execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCancelExternalWorkflowExecutionAttributes {
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub child_workflow_only: bool,
}

/// Attributes for continuing the workflow as a new run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueAsNewWorkflowExecutionAttributes {
    pub workflow_type: String,
    pub task_queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_task_timeout_ms: Option<i64>,
}

/// A workflow failure carried on the fail-workflow command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One instruction emitted by the worker for the current workflow task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    ScheduleActivityTask(ScheduleActivityTaskAttributes),
    RequestCancelActivityTask {
        #[serde(rename = "scheduledEventId")]
        scheduled_event_id: i64,
    },
    StartTimer(StartTimerAttributes),
    CancelTimer {
        #[serde(rename = "timerId")]
        timer_id: String,
    },
    RecordMarker(RecordMarkerAttributes),
    UpsertWorkflowSearchAttributes {
        #[serde(rename = "searchAttributes")]
        search_attributes: Value,
    },
    StartChildWorkflowExecution(StartChildWorkflowExecutionAttributes),
    SignalExternalWorkflowExecution(SignalExternalWorkflowExecutionAttributes),
    RequestCancelExternalWorkflowExecution(RequestCancelExternalWorkflowExecutionAttributes),
    CompleteWorkflowExecution {
        #[serde(rename = "result", skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    FailWorkflowExecution {
        failure: WorkflowFailure,
    },
    CancelWorkflowExecution {
        #[serde(rename = "details", skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    ContinueAsNewWorkflowExecution(ContinueAsNewWorkflowExecutionAttributes),
}

impl Command {
    /// Whether this command closes the workflow execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Command::CompleteWorkflowExecution { .. }
                | Command::FailWorkflowExecution { .. }
                | Command::CancelWorkflowExecution { .. }
                | Command::ContinueAsNewWorkflowExecution(_)
        )
    }
}
