//! History event types for replay.
//!
//! A [`HistoryEvent`] is one durable record appended by the orchestration
//! service. Attributes are carried as JSON with camelCase keys and read
//! through typed accessors; the executor never needs the full generated wire
//! structs, only the handful of routing fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event types the service can append to a workflow's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Workflow lifecycle
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionTimedOut,
    WorkflowExecutionTerminated,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionCancelRequested,
    WorkflowExecutionSignaled,

    // Workflow task lifecycle
    WorkflowTaskScheduled,
    WorkflowTaskStarted,
    WorkflowTaskCompleted,
    WorkflowTaskFailed,
    WorkflowTaskTimedOut,

    // Activity tasks
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCancelRequested,
    ActivityTaskCanceled,

    // Timers
    TimerStarted,
    TimerFired,
    TimerCanceled,

    // Markers and search attributes
    MarkerRecorded,
    UpsertWorkflowSearchAttributes,

    // Child workflows
    StartChildWorkflowExecutionInitiated,
    StartChildWorkflowExecutionFailed,
    ChildWorkflowExecutionStarted,
    ChildWorkflowExecutionCompleted,
    ChildWorkflowExecutionFailed,
    ChildWorkflowExecutionCanceled,
    ChildWorkflowExecutionTimedOut,
    ChildWorkflowExecutionTerminated,

    // External signals
    SignalExternalWorkflowExecutionInitiated,
    SignalExternalWorkflowExecutionFailed,
    ExternalWorkflowExecutionSignaled,

    // External cancellation
    RequestCancelExternalWorkflowExecutionInitiated,
    RequestCancelExternalWorkflowExecutionFailed,
    ExternalWorkflowExecutionCancelRequested,
}

impl EventType {
    /// Whether this event materializes a command emitted by the worker in
    /// the workflow task preceding it. These events form the command-event
    /// region that follows each `WorkflowTaskCompleted` in history.
    pub fn is_command_event(&self) -> bool {
        matches!(
            self,
            Self::ActivityTaskScheduled
                | Self::ActivityTaskCancelRequested
                | Self::TimerStarted
                | Self::TimerCanceled
                | Self::MarkerRecorded
                | Self::UpsertWorkflowSearchAttributes
                | Self::StartChildWorkflowExecutionInitiated
                | Self::SignalExternalWorkflowExecutionInitiated
                | Self::RequestCancelExternalWorkflowExecutionInitiated
                | Self::WorkflowExecutionCompleted
                | Self::WorkflowExecutionFailed
                | Self::WorkflowExecutionCanceled
                | Self::WorkflowExecutionContinuedAsNew
        )
    }

    /// Whether this event closes the workflow execution itself.
    pub fn is_workflow_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionCompleted
                | Self::WorkflowExecutionFailed
                | Self::WorkflowExecutionCanceled
                | Self::WorkflowExecutionTimedOut
                | Self::WorkflowExecutionTerminated
                | Self::WorkflowExecutionContinuedAsNew
        )
    }
}

/// One durable history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in history (1-indexed, strictly increasing)
    #[serde(rename = "eventId")]
    event_id: i64,

    /// Type of the event
    #[serde(rename = "type")]
    event_type: EventType,

    /// Event attributes (shape varies by event type)
    attributes: Value,

    /// Server-side timestamp of the event
    timestamp: DateTime<Utc>,
}

impl HistoryEvent {
    /// Create a new history event.
    pub fn new(
        event_id: i64,
        event_type: EventType,
        attributes: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            event_type,
            attributes,
            timestamp,
        }
    }

    /// Get the event id.
    pub fn event_id(&self) -> i64 {
        self.event_id
    }

    /// Get the event type.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Get the timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Timestamp as milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Get an attribute field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Get an attribute field as a string.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Get an attribute field as an i64.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(|v| v.as_i64())
    }

    /// Get the raw attribute value.
    pub fn attributes(&self) -> &Value {
        &self.attributes
    }

    /// Event id of the command event this event refers back to
    /// (`scheduledEventId`, `initiatedEventId` or `startedEventId`,
    /// whichever the event type carries).
    pub fn initiating_event_id(&self) -> Option<i64> {
        self.get_i64("scheduledEventId")
            .or_else(|| self.get_i64("initiatedEventId"))
            .or_else(|| self.get_i64("startedEventId"))
    }

    // === Builder methods for setting attribute fields ===

    fn set(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(ref mut map) = self.attributes {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Set the back-reference to an activity's scheduled event.
    pub fn with_scheduled_event_id(self, id: i64) -> Self {
        self.set("scheduledEventId", Value::from(id))
    }

    /// Set the back-reference to an initiated event.
    pub fn with_initiated_event_id(self, id: i64) -> Self {
        self.set("initiatedEventId", Value::from(id))
    }

    /// Set the back-reference to a timer's started event.
    pub fn with_started_event_id(self, id: i64) -> Self {
        self.set("startedEventId", Value::from(id))
    }

    /// Set the timer id.
    pub fn with_timer_id(self, timer_id: impl Into<String>) -> Self {
        self.set("timerId", Value::String(timer_id.into()))
    }

    /// Set the marker name.
    pub fn with_marker_name(self, name: impl Into<String>) -> Self {
        self.set("markerName", Value::String(name.into()))
    }

    /// Set the signal name.
    pub fn with_signal_name(self, name: impl Into<String>) -> Self {
        self.set("signalName", Value::String(name.into()))
    }

    /// Set the result payload.
    pub fn with_result(self, result: Value) -> Self {
        self.set("result", result)
    }

    /// Set the details payload.
    pub fn with_details(self, details: Value) -> Self {
        self.set("details", details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_command_event_classification() {
        assert!(EventType::ActivityTaskScheduled.is_command_event());
        assert!(EventType::TimerStarted.is_command_event());
        assert!(EventType::TimerCanceled.is_command_event());
        assert!(EventType::MarkerRecorded.is_command_event());
        assert!(EventType::UpsertWorkflowSearchAttributes.is_command_event());
        assert!(EventType::StartChildWorkflowExecutionInitiated.is_command_event());
        assert!(EventType::SignalExternalWorkflowExecutionInitiated.is_command_event());
        assert!(EventType::RequestCancelExternalWorkflowExecutionInitiated.is_command_event());
        assert!(EventType::WorkflowExecutionCompleted.is_command_event());

        assert!(!EventType::TimerFired.is_command_event());
        assert!(!EventType::ActivityTaskCompleted.is_command_event());
        assert!(!EventType::WorkflowTaskStarted.is_command_event());
        assert!(!EventType::WorkflowExecutionSignaled.is_command_event());
        assert!(!EventType::ExternalWorkflowExecutionSignaled.is_command_event());
    }

    #[test]
    fn test_workflow_terminal_classification() {
        assert!(EventType::WorkflowExecutionCompleted.is_workflow_terminal());
        assert!(EventType::WorkflowExecutionContinuedAsNew.is_workflow_terminal());
        assert!(!EventType::WorkflowExecutionStarted.is_workflow_terminal());
        assert!(!EventType::WorkflowTaskCompleted.is_workflow_terminal());
    }

    #[test]
    fn test_event_type_serde_screaming_snake() {
        let json = serde_json::to_string(&EventType::ActivityTaskScheduled).unwrap();
        assert_eq!(json, "\"ACTIVITY_TASK_SCHEDULED\"");
        let parsed: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, EventType::ActivityTaskScheduled);
    }

    #[test]
    fn test_accessors() {
        let event = HistoryEvent::new(
            5,
            EventType::TimerFired,
            json!({"timerId": "6", "startedEventId": 6}),
            now(),
        );
        assert_eq!(event.event_id(), 5);
        assert_eq!(event.event_type(), EventType::TimerFired);
        assert_eq!(event.get_string("timerId"), Some("6"));
        assert_eq!(event.get_i64("startedEventId"), Some(6));
        assert!(event.get("missing").is_none());
    }

    #[test]
    fn test_initiating_event_id_prefers_scheduled() {
        let event = HistoryEvent::new(9, EventType::ActivityTaskCompleted, json!({}), now())
            .with_scheduled_event_id(5)
            .with_started_event_id(7);
        assert_eq!(event.initiating_event_id(), Some(5));

        let event = HistoryEvent::new(9, EventType::TimerFired, json!({}), now())
            .with_started_event_id(6);
        assert_eq!(event.initiating_event_id(), Some(6));

        let event =
            HistoryEvent::new(9, EventType::ChildWorkflowExecutionCompleted, json!({}), now())
                .with_initiated_event_id(4);
        assert_eq!(event.initiating_event_id(), Some(4));
    }

    #[test]
    fn test_builders_on_non_object_attributes_are_noops() {
        let event = HistoryEvent::new(1, EventType::TimerFired, Value::Null, now())
            .with_timer_id("t");
        assert!(event.get("timerId").is_none());
    }

    #[test]
    fn test_history_event_serde_round_trip() {
        let event = HistoryEvent::new(
            3,
            EventType::WorkflowExecutionSignaled,
            json!({"signalName": "S", "input": {"k": 1}}),
            now(),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("WORKFLOW_EXECUTION_SIGNALED"));
        assert!(json.contains("eventId"));
        let parsed: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
