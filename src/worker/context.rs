//! Workflow context: the capabilities the workflow program uses to emit
//! commands, and the handlers the executor routes server events through.
//!
//! The context owns the command bookkeeper and the replay clock; the program
//! never sees the executor itself, only this narrow surface. Completion
//! callbacks registered when a command is created are fired when the
//! matching history event arrives.

use crate::error::{Result, WorkerError};
use crate::worker::bookkeeper::CommandBookkeeper;
use crate::worker::clock::ReplayClock;
use crate::worker::local_activity::{
    LocalActivityRequest, LocalActivityResolution, LOCAL_ACTIVITY_MARKER_NAME,
};
use crate::worker::machines::CommandId;
use crate::workflow::command::{
    ContinueAsNewWorkflowExecutionAttributes, RecordMarkerAttributes,
    RequestCancelExternalWorkflowExecutionAttributes, ScheduleActivityTaskAttributes,
    SignalExternalWorkflowExecutionAttributes, StartChildWorkflowExecutionAttributes,
    StartTimerAttributes,
};
use crate::workflow::event::HistoryEvent;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// How an activity command resolved.
#[derive(Debug)]
pub enum ActivityOutcome {
    Completed { result: Option<Value> },
    Failed { failure: Value },
    TimedOut { details: Value },
    Canceled { details: Option<Value> },
}

/// How a timer resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    Fired,
    Canceled,
}

/// How a child workflow resolved.
#[derive(Debug)]
pub enum ChildWorkflowOutcome {
    Completed { result: Option<Value> },
    Failed { failure: Value },
    TimedOut { details: Value },
    Canceled { details: Option<Value> },
    Terminated,
    StartFailed { cause: Value },
}

/// How an external-signal command resolved.
#[derive(Debug)]
pub enum SignalOutcome {
    Signaled,
    Failed { cause: Value },
    Canceled,
}

/// How an external-cancellation command resolved.
#[derive(Debug)]
pub enum CancelExternalOutcome {
    CancelRequested,
    Failed { cause: Value },
    Canceled,
}

pub type ActivityCallback = Box<dyn FnOnce(ActivityOutcome) + Send>;
pub type TimerCallback = Box<dyn FnOnce(TimerOutcome) + Send>;
pub type ChildStartedCallback = Box<dyn FnOnce(Option<String>) + Send>;
pub type ChildCompletionCallback = Box<dyn FnOnce(ChildWorkflowOutcome) + Send>;
pub type SignalCallback = Box<dyn FnOnce(SignalOutcome) + Send>;
pub type CancelExternalCallback = Box<dyn FnOnce(CancelExternalOutcome) + Send>;
pub type LocalActivityCallback = Box<dyn FnOnce(LocalActivityResolution) + Send>;

/// Callbacks for a child workflow: started fires on the child's started
/// event, completed on its terminal event.
pub struct ChildWorkflowHandlers {
    pub on_started: Option<ChildStartedCallback>,
    pub on_completed: ChildCompletionCallback,
}

struct ChildEntry {
    workflow_id: String,
    on_started: Option<ChildStartedCallback>,
    on_completed: Option<ChildCompletionCallback>,
}

pub struct WorkflowContext {
    bookkeeper: CommandBookkeeper,
    clock: ReplayClock,
    workflow_id: String,
    run_id: Uuid,
    cancel_requested: bool,
    continue_as_new: Option<ContinueAsNewWorkflowExecutionAttributes>,
    search_attributes: serde_json::Map<String, Value>,
    marker_data: HashMap<String, VecDeque<Value>>,
    marker_events_seen: HashSet<i64>,
    activity_callbacks: HashMap<CommandId, ActivityCallback>,
    timer_callbacks: HashMap<CommandId, TimerCallback>,
    child_entries: HashMap<CommandId, ChildEntry>,
    signal_callbacks: HashMap<CommandId, SignalCallback>,
    cancel_external_callbacks: HashMap<CommandId, CancelExternalCallback>,
    la_unstarted: VecDeque<LocalActivityRequest>,
    la_callbacks: HashMap<String, LocalActivityCallback>,
    la_started: HashSet<String>,
}

impl WorkflowContext {
    pub(crate) fn new(workflow_id: String, run_id: Uuid, initial_time_ms: i64) -> Self {
        Self {
            bookkeeper: CommandBookkeeper::new(),
            clock: ReplayClock::new(initial_time_ms),
            workflow_id,
            run_id,
            cancel_requested: false,
            continue_as_new: None,
            search_attributes: serde_json::Map::new(),
            marker_data: HashMap::new(),
            marker_events_seen: HashSet::new(),
            activity_callbacks: HashMap::new(),
            timer_callbacks: HashMap::new(),
            child_entries: HashMap::new(),
            signal_callbacks: HashMap::new(),
            cancel_external_callbacks: HashMap::new(),
            la_unstarted: VecDeque::new(),
            la_callbacks: HashMap::new(),
            la_started: HashSet::new(),
        }
    }

    // === Identity and clock ===

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Deterministic current time in epoch milliseconds.
    pub fn current_time_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn is_replaying(&self) -> bool {
        self.clock.is_replaying()
    }

    pub(crate) fn set_time_ms(&mut self, time_ms: i64) {
        self.clock.set_time_ms(time_ms);
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.clock.set_replaying(replaying);
    }

    pub(crate) fn bookkeeper(&self) -> &CommandBookkeeper {
        &self.bookkeeper
    }

    pub(crate) fn bookkeeper_mut(&mut self) -> &mut CommandBookkeeper {
        &mut self.bookkeeper
    }

    // === Cancellation and continue-as-new ===

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub(crate) fn set_cancel_requested(&mut self, cancel_requested: bool) {
        self.cancel_requested = cancel_requested;
    }

    /// Arrange for the run to continue as a new execution once workflow code
    /// returns.
    pub fn set_continue_as_new(&mut self, attributes: ContinueAsNewWorkflowExecutionAttributes) {
        self.continue_as_new = Some(attributes);
    }

    pub(crate) fn take_continue_as_new(
        &mut self,
    ) -> Option<ContinueAsNewWorkflowExecutionAttributes> {
        self.continue_as_new.take()
    }

    // === Command creation ===

    /// Schedule an activity; the callback fires on its terminal event.
    pub fn schedule_activity(
        &mut self,
        attributes: ScheduleActivityTaskAttributes,
        callback: ActivityCallback,
    ) -> CommandId {
        let id = self.bookkeeper.new_activity(attributes);
        self.activity_callbacks.insert(id, callback);
        id
    }

    /// Request activity cancellation. Returns whether it completed without
    /// server involvement.
    pub fn cancel_activity(&mut self, id: CommandId) -> Result<bool> {
        let callbacks = &mut self.activity_callbacks;
        let mut immediate = || {
            if let Some(callback) = callbacks.remove(&id) {
                callback(ActivityOutcome::Canceled { details: None });
            }
        };
        self.bookkeeper.cancel(id, Some(&mut immediate))
    }

    /// Start a timer firing after `delay_ms`; the callback fires on
    /// `TimerFired` or cancellation.
    pub fn start_timer(&mut self, delay_ms: i64, callback: TimerCallback) -> CommandId {
        let id = self.bookkeeper.new_timer(StartTimerAttributes {
            timer_id: String::new(),
            start_to_fire_timeout_ms: delay_ms,
        });
        self.timer_callbacks.insert(id, callback);
        id
    }

    /// Cancel a timer. A timer that already fired is a no-op.
    pub fn cancel_timer(&mut self, id: CommandId) -> Result<bool> {
        if !self.timer_callbacks.contains_key(&id) {
            return Ok(false);
        }
        let callbacks = &mut self.timer_callbacks;
        let mut immediate = || {
            if let Some(callback) = callbacks.remove(&id) {
                callback(TimerOutcome::Canceled);
            }
        };
        self.bookkeeper.cancel(id, Some(&mut immediate))
    }

    /// Start a child workflow execution.
    pub fn start_child_workflow(
        &mut self,
        attributes: StartChildWorkflowExecutionAttributes,
        handlers: ChildWorkflowHandlers,
    ) -> CommandId {
        let child_workflow_id = attributes.workflow_id.clone();
        let id = self.bookkeeper.new_child_workflow(attributes);
        self.child_entries.insert(
            id,
            ChildEntry {
                workflow_id: child_workflow_id,
                on_started: handlers.on_started,
                on_completed: Some(handlers.on_completed),
            },
        );
        id
    }

    /// Request cancellation of a child. When the child is already running a
    /// linked cancel-external command carries the request; the child's own
    /// machine waits for its terminal event.
    pub fn cancel_child_workflow(&mut self, id: CommandId) -> Result<bool> {
        let child_workflow_id = self
            .child_entries
            .get(&id)
            .map(|entry| entry.workflow_id.clone());
        let entries = &mut self.child_entries;
        let mut immediate = || {
            if let Some(entry) = entries.remove(&id) {
                if let Some(callback) = entry.on_completed {
                    callback(ChildWorkflowOutcome::Canceled { details: None });
                }
            }
        };
        let immediate_result = self.bookkeeper.cancel(id, Some(&mut immediate))?;
        if !immediate_result {
            if let Some(workflow_id) = child_workflow_id {
                self.bookkeeper.new_cancel_external(
                    RequestCancelExternalWorkflowExecutionAttributes {
                        workflow_id,
                        run_id: None,
                        child_workflow_only: true,
                    },
                );
            }
        }
        Ok(immediate_result)
    }

    /// Signal an external workflow execution.
    pub fn signal_external_workflow(
        &mut self,
        attributes: SignalExternalWorkflowExecutionAttributes,
        callback: SignalCallback,
    ) -> CommandId {
        let id = self.bookkeeper.new_signal(attributes);
        self.signal_callbacks.insert(id, callback);
        id
    }

    /// Cancel a pending external signal.
    pub fn cancel_signal(&mut self, id: CommandId) -> Result<bool> {
        let callbacks = &mut self.signal_callbacks;
        let mut immediate = || {
            if let Some(callback) = callbacks.remove(&id) {
                callback(SignalOutcome::Canceled);
            }
        };
        self.bookkeeper.cancel(id, Some(&mut immediate))
    }

    /// Request cancellation of an external workflow execution.
    pub fn request_cancel_external_workflow(
        &mut self,
        attributes: RequestCancelExternalWorkflowExecutionAttributes,
        callback: CancelExternalCallback,
    ) -> CommandId {
        let id = self.bookkeeper.new_cancel_external(attributes);
        self.cancel_external_callbacks.insert(id, callback);
        id
    }

    /// Record a marker. Workflow code must emit the same marker on replay;
    /// its recorded payload is read back through [`Self::consume_marker_data`].
    pub fn record_marker(&mut self, marker_name: &str, details: Option<Value>) -> CommandId {
        self.bookkeeper.new_marker(RecordMarkerAttributes {
            marker_name: marker_name.to_string(),
            details,
        })
    }

    /// Pop the oldest replayed payload recorded under a marker name.
    pub fn consume_marker_data(&mut self, marker_name: &str) -> Option<Value> {
        self.marker_data
            .get_mut(marker_name)
            .and_then(|queue| queue.pop_front())
    }

    /// Upsert search attributes; visible locally at once, durable through
    /// the emitted command.
    pub fn upsert_search_attributes(&mut self, attributes: Value) -> CommandId {
        self.merge_search_attributes(&attributes);
        self.bookkeeper.new_upsert_search_attributes(attributes)
    }

    pub fn search_attributes(&self) -> &serde_json::Map<String, Value> {
        &self.search_attributes
    }

    fn merge_search_attributes(&mut self, attributes: &Value) {
        if let Value::Object(map) = attributes {
            for (key, value) in map {
                self.search_attributes.insert(key.clone(), value.clone());
            }
        }
    }

    // === Local activities ===

    /// Queue a local activity for in-process execution during this workflow
    /// task.
    pub fn schedule_local_activity(
        &mut self,
        request: LocalActivityRequest,
        callback: LocalActivityCallback,
    ) {
        self.la_callbacks
            .insert(request.activity_id.clone(), callback);
        self.la_unstarted.push_back(request);
    }

    /// Local activities whose result has not been observed yet.
    pub fn num_pending_local_activities(&self) -> usize {
        self.la_callbacks.len()
    }

    pub(crate) fn next_unstarted_local_activity(&mut self) -> Option<LocalActivityRequest> {
        self.la_unstarted.pop_front()
    }

    pub(crate) fn requeue_unstarted_local_activity(&mut self, request: LocalActivityRequest) {
        self.la_unstarted.push_front(request);
    }

    pub(crate) fn mark_local_activity_started(&mut self, activity_id: &str) {
        self.la_started.insert(activity_id.to_string());
    }

    fn resolve_local_activity(&mut self, details: &Value) -> bool {
        let Some(activity_id) = details.get("activityId").and_then(|v| v.as_str()) else {
            return false;
        };
        let activity_id = activity_id.to_string();
        let Some(callback) = self.la_callbacks.remove(&activity_id) else {
            return false;
        };
        self.la_started.remove(&activity_id);
        self.la_unstarted
            .retain(|request| request.activity_id != activity_id);
        // Re-record the marker so the emitted commands match history on
        // replay; the command event pass completes the machine.
        self.bookkeeper.new_marker(RecordMarkerAttributes {
            marker_name: LOCAL_ACTIVITY_MARKER_NAME.to_string(),
            details: Some(details.clone()),
        });
        callback(LocalActivityResolution {
            result: details.get("result").cloned(),
            failure: details.get("failure").cloned(),
        });
        true
    }

    // === Event handlers (invoked by the executor's dispatch) ===

    /// `ActivityTaskCompleted` / `Failed` / `TimedOut`.
    pub(crate) fn handle_activity_completion(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_activity_completion(event)?;
        let id = activity_reference(event)?;
        if let Some(callback) = self.activity_callbacks.remove(&id) {
            let outcome = match event.event_type() {
                crate::workflow::event::EventType::ActivityTaskCompleted => {
                    ActivityOutcome::Completed {
                        result: event.get("result").cloned(),
                    }
                }
                crate::workflow::event::EventType::ActivityTaskFailed => ActivityOutcome::Failed {
                    failure: event.attributes().clone(),
                },
                _ => ActivityOutcome::TimedOut {
                    details: event.attributes().clone(),
                },
            };
            callback(outcome);
        }
        Ok(())
    }

    /// `ActivityTaskCanceled`.
    pub(crate) fn handle_activity_canceled(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_activity_canceled(event)?;
        let id = activity_reference(event)?;
        if let Some(callback) = self.activity_callbacks.remove(&id) {
            callback(ActivityOutcome::Canceled {
                details: event.get("details").cloned(),
            });
        }
        Ok(())
    }

    /// `TimerFired`. Wake-up-only timers carry an empty callback.
    pub(crate) fn handle_timer_fired(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_timer_fired(event)?;
        let id = timer_reference(event)?;
        if let Some(callback) = self.timer_callbacks.remove(&id) {
            callback(TimerOutcome::Fired);
        }
        Ok(())
    }

    /// `TimerCanceled`.
    pub(crate) fn handle_timer_canceled(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_timer_canceled(event)?;
        let id = timer_reference(event)?;
        if let Some(callback) = self.timer_callbacks.remove(&id) {
            callback(TimerOutcome::Canceled);
        }
        Ok(())
    }

    /// `StartChildWorkflowExecutionFailed`.
    pub(crate) fn handle_start_child_workflow_failed(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        self.bookkeeper.handle_start_child_workflow_failed(event)?;
        let id = child_reference(event)?;
        if let Some(entry) = self.child_entries.remove(&id) {
            if let Some(callback) = entry.on_completed {
                callback(ChildWorkflowOutcome::StartFailed {
                    cause: event.attributes().clone(),
                });
            }
        }
        Ok(())
    }

    /// `ChildWorkflowExecutionStarted`.
    pub(crate) fn handle_child_workflow_started(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_child_workflow_started(event)?;
        let id = child_reference(event)?;
        if let Some(entry) = self.child_entries.get_mut(&id) {
            if let Some(callback) = entry.on_started.take() {
                callback(event.get_string("runId").map(|s| s.to_string()));
            }
        }
        Ok(())
    }

    /// `ChildWorkflowExecutionCompleted` / `Failed` / `TimedOut` /
    /// `Terminated`.
    pub(crate) fn handle_child_workflow_completion(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        self.bookkeeper.handle_child_workflow_completion(event)?;
        let id = child_reference(event)?;
        if let Some(entry) = self.child_entries.remove(&id) {
            if let Some(callback) = entry.on_completed {
                let outcome = match event.event_type() {
                    crate::workflow::event::EventType::ChildWorkflowExecutionCompleted => {
                        ChildWorkflowOutcome::Completed {
                            result: event.get("result").cloned(),
                        }
                    }
                    crate::workflow::event::EventType::ChildWorkflowExecutionFailed => {
                        ChildWorkflowOutcome::Failed {
                            failure: event.attributes().clone(),
                        }
                    }
                    crate::workflow::event::EventType::ChildWorkflowExecutionTerminated => {
                        ChildWorkflowOutcome::Terminated
                    }
                    _ => ChildWorkflowOutcome::TimedOut {
                        details: event.attributes().clone(),
                    },
                };
                callback(outcome);
            }
        }
        Ok(())
    }

    /// `ChildWorkflowExecutionCanceled`.
    pub(crate) fn handle_child_workflow_canceled(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_child_workflow_canceled(event)?;
        let id = child_reference(event)?;
        if let Some(entry) = self.child_entries.remove(&id) {
            if let Some(callback) = entry.on_completed {
                callback(ChildWorkflowOutcome::Canceled {
                    details: event.get("details").cloned(),
                });
            }
        }
        Ok(())
    }

    /// `ExternalWorkflowExecutionSignaled`.
    pub(crate) fn handle_external_workflow_signaled(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        self.bookkeeper.handle_signal_completion(event)?;
        let id = signal_reference(event)?;
        if let Some(callback) = self.signal_callbacks.remove(&id) {
            callback(SignalOutcome::Signaled);
        }
        Ok(())
    }

    /// `SignalExternalWorkflowExecutionFailed`.
    pub(crate) fn handle_signal_external_failed(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_signal_completion(event)?;
        let id = signal_reference(event)?;
        if let Some(callback) = self.signal_callbacks.remove(&id) {
            callback(SignalOutcome::Failed {
                cause: event.attributes().clone(),
            });
        }
        Ok(())
    }

    /// `ExternalWorkflowExecutionCancelRequested`.
    pub(crate) fn handle_external_cancel_requested(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        self.bookkeeper.handle_cancel_external_completion(event)?;
        let id = cancel_external_reference(event)?;
        if let Some(callback) = self.cancel_external_callbacks.remove(&id) {
            callback(CancelExternalOutcome::CancelRequested);
        }
        Ok(())
    }

    /// `RequestCancelExternalWorkflowExecutionFailed`.
    pub(crate) fn handle_cancel_external_failed(&mut self, event: &HistoryEvent) -> Result<()> {
        self.bookkeeper.handle_cancel_external_completion(event)?;
        let id = cancel_external_reference(event)?;
        if let Some(callback) = self.cancel_external_callbacks.remove(&id) {
            callback(CancelExternalOutcome::Failed {
                cause: event.attributes().clone(),
            });
        }
        Ok(())
    }

    /// `MarkerRecorded`: local activity markers resolve their pending task,
    /// other markers cache their payload for replaying code.
    pub(crate) fn handle_marker_recorded(&mut self, event: &HistoryEvent) -> Result<()> {
        let name = event.get_string("markerName").unwrap_or_default().to_string();
        if name == LOCAL_ACTIVITY_MARKER_NAME {
            if let Some(details) = event.get("details").cloned() {
                if self.resolve_local_activity(&details) {
                    return Ok(());
                }
            }
            return self.bookkeeper.handle_marker_recorded(event);
        }
        self.bookkeeper.handle_marker_recorded(event)?;
        if self.marker_events_seen.insert(event.event_id()) {
            if let Some(details) = event.get("details").cloned() {
                self.marker_data.entry(name).or_default().push_back(details);
            }
        }
        Ok(())
    }

    /// `UpsertWorkflowSearchAttributes`.
    pub(crate) fn handle_upsert_search_attributes(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        self.bookkeeper.handle_upsert_search_attributes(event)?;
        if let Some(attributes) = event.get("searchAttributes").cloned() {
            self.merge_search_attributes(&attributes);
        }
        Ok(())
    }

    /// `WorkflowTaskFailed` / `WorkflowTaskTimedOut`: the service will
    /// re-dispatch; nothing to unwind locally.
    pub(crate) fn handle_workflow_task_failed(&mut self, event: &HistoryEvent) {
        debug!(
            workflow_id = %self.workflow_id,
            event_id = event.event_id(),
            "workflow task did not complete"
        );
    }
}

fn activity_reference(event: &HistoryEvent) -> Result<CommandId> {
    reference(event, crate::worker::machines::CommandTarget::Activity)
}

fn timer_reference(event: &HistoryEvent) -> Result<CommandId> {
    reference(event, crate::worker::machines::CommandTarget::Timer)
}

fn child_reference(event: &HistoryEvent) -> Result<CommandId> {
    reference(event, crate::worker::machines::CommandTarget::ChildWorkflow)
}

fn signal_reference(event: &HistoryEvent) -> Result<CommandId> {
    reference(event, crate::worker::machines::CommandTarget::Signal)
}

fn cancel_external_reference(event: &HistoryEvent) -> Result<CommandId> {
    reference(event, crate::worker::machines::CommandTarget::CancelExternal)
}

fn reference(
    event: &HistoryEvent,
    target: crate::worker::machines::CommandTarget,
) -> Result<CommandId> {
    let initiating = event.initiating_event_id().ok_or_else(|| {
        WorkerError::IllegalState(format!(
            "event {} {:?} carries no reference to its initiating event",
            event.event_id(),
            event.event_type(),
        ))
    })?;
    Ok(CommandId::new(target, initiating))
}
