//! Command bookkeeping: the ordered registry of live state machines.
//!
//! The bookkeeper allocates command ids, routes history events to the
//! machine that issued the matching command, and produces the outbound
//! command list in creation order. Ids are predicted: after each
//! `WorkflowTaskStarted` at id `N` the next command will materialize as
//! event `N + 2` (the service appends `WorkflowTaskCompleted` first), so a
//! deterministic replay allocates the same ids the recorded history carries.

use crate::error::{Result, WorkerError};
use crate::worker::machines::activity::ActivityStateMachine;
use crate::worker::machines::child_workflow::ChildWorkflowStateMachine;
use crate::worker::machines::external::{CancelExternalStateMachine, SignalStateMachine};
use crate::worker::machines::single_shot::{
    MarkerStateMachine, UpsertSearchAttributesStateMachine, WorkflowCompletionStateMachine,
};
use crate::worker::machines::timer::TimerStateMachine;
use crate::worker::machines::{CommandId, CommandState, CommandStateMachine, CommandTarget};
use crate::workflow::command::{
    Command, RecordMarkerAttributes, RequestCancelExternalWorkflowExecutionAttributes,
    ScheduleActivityTaskAttributes, SignalExternalWorkflowExecutionAttributes,
    StartChildWorkflowExecutionAttributes, StartTimerAttributes,
};
use crate::workflow::event::HistoryEvent;
use serde_json::Value;
use std::collections::HashMap;

/// Timer id whose `TimerFired` events exist only to force the service to
/// schedule a fresh workflow task; they are dropped on dispatch.
pub const FORCE_IMMEDIATE_WORKFLOW_TASK_TIMER: &str = "FORCE_IMMEDIATE_WORKFLOW_TASK";

pub(crate) struct CommandBookkeeper {
    machines: HashMap<CommandId, Box<dyn CommandStateMachine>>,
    insertion_order: Vec<CommandId>,
    next_command_event_id: i64,
    last_started_event_id: i64,
    self_machine_id: Option<CommandId>,
}

impl CommandBookkeeper {
    pub(crate) fn new() -> Self {
        Self {
            machines: HashMap::new(),
            insertion_order: Vec::new(),
            next_command_event_id: 0,
            last_started_event_id: 0,
            self_machine_id: None,
        }
    }

    /// Id of the most recent `WorkflowTaskStarted` event consumed.
    pub(crate) fn last_started_event_id(&self) -> i64 {
        self.last_started_event_id
    }

    /// Event id the next created command will be assigned.
    pub(crate) fn peek_next_command_event_id(&self) -> i64 {
        self.next_command_event_id
    }

    /// Record a started event and reset the per-batch id counter. Called
    /// once before a batch is dispatched and again after its command events,
    /// restoring the counter the event loop consumed from.
    pub(crate) fn handle_workflow_task_started(&mut self, current_started_event_id: i64) {
        self.last_started_event_id = current_started_event_id;
        self.next_command_event_id = current_started_event_id + 2;
    }

    fn allocate(&mut self, target: CommandTarget) -> CommandId {
        let id = CommandId::new(target, self.next_command_event_id);
        self.next_command_event_id += 1;
        id
    }

    fn add(&mut self, id: CommandId, machine: Box<dyn CommandStateMachine>) {
        self.machines.insert(id, machine);
        self.insertion_order.push(id);
    }

    pub(crate) fn new_activity(&mut self, attributes: ScheduleActivityTaskAttributes) -> CommandId {
        let id = self.allocate(CommandTarget::Activity);
        self.add(id, Box::new(ActivityStateMachine::new(id, attributes)));
        id
    }

    /// Create a timer. An empty timer id is replaced by the predicted
    /// command event id, which is what routes the receipts back here.
    pub(crate) fn new_timer(&mut self, mut attributes: StartTimerAttributes) -> CommandId {
        let id = self.allocate(CommandTarget::Timer);
        if attributes.timer_id.is_empty() {
            attributes.timer_id = id.command_event_id.to_string();
        }
        self.add(id, Box::new(TimerStateMachine::new(id, attributes)));
        id
    }

    pub(crate) fn new_child_workflow(
        &mut self,
        attributes: StartChildWorkflowExecutionAttributes,
    ) -> CommandId {
        let id = self.allocate(CommandTarget::ChildWorkflow);
        self.add(id, Box::new(ChildWorkflowStateMachine::new(id, attributes)));
        id
    }

    pub(crate) fn new_signal(
        &mut self,
        attributes: SignalExternalWorkflowExecutionAttributes,
    ) -> CommandId {
        let id = self.allocate(CommandTarget::Signal);
        self.add(id, Box::new(SignalStateMachine::new(id, attributes)));
        id
    }

    pub(crate) fn new_cancel_external(
        &mut self,
        attributes: RequestCancelExternalWorkflowExecutionAttributes,
    ) -> CommandId {
        let id = self.allocate(CommandTarget::CancelExternal);
        self.add(id, Box::new(CancelExternalStateMachine::new(id, attributes)));
        id
    }

    pub(crate) fn new_marker(&mut self, attributes: RecordMarkerAttributes) -> CommandId {
        let id = self.allocate(CommandTarget::Marker);
        self.add(id, Box::new(MarkerStateMachine::new(id, attributes)));
        id
    }

    pub(crate) fn new_upsert_search_attributes(&mut self, search_attributes: Value) -> CommandId {
        let id = self.allocate(CommandTarget::UpsertSearchAttributes);
        self.add(
            id,
            Box::new(UpsertSearchAttributesStateMachine::new(id, search_attributes)),
        );
        id
    }

    fn new_completion(&mut self, command: Command) -> CommandId {
        let id = self.allocate(CommandTarget::SelfWorkflow);
        self.add(id, Box::new(WorkflowCompletionStateMachine::new(id, command)));
        self.self_machine_id = Some(id);
        id
    }

    pub(crate) fn complete_workflow_execution(&mut self, result: Option<Value>) -> CommandId {
        self.new_completion(Command::CompleteWorkflowExecution { result })
    }

    pub(crate) fn fail_workflow_execution(
        &mut self,
        failure: crate::workflow::command::WorkflowFailure,
    ) -> CommandId {
        self.new_completion(Command::FailWorkflowExecution { failure })
    }

    pub(crate) fn cancel_workflow_execution(&mut self, details: Option<Value>) -> CommandId {
        self.new_completion(Command::CancelWorkflowExecution { details })
    }

    pub(crate) fn continue_as_new_workflow_execution(
        &mut self,
        attributes: crate::workflow::command::ContinueAsNewWorkflowExecutionAttributes,
    ) -> CommandId {
        self.new_completion(Command::ContinueAsNewWorkflowExecution(attributes))
    }

    /// Request cancellation of a command. Returns whether cancellation
    /// completed without server involvement.
    pub(crate) fn cancel(
        &mut self,
        id: CommandId,
        immediate_callback: Option<&mut dyn FnMut()>,
    ) -> Result<bool> {
        let machine = self.machines.get_mut(&id).ok_or_else(|| {
            WorkerError::IllegalState(format!("cancel of unknown command {id}"))
        })?;
        machine.cancel(immediate_callback)
    }

    pub(crate) fn state_of(&self, id: CommandId) -> Option<CommandState> {
        self.machines.get(&id).map(|m| m.state())
    }

    pub(crate) fn is_done(&self, id: CommandId) -> bool {
        self.machines.get(&id).map(|m| m.is_done()).unwrap_or(true)
    }

    /// Commands the workflow wants to send this task, in machine creation
    /// order.
    pub(crate) fn commands(&mut self) -> Vec<Command> {
        let machines = &self.machines;
        self.insertion_order.retain(|id| machines.contains_key(id));
        self.insertion_order
            .iter()
            .filter_map(|id| self.machines.get(id).and_then(|m| m.command()))
            .collect()
    }

    /// The emitted commands crossed the history boundary: flip `Created`
    /// machines to `CommandSent` and pending cancellations to
    /// `CancellationCommandSent`.
    pub(crate) fn notify_command_sent(&mut self) {
        for machine in self.machines.values_mut() {
            machine.handle_command_sent();
        }
    }

    fn machine_for_event(
        &mut self,
        id: CommandId,
        event: &HistoryEvent,
    ) -> Result<&mut Box<dyn CommandStateMachine>> {
        self.machines.get_mut(&id).ok_or_else(|| {
            WorkerError::NonDeterminism(format!(
                "event {} {:?} references unknown command {id}; workflow code does not match \
                 the recorded history",
                event.event_id(),
                event.event_type(),
            ))
        })
    }

    fn prune_if_completed(&mut self, id: CommandId) {
        let completed = self
            .machines
            .get(&id)
            .map(|m| m.state() == CommandState::Completed)
            .unwrap_or(false);
        if completed {
            self.machines.remove(&id);
            if self.self_machine_id == Some(id) {
                self.self_machine_id = None;
            }
        }
    }

    fn reference_id(event: &HistoryEvent, target: CommandTarget) -> Result<CommandId> {
        let event_id = event.initiating_event_id().ok_or_else(|| {
            WorkerError::IllegalState(format!(
                "event {} {:?} carries no reference to its initiating event",
                event.event_id(),
                event.event_type(),
            ))
        })?;
        Ok(CommandId::new(target, event_id))
    }

    // === Activity events ===

    pub(crate) fn handle_activity_task_scheduled(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = CommandId::new(CommandTarget::Activity, event.event_id());
        self.machine_for_event(id, event)?.handle_initiated_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    pub(crate) fn handle_activity_task_started(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::Activity)?;
        self.machine_for_event(id, event)?.handle_started_event(event)?;
        Ok(())
    }

    pub(crate) fn handle_activity_task_cancel_requested(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::Activity)?;
        self.machine_for_event(id, event)?
            .handle_cancellation_initiated_event(event)?;
        Ok(())
    }

    /// `ActivityTaskCompleted` / `Failed` / `TimedOut`.
    pub(crate) fn handle_activity_completion(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::Activity)?;
        self.machine_for_event(id, event)?.handle_completion_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    pub(crate) fn handle_activity_canceled(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::Activity)?;
        self.machine_for_event(id, event)?.handle_cancellation_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    // === Timer events ===

    pub(crate) fn handle_timer_started(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = CommandId::new(CommandTarget::Timer, event.event_id());
        self.machine_for_event(id, event)?.handle_initiated_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    pub(crate) fn handle_timer_fired(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::Timer)?;
        self.machine_for_event(id, event)?.handle_completion_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    pub(crate) fn handle_timer_canceled(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::Timer)?;
        self.machine_for_event(id, event)?.handle_cancellation_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    // === Child workflow events ===

    pub(crate) fn handle_start_child_workflow_initiated(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        let id = CommandId::new(CommandTarget::ChildWorkflow, event.event_id());
        self.machine_for_event(id, event)?.handle_initiated_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    pub(crate) fn handle_start_child_workflow_failed(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::ChildWorkflow)?;
        self.machine_for_event(id, event)?
            .handle_initiation_failed_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    pub(crate) fn handle_child_workflow_started(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::ChildWorkflow)?;
        self.machine_for_event(id, event)?.handle_started_event(event)?;
        Ok(())
    }

    /// `ChildWorkflowExecutionCompleted` / `Failed` / `TimedOut` /
    /// `Terminated`.
    pub(crate) fn handle_child_workflow_completion(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::ChildWorkflow)?;
        self.machine_for_event(id, event)?.handle_completion_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    pub(crate) fn handle_child_workflow_canceled(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::ChildWorkflow)?;
        self.machine_for_event(id, event)?.handle_cancellation_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    // === External signal events ===

    pub(crate) fn handle_signal_initiated(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = CommandId::new(CommandTarget::Signal, event.event_id());
        self.machine_for_event(id, event)?.handle_initiated_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    /// `ExternalWorkflowExecutionSignaled` or
    /// `SignalExternalWorkflowExecutionFailed`.
    pub(crate) fn handle_signal_completion(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::Signal)?;
        self.machine_for_event(id, event)?.handle_completion_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    // === External cancellation events ===

    pub(crate) fn handle_cancel_external_initiated(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        let id = CommandId::new(CommandTarget::CancelExternal, event.event_id());
        self.machine_for_event(id, event)?.handle_initiated_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    /// `ExternalWorkflowExecutionCancelRequested` or
    /// `RequestCancelExternalWorkflowExecutionFailed`.
    pub(crate) fn handle_cancel_external_completion(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        let id = Self::reference_id(event, CommandTarget::CancelExternal)?;
        self.machine_for_event(id, event)?.handle_completion_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    // === Markers, upserts, workflow completion ===

    /// Markers are dispatched ahead of the event loop that recreates their
    /// machines, so a missing machine is not corruption here; the command
    /// event pass completes it once it exists.
    pub(crate) fn handle_marker_recorded(&mut self, event: &HistoryEvent) -> Result<()> {
        let id = CommandId::new(CommandTarget::Marker, event.event_id());
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.handle_completion_event(event)?;
            self.prune_if_completed(id);
        }
        Ok(())
    }

    pub(crate) fn handle_upsert_search_attributes(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        let id = CommandId::new(CommandTarget::UpsertSearchAttributes, event.event_id());
        self.machine_for_event(id, event)?.handle_completion_event(event)?;
        self.prune_if_completed(id);
        Ok(())
    }

    /// Any of the workflow-execution closing events; completes the pending
    /// self-completion machine when one exists.
    pub(crate) fn handle_workflow_execution_completed(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<()> {
        if let Some(id) = self.self_machine_id {
            if let Some(machine) = self.machines.get_mut(&id) {
                machine.handle_completion_event(event)?;
            }
            self.prune_if_completed(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::event::EventType;
    use chrono::Utc;
    use serde_json::json;

    fn started(bookkeeper: &mut CommandBookkeeper, id: i64) {
        bookkeeper.handle_workflow_task_started(id);
    }

    fn event(id: i64, event_type: EventType, attributes: Value) -> HistoryEvent {
        HistoryEvent::new(id, event_type, attributes, Utc::now())
    }

    fn timer_attributes(ms: i64) -> StartTimerAttributes {
        StartTimerAttributes {
            timer_id: String::new(),
            start_to_fire_timeout_ms: ms,
        }
    }

    #[test]
    fn test_command_event_id_prediction() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        assert_eq!(b.peek_next_command_event_id(), 5);
        let first = b.new_timer(timer_attributes(1_000));
        let second = b.new_activity(ScheduleActivityTaskAttributes::default());
        assert_eq!(first, CommandId::new(CommandTarget::Timer, 5));
        assert_eq!(second, CommandId::new(CommandTarget::Activity, 6));
        assert_eq!(b.last_started_event_id(), 3);
    }

    #[test]
    fn test_timer_id_defaults_to_predicted_event_id() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        b.new_timer(timer_attributes(1_000));
        let commands = b.commands();
        match &commands[0] {
            Command::StartTimer(attributes) => assert_eq!(attributes.timer_id, "5"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_commands_preserve_creation_order() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        b.new_timer(timer_attributes(1_000));
        b.new_activity(ScheduleActivityTaskAttributes {
            activity_id: "a1".to_string(),
            ..Default::default()
        });
        b.new_marker(RecordMarkerAttributes {
            marker_name: "Version".to_string(),
            details: None,
        });
        let commands = b.commands();
        assert!(matches!(commands[0], Command::StartTimer(_)));
        assert!(matches!(commands[1], Command::ScheduleActivityTask(_)));
        assert!(matches!(commands[2], Command::RecordMarker(_)));
    }

    #[test]
    fn test_notify_command_sent_flips_created_machines() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        let id = b.new_timer(timer_attributes(1_000));
        b.notify_command_sent();
        assert_eq!(b.state_of(id), Some(CommandState::CommandSent));
        // Once sent, the command is not emitted again.
        assert!(b.commands().is_empty());
    }

    #[test]
    fn test_timer_lifecycle_routes_by_event_ids() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        let id = b.new_timer(timer_attributes(5_000));
        b.notify_command_sent();
        b.handle_timer_started(&event(5, EventType::TimerStarted, json!({})))
            .unwrap();
        assert_eq!(b.state_of(id), Some(CommandState::Initiated));
        b.handle_timer_fired(&event(
            6,
            EventType::TimerFired,
            json!({"startedEventId": 5, "timerId": "5"}),
        ))
        .unwrap();
        // Terminal machines are pruned.
        assert!(b.state_of(id).is_none());
        assert!(b.is_done(id));
    }

    #[test]
    fn test_unknown_command_reference_is_nondeterminism() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        let err = b
            .handle_timer_started(&event(5, EventType::TimerStarted, json!({})))
            .unwrap_err();
        assert!(matches!(err, WorkerError::NonDeterminism(_)));
        assert!(err.to_string().contains("Timer:5"));
    }

    #[test]
    fn test_signal_cancel_before_initiated_keeps_machine_for_late_events() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        let id = b.new_signal(SignalExternalWorkflowExecutionAttributes {
            workflow_id: "other".to_string(),
            signal_name: "S".to_string(),
            ..Default::default()
        });
        b.notify_command_sent();
        assert!(b.cancel(id, None).unwrap());
        assert_eq!(b.state_of(id), Some(CommandState::CanceledBeforeInitiated));
        assert!(b.is_done(id));

        // Late initiated receipt: no-op, machine stays.
        b.handle_signal_initiated(&event(
            5,
            EventType::SignalExternalWorkflowExecutionInitiated,
            json!({}),
        ))
        .unwrap();
        assert_eq!(b.state_of(id), Some(CommandState::CanceledBeforeInitiated));

        // Late completion lands terminal and prunes.
        b.handle_signal_completion(&event(
            9,
            EventType::ExternalWorkflowExecutionSignaled,
            json!({"initiatedEventId": 5}),
        ))
        .unwrap();
        assert!(b.state_of(id).is_none());
    }

    #[test]
    fn test_marker_event_without_machine_is_tolerated() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        b.handle_marker_recorded(&event(
            5,
            EventType::MarkerRecorded,
            json!({"markerName": "SideEffect"}),
        ))
        .unwrap();
    }

    #[test]
    fn test_workflow_completion_machine_lifecycle() {
        let mut b = CommandBookkeeper::new();
        started(&mut b, 3);
        b.complete_workflow_execution(Some(json!("done")));
        let commands = b.commands();
        assert!(matches!(
            commands[0],
            Command::CompleteWorkflowExecution { .. }
        ));
        b.notify_command_sent();
        b.handle_workflow_execution_completed(&event(
            6,
            EventType::WorkflowExecutionCompleted,
            json!({}),
        ))
        .unwrap();
        assert!(b.commands().is_empty());
    }

    #[test]
    fn test_replay_reproduces_identical_ids_across_tasks() {
        // Two executors driven over the same two tasks allocate identical ids.
        let run = |activities: &mut Vec<CommandId>| {
            let mut b = CommandBookkeeper::new();
            started(&mut b, 3);
            activities.push(b.new_activity(Default::default()));
            b.notify_command_sent();
            started(&mut b, 8);
            activities.push(b.new_activity(Default::default()));
        };
        let mut first = Vec::new();
        let mut second = Vec::new();
        run(&mut first);
        run(&mut second);
        assert_eq!(first, second);
        assert_eq!(first[0].command_event_id, 5);
        assert_eq!(first[1].command_event_id, 10);
    }
}
