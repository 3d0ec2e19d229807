//! The replay executor: drives one cached workflow run through
//! server-supplied history, emits new commands, and mediates between the
//! workflow program and the orchestration service.
//!
//! One executor instance serves one run. A single mutex guards all state;
//! the only suspension points while holding it are history pagination,
//! awaiting local activity completions, and the workflow program's own event
//! loop.

use crate::client::{PollWorkflowTaskResponse, WorkflowQuery, WorkflowQueryResult, WorkflowService};
use crate::error::{Result, WorkerError};
use crate::worker::bookkeeper::FORCE_IMMEDIATE_WORKFLOW_TASK_TIMER;
use crate::worker::context::WorkflowContext;
use crate::worker::local_activity::{
    LocalActivityCompletionSink, LocalActivityPoller, LocalActivityRunner,
    LOCAL_ACTIVITY_MARKER_NAME,
};
use crate::worker::machines::CommandId;
use crate::worker::metrics::ExecutorMetrics;
use crate::workflow::command::{Command, WorkflowFailure};
use crate::workflow::event::{EventType, HistoryEvent};
use crate::workflow::history::{HistoryBatchIterator, PaginatedHistory, WorkflowTaskBatch};
use crate::workflow::program::{ProgramError, WorkflowErrorPolicy, WorkflowProgram};
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Fallback when the start event does not carry a workflow task timeout.
const DEFAULT_WORKFLOW_TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one workflow task cycle.
#[derive(Debug)]
pub struct WorkflowTaskResult {
    /// Commands to send back, in creation order
    pub commands: Vec<Command>,
    /// Per-query results for queries carried by the poll response
    pub query_results: HashMap<String, WorkflowQueryResult>,
    /// Ask the service for a fresh workflow task immediately (local
    /// activity heartbeat)
    pub force_create_new_workflow_task: bool,
    /// Whether the commands close the workflow execution
    pub final_command: bool,
}

struct ExecutorInner {
    workflow: Box<dyn WorkflowProgram>,
    context: WorkflowContext,
    runner: LocalActivityRunner,
    completed: bool,
    failure: Option<WorkflowFailure>,
    cancel_requested: bool,
    completion_command_emitted: bool,
    wake_up_time_ms: i64,
    wake_up_timer: Option<CommandId>,
    query_results: HashMap<String, WorkflowQueryResult>,
    workflow_task_timeout: Duration,
}

/// Workflow executor that relies on replay of workflow code. One instance is
/// created per cached workflow run.
pub struct ReplayExecutor {
    service: Arc<dyn WorkflowService>,
    inner: Mutex<ExecutorInner>,
    completion_sink: LocalActivityCompletionSink,
    metrics: Arc<SyncMutex<ExecutorMetrics>>,
}

impl ReplayExecutor {
    /// Build an executor for the run described by the first poll response.
    /// The first history event must be `WorkflowExecutionStarted`.
    pub fn new(
        service: Arc<dyn WorkflowService>,
        workflow: Box<dyn WorkflowProgram>,
        local_activity_poller: Arc<dyn LocalActivityPoller>,
        first_task: &PollWorkflowTaskResponse,
    ) -> Result<Self> {
        let first_event = first_task.history.first().ok_or_else(|| {
            WorkerError::IllegalState("workflow task carries no history".to_string())
        })?;
        if first_event.event_type() != EventType::WorkflowExecutionStarted {
            return Err(WorkerError::IllegalState(
                "first event in the history is not WorkflowExecutionStarted".to_string(),
            ));
        }
        let workflow_task_timeout = first_event
            .get_i64("workflowTaskTimeoutMs")
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or(DEFAULT_WORKFLOW_TASK_TIMEOUT);
        let context = WorkflowContext::new(
            first_task.workflow_id.clone(),
            first_task.run_id,
            first_event.timestamp_ms(),
        );
        let (runner, completion_sink) = LocalActivityRunner::new(local_activity_poller);
        Ok(Self {
            service,
            inner: Mutex::new(ExecutorInner {
                workflow,
                context,
                runner,
                completed: false,
                failure: None,
                cancel_requested: false,
                completion_command_emitted: false,
                wake_up_time_ms: 0,
                wake_up_timer: None,
                query_results: HashMap::new(),
                workflow_task_timeout,
            }),
            completion_sink,
            metrics: Arc::new(SyncMutex::new(ExecutorMetrics::new())),
        })
    }

    /// Run one workflow task end-to-end and produce the commands, query
    /// results and control flags to respond with.
    pub async fn handle_workflow_task(
        &self,
        task: PollWorkflowTaskResponse,
    ) -> Result<WorkflowTaskResult> {
        let mut inner = self.inner.lock().await;
        inner.query_results.clear();
        let (force_create_new_workflow_task, _) =
            self.handle_task_impl(&mut inner, &task, None).await?;
        let commands = inner.context.bookkeeper_mut().commands();
        inner.context.bookkeeper_mut().notify_command_sent();
        Ok(WorkflowTaskResult {
            commands,
            query_results: std::mem::take(&mut inner.query_results),
            force_create_new_workflow_task,
            final_command: inner.completed,
        })
    }

    /// Run the full replay pipeline for a direct (legacy) query and return
    /// its answer. Commands produced along the way are not emitted.
    pub async fn handle_query_workflow_task(
        &self,
        task: PollWorkflowTaskResponse,
        query: WorkflowQuery,
    ) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().await;
        inner.query_results.clear();
        let (_, answer) = self.handle_task_impl(&mut inner, &task, Some(&query)).await?;
        Ok(answer.flatten())
    }

    /// Release the workflow program's resources.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.workflow.close();
    }

    /// Sink the local activity worker deposits completion markers into;
    /// they are dispatched under the executor mutex.
    pub fn local_activity_completion_sink(&self) -> LocalActivityCompletionSink {
        self.completion_sink.clone()
    }

    /// Snapshot of this executor's counters.
    pub fn metrics(&self) -> ExecutorMetrics {
        self.metrics.lock().clone()
    }

    async fn handle_task_impl(
        &self,
        inner: &mut ExecutorInner,
        task: &PollWorkflowTaskResponse,
        legacy_query: Option<&WorkflowQuery>,
    ) -> Result<(bool, Option<Option<Value>>)> {
        let force = match self.process_batches(inner, task).await {
            Ok(force) => force,
            Err(error) if error.is_replay_corruption() => {
                if inner.workflow.implementation_options().error_policy
                    == WorkflowErrorPolicy::FailWorkflow
                {
                    warn!(
                        workflow_id = %task.workflow_id,
                        error = %error,
                        "replay corruption detected, failing workflow"
                    );
                    inner.failure = Some(inner.workflow.map_engine_error(&error));
                    inner.completed = true;
                    Self::complete_workflow(inner, &self.metrics);
                    false
                } else {
                    self.metrics.lock().workflow_tasks_without_completion += 1;
                    return Err(error);
                }
            }
            Err(error) => return Err(error),
        };

        for (query_id, query) in &task.queries {
            let result = match inner.workflow.query(query) {
                Ok(answer) => WorkflowQueryResult::answered(answer),
                Err(error) => WorkflowQueryResult::failed(
                    error.to_string(),
                    Some(json!(format!("{error:?}"))),
                ),
            };
            inner.query_results.insert(query_id.clone(), result);
        }
        let legacy_answer = match legacy_query {
            Some(query) => Some(inner.workflow.query(query)?),
            None => None,
        };
        if inner.completed {
            inner.workflow.close();
        }
        Ok((force, legacy_answer))
    }

    async fn process_batches(
        &self,
        inner: &mut ExecutorInner,
        task: &PollWorkflowTaskResponse,
    ) -> Result<bool> {
        let start_time = Instant::now();
        let history = PaginatedHistory::new(
            self.service.clone(),
            task.workflow_id.clone(),
            task.run_id,
            task.history.clone(),
            task.next_page_token.clone(),
            inner.workflow_task_timeout,
        );
        let mut iterator =
            HistoryBatchIterator::new(history, task.previous_started_event_id, task.started_event_id);

        let last_started = inner.context.bookkeeper().last_started_event_id();
        if last_started > 0
            && last_started != task.previous_started_event_id
            && !task.history.is_empty()
        {
            return Err(WorkerError::NonDeterminism(format!(
                "executor processed up to event id {last_started}, but the history's previous \
                 started event id is {}",
                task.previous_started_event_id
            )));
        }

        let mut force_create_new_workflow_task = false;
        while let Some(batch) = iterator.next_batch().await? {
            debug!(
                workflow_id = %task.workflow_id,
                started_event_id = batch.current_started_event_id,
                replay = batch.replay,
                "processing workflow task batch"
            );
            inner.context.set_replaying(batch.replay);
            inner.context.set_time_ms(batch.replay_time_ms);
            inner
                .context
                .bookkeeper_mut()
                .handle_workflow_task_started(batch.current_started_event_id);

            // Markers are dispatched first as later events may depend on
            // their payload. Local activity markers go through the replay
            // loop instead.
            for marker in &batch.markers {
                if marker.get_string("markerName") != Some(LOCAL_ACTIVITY_MARKER_NAME) {
                    Self::process_event(inner, marker)?;
                }
            }
            for event in &batch.events {
                Self::process_event(inner, event)?;
            }

            force_create_new_workflow_task = self
                .process_event_loop(inner, start_time, &batch, task.has_queries())
                .await?;

            Self::may_be_complete_workflow(inner, &self.metrics)?;
            if batch.replay {
                inner.context.bookkeeper_mut().notify_command_sent();
            }
            // Receipts for the commands this batch's task produced.
            for event in &batch.command_events {
                Self::process_event(inner, event)?;
            }
            inner
                .context
                .bookkeeper_mut()
                .handle_workflow_task_started(batch.current_started_event_id);
        }
        Ok(force_create_new_workflow_task)
    }

    async fn process_event_loop(
        &self,
        inner: &mut ExecutorInner,
        start_time: Instant,
        batch: &WorkflowTaskBatch,
        is_query: bool,
    ) -> Result<bool> {
        Self::run_event_loop(inner);
        if batch.replay || is_query {
            self.replay_local_activities(inner, batch)
        } else {
            self.execute_local_activities(inner, start_time).await
        }
    }

    /// Re-drive queued local activities from this batch's markers,
    /// iterating while the program keeps enqueuing tasks whose markers are
    /// already present.
    fn replay_local_activities(
        &self,
        inner: &mut ExecutorInner,
        batch: &WorkflowTaskBatch,
    ) -> Result<bool> {
        let markers: Vec<HistoryEvent> = batch
            .markers
            .iter()
            .filter(|m| m.get_string("markerName") == Some(LOCAL_ACTIVITY_MARKER_NAME))
            .cloned()
            .collect();
        if markers.is_empty() {
            return Ok(false);
        }
        let mut processed = 0;
        while inner.context.num_pending_local_activities() > 0 {
            let pending = inner.context.num_pending_local_activities();
            for marker in &markers {
                Self::process_event(inner, marker)?;
            }
            Self::run_event_loop(inner);
            processed += pending;
            self.metrics.lock().local_activities_replayed += pending as u64;
            if processed >= markers.len() {
                break;
            }
        }
        Ok(false)
    }

    /// Execute queued local activities within the workflow task deadline.
    /// Returning true asks for an immediate fresh workflow task, which is
    /// the heartbeat keeping the current one from timing out.
    async fn execute_local_activities(
        &self,
        inner: &mut ExecutorInner,
        start_time: Instant,
    ) -> Result<bool> {
        let budget = inner.workflow_task_timeout * 4 / 5;
        while inner.context.num_pending_local_activities() > 0 {
            let Some(max_wait) = budget.checked_sub(start_time.elapsed()) else {
                return Ok(true);
            };
            if !inner.runner.start_unstarted(&mut inner.context, max_wait) {
                return Ok(true);
            }
            let completions = inner.runner.await_completions(max_wait).await;
            self.metrics.lock().local_activities_executed += completions.len() as u64;
            for event in &completions {
                Self::process_event(inner, event)?;
            }
            Self::run_event_loop(inner);
            if inner.context.num_pending_local_activities() == 0 {
                return Ok(false);
            }
            if start_time.elapsed() > budget {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn run_event_loop(inner: &mut ExecutorInner) {
        if inner.completed {
            return;
        }
        match inner.workflow.event_loop(&mut inner.context) {
            Ok(completed) => inner.completed = completed,
            Err(ProgramError::Failure(failure)) => {
                inner.failure = Some(failure);
                inner.completed = true;
            }
            Err(ProgramError::Canceled { message }) => {
                if !inner.cancel_requested {
                    inner.failure = Some(inner.workflow.map_unexpected_error(&message));
                }
                inner.completed = true;
            }
            Err(ProgramError::Unexpected { message }) => {
                inner.failure = Some(inner.workflow.map_unexpected_error(&message));
                inner.completed = true;
            }
        }
    }

    fn may_be_complete_workflow(
        inner: &mut ExecutorInner,
        metrics: &Arc<SyncMutex<ExecutorMetrics>>,
    ) -> Result<()> {
        if inner.completed {
            Self::complete_workflow(inner, metrics);
            Ok(())
        } else {
            Self::update_timers(inner)
        }
    }

    fn complete_workflow(inner: &mut ExecutorInner, metrics: &Arc<SyncMutex<ExecutorMetrics>>) {
        if inner.completion_command_emitted {
            return;
        }
        inner.completion_command_emitted = true;
        if let Some(failure) = inner.failure.clone() {
            inner.context.bookkeeper_mut().fail_workflow_execution(failure);
            metrics.lock().workflows_failed += 1;
        } else if inner.cancel_requested {
            inner.context.bookkeeper_mut().cancel_workflow_execution(None);
            metrics.lock().workflows_canceled += 1;
        } else if let Some(attributes) = inner.context.take_continue_as_new() {
            inner
                .context
                .bookkeeper_mut()
                .continue_as_new_workflow_execution(attributes);
            metrics.lock().workflows_continued_as_new += 1;
        } else {
            let output = inner.workflow.output();
            inner
                .context
                .bookkeeper_mut()
                .complete_workflow_execution(output);
            metrics.lock().workflows_completed += 1;
        }
    }

    /// Reconcile the single deterministic wake-up timer with the program's
    /// next wake-up time.
    fn update_timers(inner: &mut ExecutorInner) -> Result<()> {
        let next_wake_up = inner.workflow.next_wake_up_time_ms();
        if next_wake_up == 0 {
            if let Some(timer) = inner.wake_up_timer.take() {
                inner.context.cancel_timer(timer)?;
            }
            inner.wake_up_time_ms = 0;
            return Ok(());
        }
        if next_wake_up == inner.wake_up_time_ms && inner.wake_up_timer.is_some() {
            return Ok(());
        }
        let delay_ms = next_wake_up - inner.context.current_time_ms();
        if delay_ms < 0 {
            return Err(WorkerError::IllegalState(format!(
                "negative wake-up delay: {delay_ms}ms"
            )));
        }
        if let Some(timer) = inner.wake_up_timer.take() {
            inner.context.cancel_timer(timer)?;
        }
        inner.wake_up_time_ms = next_wake_up;
        let timer = inner.context.start_timer(
            delay_ms,
            Box::new(|_| {
                // Intentionally empty. The timer only makes the service
                // schedule a workflow task once the workflow can progress.
            }),
        );
        inner.wake_up_timer = Some(timer);
        Ok(())
    }

    fn process_event(inner: &mut ExecutorInner, event: &HistoryEvent) -> Result<()> {
        match event.event_type() {
            EventType::WorkflowExecutionStarted => {
                if let Err(error) = inner.workflow.start(event, &mut inner.context) {
                    Self::record_program_error(inner, error);
                }
                Ok(())
            }
            EventType::WorkflowExecutionCancelRequested => {
                inner.context.set_cancel_requested(true);
                let cause = event.get_string("cause").unwrap_or_default().to_string();
                inner.workflow.cancel(&mut inner.context, &cause);
                inner.cancel_requested = true;
                Ok(())
            }
            EventType::WorkflowExecutionSignaled => {
                if inner.completed {
                    return Err(WorkerError::IllegalState(
                        "signal received after workflow is closed".to_string(),
                    ));
                }
                let name = event.get_string("signalName").unwrap_or_default().to_string();
                let input = event.get("input").cloned();
                inner
                    .workflow
                    .handle_signal(&mut inner.context, &name, input, event.event_id());
                Ok(())
            }
            EventType::WorkflowExecutionCompleted
            | EventType::WorkflowExecutionFailed
            | EventType::WorkflowExecutionCanceled
            | EventType::WorkflowExecutionTimedOut
            | EventType::WorkflowExecutionContinuedAsNew => inner
                .context
                .bookkeeper_mut()
                .handle_workflow_execution_completed(event),
            EventType::WorkflowExecutionTerminated => Ok(()),

            EventType::WorkflowTaskScheduled | EventType::WorkflowTaskCompleted => Ok(()),
            EventType::WorkflowTaskStarted => Err(WorkerError::IllegalState(
                "WorkflowTaskStarted is consumed by batching and never dispatched".to_string(),
            )),
            EventType::WorkflowTaskFailed | EventType::WorkflowTaskTimedOut => {
                inner.context.handle_workflow_task_failed(event);
                Ok(())
            }

            EventType::ActivityTaskScheduled => inner
                .context
                .bookkeeper_mut()
                .handle_activity_task_scheduled(event),
            EventType::ActivityTaskStarted => inner
                .context
                .bookkeeper_mut()
                .handle_activity_task_started(event),
            EventType::ActivityTaskCancelRequested => inner
                .context
                .bookkeeper_mut()
                .handle_activity_task_cancel_requested(event),
            EventType::ActivityTaskCompleted
            | EventType::ActivityTaskFailed
            | EventType::ActivityTaskTimedOut => inner.context.handle_activity_completion(event),
            EventType::ActivityTaskCanceled => inner.context.handle_activity_canceled(event),

            EventType::TimerStarted => {
                inner.context.bookkeeper_mut().handle_timer_started(event)
            }
            EventType::TimerFired => {
                if event.get_string("timerId") == Some(FORCE_IMMEDIATE_WORKFLOW_TASK_TIMER) {
                    return Ok(());
                }
                inner.context.handle_timer_fired(event)
            }
            EventType::TimerCanceled => inner.context.handle_timer_canceled(event),

            EventType::MarkerRecorded => inner.context.handle_marker_recorded(event),
            EventType::UpsertWorkflowSearchAttributes => {
                inner.context.handle_upsert_search_attributes(event)
            }

            EventType::StartChildWorkflowExecutionInitiated => inner
                .context
                .bookkeeper_mut()
                .handle_start_child_workflow_initiated(event),
            EventType::StartChildWorkflowExecutionFailed => {
                inner.context.handle_start_child_workflow_failed(event)
            }
            EventType::ChildWorkflowExecutionStarted => {
                inner.context.handle_child_workflow_started(event)
            }
            EventType::ChildWorkflowExecutionCompleted
            | EventType::ChildWorkflowExecutionFailed
            | EventType::ChildWorkflowExecutionTimedOut
            | EventType::ChildWorkflowExecutionTerminated => {
                inner.context.handle_child_workflow_completion(event)
            }
            EventType::ChildWorkflowExecutionCanceled => {
                inner.context.handle_child_workflow_canceled(event)
            }

            EventType::SignalExternalWorkflowExecutionInitiated => inner
                .context
                .bookkeeper_mut()
                .handle_signal_initiated(event),
            EventType::SignalExternalWorkflowExecutionFailed => {
                inner.context.handle_signal_external_failed(event)
            }
            EventType::ExternalWorkflowExecutionSignaled => {
                inner.context.handle_external_workflow_signaled(event)
            }

            EventType::RequestCancelExternalWorkflowExecutionInitiated => inner
                .context
                .bookkeeper_mut()
                .handle_cancel_external_initiated(event),
            EventType::RequestCancelExternalWorkflowExecutionFailed => {
                inner.context.handle_cancel_external_failed(event)
            }
            EventType::ExternalWorkflowExecutionCancelRequested => {
                inner.context.handle_external_cancel_requested(event)
            }
        }
    }

    fn record_program_error(inner: &mut ExecutorInner, error: ProgramError) {
        match error {
            ProgramError::Failure(failure) => {
                inner.failure = Some(failure);
                inner.completed = true;
            }
            ProgramError::Canceled { message } => {
                if !inner.cancel_requested {
                    inner.failure = Some(inner.workflow.map_unexpected_error(&message));
                }
                inner.completed = true;
            }
            ProgramError::Unexpected { message } => {
                inner.failure = Some(inner.workflow.map_unexpected_error(&message));
                inner.completed = true;
            }
        }
    }
}
