//! Grouping of raw history into per-workflow-task batches.
//!
//! History is a flat, append-only event stream. The executor consumes it as
//! batches delimited by `WorkflowTaskStarted` events: each batch carries the
//! ordinary events to dispatch, the markers recorded while that task was
//! being decided (surfaced first, since later events may depend on their
//! payload), and the command events that materialized the task's own
//! commands (dispatched last, as receipts). When the in-memory page runs
//! out, further pages are fetched under a retry policy bounded by the
//! remaining workflow task timeout.

use crate::client::{HistoryPage, WorkflowService};
use crate::error::{Result, WorkerError};
use crate::retry::RetryPolicy;
use crate::workflow::event::{EventType, HistoryEvent};
use std::collections::VecDeque;
use uuid::Uuid;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Largest history page requested during pagination.
const MAXIMUM_PAGE_SIZE: i32 = 10_000;

/// Initial backoff between pagination attempts.
const PAGINATION_INITIAL_INTERVAL_MS: i64 = 200;

/// Backoff cap between pagination attempts.
const PAGINATION_MAXIMUM_INTERVAL_MS: i64 = 4_000;

/// One segment of history delimited by consecutive `WorkflowTaskStarted`
/// events.
#[derive(Debug, Clone)]
pub struct WorkflowTaskBatch {
    /// Started-event id of the preceding batch (0 for the first)
    pub previous_started_event_id: i64,
    /// Id of the `WorkflowTaskStarted` event closing this batch
    pub current_started_event_id: i64,
    /// Ordinary events, in history order
    pub events: Vec<HistoryEvent>,
    /// `MarkerRecorded` events from this batch's command-event region,
    /// surfaced ahead of `events`
    pub markers: Vec<HistoryEvent>,
    /// Events materializing the commands this batch's task produced
    pub command_events: Vec<HistoryEvent>,
    /// Whether this batch was already decided in a previous task
    pub replay: bool,
    /// Deterministic clock value for this batch, in epoch milliseconds
    pub replay_time_ms: i64,
}

/// Streams history events, transparently fetching further pages.
pub(crate) struct PaginatedHistory {
    buffered: VecDeque<HistoryEvent>,
    next_page_token: Option<String>,
    service: Arc<dyn WorkflowService>,
    workflow_id: String,
    run_id: Uuid,
    pagination_start: Instant,
    workflow_task_timeout: Duration,
}

impl PaginatedHistory {
    pub(crate) fn new(
        service: Arc<dyn WorkflowService>,
        workflow_id: String,
        run_id: Uuid,
        events: Vec<HistoryEvent>,
        next_page_token: Option<String>,
        workflow_task_timeout: Duration,
    ) -> Self {
        Self {
            buffered: events.into(),
            next_page_token: next_page_token.filter(|t| !t.is_empty()),
            service,
            workflow_id,
            run_id,
            pagination_start: Instant::now(),
            workflow_task_timeout,
        }
    }

    /// Pop the next event, fetching the next page if the buffer ran dry.
    pub(crate) async fn next_event(&mut self) -> Result<Option<HistoryEvent>> {
        self.ensure_buffered().await?;
        Ok(self.buffered.pop_front())
    }

    /// Event type of the next event without consuming it.
    pub(crate) async fn peek_type(&mut self) -> Result<Option<EventType>> {
        self.ensure_buffered().await?;
        Ok(self.buffered.front().map(|e| e.event_type()))
    }

    async fn ensure_buffered(&mut self) -> Result<()> {
        while self.buffered.is_empty() {
            let Some(token) = self.next_page_token.clone() else {
                return Ok(());
            };
            let page = self.fetch_page(&token).await?;
            self.next_page_token = page.next_page_token.filter(|t| !t.is_empty());
            self.buffered.extend(page.events);
        }
        Ok(())
    }

    /// Fetch one page under retry, bounded by the remaining workflow task
    /// timeout.
    async fn fetch_page(&self, token: &str) -> Result<HistoryPage> {
        let elapsed = self.pagination_start.elapsed();
        let expiration = self
            .workflow_task_timeout
            .checked_sub(elapsed)
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                WorkerError::Grpc(tonic::Status::deadline_exceeded(
                    "history pagination took longer than the workflow task timeout",
                ))
            })?;
        let retry = RetryPolicy::new()
            .with_initial_interval_ms(PAGINATION_INITIAL_INTERVAL_MS)
            .with_maximum_interval_ms(PAGINATION_MAXIMUM_INTERVAL_MS);
        let retry_start = Instant::now();
        let mut attempt: i64 = 1;
        loop {
            match self
                .service
                .get_workflow_execution_history(
                    &self.workflow_id,
                    self.run_id,
                    token,
                    MAXIMUM_PAGE_SIZE,
                )
                .await
            {
                Ok(page) => return Ok(page),
                Err(status) => {
                    let sleep_ms = retry.sleep_time_ms(attempt);
                    let elapsed_ms = retry_start.elapsed().as_millis() as i64;
                    if retry.should_stop(
                        status.code().description(),
                        attempt,
                        elapsed_ms,
                        sleep_ms,
                        Some(expiration.as_millis() as i64),
                    ) {
                        return Err(status.into());
                    }
                    warn!(
                        workflow_id = %self.workflow_id,
                        run_id = %self.run_id,
                        attempt,
                        error = %status,
                        "history pagination failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(sleep_ms as u64)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Groups the flat history stream into [`WorkflowTaskBatch`]es.
pub(crate) struct HistoryBatchIterator {
    history: PaginatedHistory,
    /// Started-event id of the last task the service saw completed; batches
    /// at or before it are replay
    replay_horizon: i64,
    /// Started-event id the poll response says is being decided now
    poll_started_event_id: i64,
    last_batch_started_id: i64,
}

impl HistoryBatchIterator {
    pub(crate) fn new(
        history: PaginatedHistory,
        previous_started_event_id: i64,
        started_event_id: i64,
    ) -> Self {
        Self {
            history,
            replay_horizon: previous_started_event_id,
            poll_started_event_id: started_event_id,
            last_batch_started_id: 0,
        }
    }

    /// Produce the next task batch, or `None` when history is exhausted.
    pub(crate) async fn next_batch(&mut self) -> Result<Option<WorkflowTaskBatch>> {
        let mut events = Vec::new();
        while let Some(event) = self.history.next_event().await? {
            if event.event_type() != EventType::WorkflowTaskStarted {
                events.push(event);
                continue;
            }
            let started_id = event.event_id();
            let replay_time_ms = event.timestamp_ms();
            match self.history.peek_type().await? {
                Some(EventType::WorkflowTaskCompleted) => {
                    self.history.next_event().await?;
                    let (markers, command_events) = self.collect_command_events().await?;
                    return Ok(Some(self.finish_batch(
                        started_id,
                        replay_time_ms,
                        events,
                        markers,
                        command_events,
                    )));
                }
                Some(EventType::WorkflowTaskFailed) | Some(EventType::WorkflowTaskTimedOut) => {
                    // The task closed no batch and produced no commands; its
                    // failure event is still dispatched as an ordinary event.
                    if let Some(failure) = self.history.next_event().await? {
                        events.push(failure);
                    }
                }
                _ => {
                    // The task being decided now.
                    return Ok(Some(self.finish_batch(
                        started_id,
                        replay_time_ms,
                        events,
                        Vec::new(),
                        Vec::new(),
                    )));
                }
            }
        }
        if events.is_empty() {
            return Ok(None);
        }
        // Trailing events with no closing started event: deliver as the
        // final, live batch.
        let replay_time_ms = events.last().map(|e| e.timestamp_ms()).unwrap_or(0);
        let started_id = self.poll_started_event_id;
        let mut batch =
            self.finish_batch(started_id, replay_time_ms, events, Vec::new(), Vec::new());
        batch.replay = false;
        Ok(Some(batch))
    }

    async fn collect_command_events(
        &mut self,
    ) -> Result<(Vec<HistoryEvent>, Vec<HistoryEvent>)> {
        let mut markers = Vec::new();
        let mut command_events = Vec::new();
        while let Some(event_type) = self.history.peek_type().await? {
            if !event_type.is_command_event() {
                break;
            }
            if let Some(event) = self.history.next_event().await? {
                if event.event_type() == EventType::MarkerRecorded {
                    markers.push(event.clone());
                }
                command_events.push(event);
            }
        }
        Ok((markers, command_events))
    }

    fn finish_batch(
        &mut self,
        started_id: i64,
        replay_time_ms: i64,
        events: Vec<HistoryEvent>,
        markers: Vec<HistoryEvent>,
        command_events: Vec<HistoryEvent>,
    ) -> WorkflowTaskBatch {
        let previous = self.last_batch_started_id;
        self.last_batch_started_id = started_id;
        WorkflowTaskBatch {
            previous_started_event_id: previous,
            current_started_event_id: started_id,
            events,
            markers,
            command_events,
            replay: started_id != 0 && started_id <= self.replay_horizon,
            replay_time_ms,
        }
    }
}
