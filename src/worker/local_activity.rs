//! Local activity plumbing.
//!
//! Local activities run in-process during a workflow task and record their
//! outcome as `MarkerRecorded` events. The executor starts queued tasks
//! through a [`LocalActivityPoller`] and receives completions through the
//! [`LocalActivityCompletionSink`], whose events are dispatched under the
//! executor mutex.

use crate::retry::RetryPolicy;
use crate::workflow::event::{EventType, HistoryEvent};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Marker name under which local activity results are recorded.
pub const LOCAL_ACTIVITY_MARKER_NAME: &str = "LocalActivity";

/// A local activity queued by the workflow program.
#[derive(Debug, Clone)]
pub struct LocalActivityRequest {
    /// Deterministic id assigned by the program; pairs the marker back to
    /// the pending task
    pub activity_id: String,
    pub activity_type: String,
    pub input: Option<Value>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Outcome of a local activity, decoded from its marker details.
#[derive(Debug, Clone)]
pub struct LocalActivityResolution {
    pub result: Option<Value>,
    pub failure: Option<Value>,
}

/// Executes local activity tasks on behalf of the executor. Implementations
/// run the function elsewhere and deliver the outcome through the completion
/// sink.
pub trait LocalActivityPoller: Send + Sync {
    /// Accept a task for execution, waiting at most `max_wait` for capacity.
    /// Returns false when the task could not be started in time.
    fn submit(&self, request: LocalActivityRequest, max_wait: Duration) -> bool;
}

/// Hands finished local activities back to the executor.
#[derive(Clone)]
pub struct LocalActivityCompletionSink {
    tx: mpsc::UnboundedSender<HistoryEvent>,
}

impl LocalActivityCompletionSink {
    /// Deposit a completion event; it is dispatched under the executor
    /// mutex at the next await point.
    pub fn complete(&self, event: HistoryEvent) {
        let _ = self.tx.send(event);
    }

    /// Build the marker event for a finished local activity.
    pub fn marker_event(
        activity_id: &str,
        result: Option<Value>,
        failure: Option<Value>,
    ) -> HistoryEvent {
        let mut details = json!({ "activityId": activity_id });
        if let Some(result) = result {
            details["result"] = result;
        }
        if let Some(failure) = failure {
            details["failure"] = failure;
        }
        HistoryEvent::new(
            0,
            EventType::MarkerRecorded,
            json!({
                "markerName": LOCAL_ACTIVITY_MARKER_NAME,
                "details": details,
            }),
            Utc::now(),
        )
    }
}

/// Dispatches local activities within a workflow task deadline.
pub(crate) struct LocalActivityRunner {
    poller: Arc<dyn LocalActivityPoller>,
    completion_rx: mpsc::UnboundedReceiver<HistoryEvent>,
}

impl LocalActivityRunner {
    pub(crate) fn new(
        poller: Arc<dyn LocalActivityPoller>,
    ) -> (Self, LocalActivityCompletionSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                poller,
                completion_rx: rx,
            },
            LocalActivityCompletionSink { tx },
        )
    }

    /// Submit every unstarted task, bounded by `max_wait` each. Returns
    /// false when a task could not be started before the deadline.
    pub(crate) fn start_unstarted(
        &self,
        ctx: &mut crate::worker::context::WorkflowContext,
        max_wait: Duration,
    ) -> bool {
        while let Some(request) = ctx.next_unstarted_local_activity() {
            let activity_id = request.activity_id.clone();
            if !self.poller.submit(request.clone(), max_wait) {
                ctx.requeue_unstarted_local_activity(request);
                return false;
            }
            ctx.mark_local_activity_started(&activity_id);
        }
        true
    }

    /// Wait up to `max_wait` for at least one completion, then drain
    /// whatever else already arrived. Empty on timeout.
    pub(crate) async fn await_completions(&mut self, max_wait: Duration) -> Vec<HistoryEvent> {
        let mut events = Vec::new();
        match tokio::time::timeout(max_wait, self.completion_rx.recv()).await {
            Ok(Some(event)) => {
                events.push(event);
                while let Ok(event) = self.completion_rx.try_recv() {
                    events.push(event);
                }
            }
            Ok(None) | Err(_) => {}
        }
        events
    }
}
