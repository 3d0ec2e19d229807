//! Service-facing types consumed by the replay executor.
//!
//! The executor does not own a gRPC channel; it is handed a poll response by
//! the worker's polling loop and fetches further history pages through the
//! narrow [`WorkflowService`] contract. Wire shapes here mirror the
//! orchestration service's protobuf messages with JSON attribute payloads.

use crate::workflow::event::HistoryEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A query carried by a poll response.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowQuery {
    /// Name of the query handler to invoke
    pub query_type: String,
    /// Query arguments
    pub args: Option<Value>,
}

/// How a query evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResultType {
    Answered,
    Failed,
}

/// Result of evaluating one query against post-replay workflow state.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowQueryResult {
    pub result_type: QueryResultType,
    /// Answer payload when answered; debug-formatted error chain when failed
    pub answer: Option<Value>,
    pub error_message: Option<String>,
}

impl WorkflowQueryResult {
    /// Build a successful result.
    pub fn answered(answer: Option<Value>) -> Self {
        Self {
            result_type: QueryResultType::Answered,
            answer,
            error_message: None,
        }
    }

    /// Build a failed result.
    pub fn failed(message: String, details: Option<Value>) -> Self {
        Self {
            result_type: QueryResultType::Failed,
            answer: details,
            error_message: Some(message),
        }
    }
}

/// A workflow task handed to the executor: one page of history plus the
/// bookkeeping the service attaches to it.
#[derive(Debug, Clone, Default)]
pub struct PollWorkflowTaskResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
    /// First (possibly only) page of history for this task
    pub history: Vec<HistoryEvent>,
    /// Token for fetching the next page; empty when the page is final
    pub next_page_token: Option<String>,
    /// Id of the `WorkflowTaskStarted` event of the previously completed task
    pub previous_started_event_id: i64,
    /// Id of the `WorkflowTaskStarted` event being decided now
    pub started_event_id: i64,
    /// Queries to evaluate after replay, keyed by query id
    pub queries: HashMap<String, WorkflowQuery>,
}

impl PollWorkflowTaskResponse {
    /// Whether the response carries queries (a query-only poll still runs the
    /// full replay pipeline).
    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty()
    }
}

/// One page of workflow history returned by the service.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub events: Vec<HistoryEvent>,
    pub next_page_token: Option<String>,
}

/// The slice of the orchestration service the executor calls directly.
///
/// Only history pagination; polling and task completion stay with the
/// worker's outer loop.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Fetch the next page of history for an execution.
    async fn get_workflow_execution_history(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        next_page_token: &str,
        maximum_page_size: i32,
    ) -> std::result::Result<HistoryPage, tonic::Status>;
}
