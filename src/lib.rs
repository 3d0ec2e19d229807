//! # Lodestar worker core
//!
//! The replay executor at the heart of a Lodestar worker: it re-drives a
//! durable workflow program through the event history recorded by the
//! orchestration service, reproducing every past decision bit-identically
//! and emitting the new commands the workflow wants to make beyond the
//! replayed suffix.
//!
//! ## Architecture
//!
//! - [`workflow::event`] / [`workflow::command`] - the history event
//!   alphabet and the commands a worker responds with
//! - [`workflow::history`] - grouping of raw history into per-workflow-task
//!   batches, with bounded-retry pagination
//! - [`worker::machines`] - one small FSM per emitted command, auditing its
//!   lifecycle against server events
//! - [`worker::bookkeeper`] - the ordered machine registry, command id
//!   prediction, and event routing
//! - [`worker::context`] - the narrow capability surface workflow programs
//!   emit commands through
//! - [`worker::local_activity`] - in-process activities recorded as markers,
//!   heartbeating through forced workflow tasks
//! - [`worker::executor`] - the per-task pipeline tying it all together
//!
//! The workflow program itself (the cooperative dispatcher running user
//! code) is an external collaborator behind the
//! [`workflow::program::WorkflowProgram`] contract; so are the gRPC stubs,
//! data conversion, and worker pooling.
//!
//! ## Determinism
//!
//! Replaying the same history suffix must produce identical command lists.
//! The executor guards this at runtime: command ids are predicted from
//! workflow task boundaries, and a history event referencing a command this
//! executor never produced fails the workflow task (or the workflow, under
//! [`workflow::program::WorkflowErrorPolicy::FailWorkflow`]).

pub mod client;
pub mod error;
pub mod retry;
pub mod worker;
pub mod workflow;

pub use client::{
    HistoryPage, PollWorkflowTaskResponse, QueryResultType, WorkflowQuery, WorkflowQueryResult,
    WorkflowService,
};
pub use error::{Result, WorkerError};
pub use retry::RetryPolicy;
pub use worker::{ReplayExecutor, WorkflowTaskResult};
pub use workflow::{Command, EventType, HistoryEvent, WorkflowProgram};
