//! Workflow orchestration for Paperflow.
//!
//! A request names a workflow; the workflow's builder turns its parameters
//! into a [`TaskGraph`] (a validated DAG of capability-typed tasks) and the
//! [`Orchestrator`] drives that graph to completion: dispatching ready tasks
//! concurrently, retrying transient failures with backoff, propagating
//! failures downstream, and metering every provider call.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Dispatch loop over a task graph.
//! - [`TaskGraph`] / [`TaskGraphBuilder`] — Validated task DAG and its state machine.
//! - [`WorkflowCatalog`] / [`WorkflowBuilder`] — Named, pure graph builders.
//! - [`WorkflowResult`] — Outcome of one workflow run.

/// Orchestration engine.
pub mod engine;
/// Task graph construction and state transitions.
pub mod graph;
/// Shared orchestration types (Task, TaskState, WorkflowResult, etc.).
pub mod types;
/// Built-in workflow builders.
pub mod workflows;

pub use engine::Orchestrator;
pub use graph::{TaskGraph, TaskGraphBuilder};
pub use types::{
    ExecutionOptions, GraphState, Task, TaskFailure, TaskOutcome, TaskSpec, TaskState,
    WorkflowResult, WorkflowStatus,
};
pub use workflows::{WorkflowBuilder, WorkflowCatalog};
