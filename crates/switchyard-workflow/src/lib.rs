//! Switchyard Workflow
//!
//! This crate provides the validated workflow representation for switchyard.
//! A [`Workflow`] is built from a `WorkflowDef` once and is immutable
//! afterwards; every structural problem is reported as a [`WorkflowError`]
//! before anything runs.
//!
//! Key differences from `switchyard-config`:
//! - Edges only reference existing nodes and never cross a scope boundary
//! - Unconditioned edges form a DAG; conditional back edges are identified
//! - Every node is reachable from an entry point
//! - Loop bodies, parallel branches and error handlers are resolved to
//!   the nodes they own, so the scheduler can tell which nodes it dispatches

mod error;
mod graph;
mod workflow;

pub use error::WorkflowError;
pub use graph::Graph;
pub use workflow::Workflow;
