//! DBaaS Workflow Engine
//!
//! Runs the ordered step list of one maintenance operation against one
//! instance, as a saga: steps apply in order, and when one fails every step
//! this run already applied is compensated in reverse order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              WorkflowExecutor                        │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │   InstanceLocks (one pipeline per instance) │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │   Pipeline (OperationKind → steps)          │    │
//! │  │   run_do in order, run_undo in reverse      │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │         WorkflowEvent Stream                │    │
//! │  │   Started | Step* | Compensat* | Completed  │    │
//! │  └─────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use dbaas_workflow::{OperationKind, WorkflowExecutor};
//!
//! let executor = WorkflowExecutor::new();
//! let pipeline = OperationKind::RecreateSlave.pipeline();
//! let ctx = StepContext::load(services, instance_id).await?.with_maintenance(7);
//!
//! executor.run(&pipeline, &ctx).await?;
//! ```

pub mod error;
pub mod executor;
pub mod maintenance;
pub mod pipeline;

pub use error::*;
pub use executor::*;
pub use maintenance::*;
pub use pipeline::*;
