//! Saga execution engine
//!
//! This module provides the WorkflowExecutor that runs a pipeline's steps
//! against one instance and compensates them when a step fails.

use crate::error::{Compensation, Result, WorkflowError};
use crate::pipeline::Pipeline;
use chrono::Utc;
use dbaas_common::{Id, Maintenance, MaintenanceStatus, StoreError};
use dbaas_steps::{run_do, run_undo, ErrorKind, Gated, Outcome, Step, StepContext, StepError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a step did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `can_run` was false
    NotRunnable,
    /// `is_valid` was false for this instance
    NotValid,
}

/// Event emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Pipeline started
    Started {
        run_id: Uuid,
        operation: String,
        instance: Id,
        steps: usize,
    },
    /// Step started
    StepStarted { run_id: Uuid, index: usize, step: String },
    /// Step applied its forward effect
    StepCompleted { run_id: Uuid, index: usize, step: String },
    /// Step did not apply to this instance
    StepSkipped {
        run_id: Uuid,
        index: usize,
        step: String,
        reason: SkipReason,
    },
    /// Step failed; compensation follows
    StepFailed {
        run_id: Uuid,
        index: usize,
        step: String,
        kind: ErrorKind,
        message: String,
    },
    /// Undo of an applied step started
    Compensating { run_id: Uuid, index: usize, step: String },
    /// Undo of an applied step failed; compensation carries on
    CompensationFailed {
        run_id: Uuid,
        index: usize,
        step: String,
        message: String,
    },
    /// Compensation stopped at a step that cannot be undone
    CompensationHalted { run_id: Uuid, index: usize, step: String },
    /// Pipeline finished
    Completed { run_id: Uuid, success: bool },
}

/// Result of a pipeline run that succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Steps whose forward effect ran, in order
    pub applied: Vec<String>,
    /// Steps gated out for this instance
    pub skipped: Vec<String>,
}

/// Instances with a pipeline in flight
#[derive(Debug, Clone, Default)]
pub struct InstanceLocks {
    held: Arc<Mutex<HashSet<Id>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `instance`, failing if another pipeline holds it
    pub fn acquire(&self, instance: Id) -> Result<InstanceGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(instance) {
            return Err(WorkflowError::InstanceBusy(instance));
        }
        Ok(InstanceGuard {
            instance,
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, instance: Id) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&instance)
    }
}

/// Releases the instance when dropped
#[derive(Debug)]
pub struct InstanceGuard {
    instance: Id,
    held: Arc<Mutex<HashSet<Id>>>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.instance);
    }
}

/// Pipeline execution engine
///
/// Runs the steps of a [`Pipeline`] in order for the context's instance:
/// 1. Claims the instance so no other pipeline runs on it meanwhile
/// 2. Runs each step behind its gates, recording progress on the bound
///    maintenance
/// 3. On failure, undoes every step applied so far in reverse order
/// 4. Reports progress via events
#[derive(Debug)]
pub struct WorkflowExecutor {
    /// Per-instance mutual exclusion
    locks: InstanceLocks,

    /// Event sender for pipeline events
    event_sender: broadcast::Sender<WorkflowEvent>,
}

impl Default for WorkflowExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowExecutor {
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            locks: InstanceLocks::new(),
            event_sender,
        }
    }

    /// Share instance locks with other executors
    pub fn with_locks(mut self, locks: InstanceLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_sender.subscribe()
    }

    /// Run the whole pipeline
    pub async fn run(&self, pipeline: &Pipeline, ctx: &StepContext) -> Result<RunReport> {
        self.run_from(pipeline, ctx, 0).await
    }

    /// Continue the bound maintenance from the step it stopped at
    pub async fn resume(&self, pipeline: &Pipeline, ctx: &StepContext) -> Result<RunReport> {
        let maintenance = ctx.maintenance().await?;
        self.run_from(pipeline, ctx, maintenance.current_step.unwrap_or(0))
            .await
    }

    /// Run the pipeline starting at step `start`
    ///
    /// Steps before `start` count as applied by an earlier run: they are
    /// not run again, but are compensated if a later step fails.
    pub async fn run_from(&self, pipeline: &Pipeline, ctx: &StepContext, start: usize) -> Result<RunReport> {
        if start > pipeline.len() {
            return Err(WorkflowError::InvalidResume {
                index: start,
                len: pipeline.len(),
            });
        }

        let _guard = self.locks.acquire(ctx.instance.id)?;
        let run_id = Uuid::now_v7();
        info!(
            run = %run_id,
            operation = %pipeline.kind(),
            instance = %ctx.instance,
            start,
            "Starting pipeline"
        );

        let mut applied = Vec::new();
        for (index, step) in pipeline.steps().iter().enumerate().take(start) {
            if step.can_run(ctx).await? {
                applied.push(index);
            }
        }

        self.record(ctx, |m| {
            m.status = MaintenanceStatus::Running;
            m.current_step = Some(start);
            m.started_at.get_or_insert_with(Utc::now);
            m.finished_at = None;
        })
        .await?;

        let _ = self.event_sender.send(WorkflowEvent::Started {
            run_id,
            operation: pipeline.kind().to_string(),
            instance: ctx.instance.id,
            steps: pipeline.len(),
        });

        let mut report = RunReport {
            run_id,
            applied: Vec::new(),
            skipped: Vec::new(),
        };

        for (index, step) in pipeline.steps().iter().enumerate().skip(start) {
            let name = step.name().to_string();
            if let Err(e) = self.record(ctx, |m| m.current_step = Some(index)).await {
                return Err(self.fail(pipeline, ctx, run_id, index, e.into(), &applied).await);
            }

            let _ = self.event_sender.send(WorkflowEvent::StepStarted {
                run_id,
                index,
                step: name.clone(),
            });
            info!(run = %run_id, step = %name, "{}", step.description());

            let reason = match run_do(step.as_ref(), ctx).await {
                Ok(Outcome::Applied) => {
                    applied.push(index);
                    report.applied.push(name.clone());
                    let _ = self.event_sender.send(WorkflowEvent::StepCompleted {
                        run_id,
                        index,
                        step: name,
                    });
                    continue;
                }
                Ok(Outcome::Skipped) => SkipReason::NotRunnable,
                Ok(Outcome::NotValid) => SkipReason::NotValid,
                Err(source) => {
                    return Err(self.fail(pipeline, ctx, run_id, index, source, &applied).await);
                }
            };

            debug!(run = %run_id, step = %name, ?reason, "Step skipped");
            report.skipped.push(name.clone());
            let _ = self.event_sender.send(WorkflowEvent::StepSkipped {
                run_id,
                index,
                step: name,
                reason,
            });
        }

        let completed = self
            .record(ctx, |m| {
                m.status = MaintenanceStatus::Success;
                m.current_step = Some(pipeline.len());
                m.finished_at = Some(Utc::now());
            })
            .await;
        if let Err(e) = completed {
            // Blamed on the last step; an empty pipeline has nothing to undo
            let Some(last) = pipeline.len().checked_sub(1) else {
                return Err(e.into());
            };
            return Err(self.fail(pipeline, ctx, run_id, last, e.into(), &applied).await);
        }

        let _ = self.event_sender.send(WorkflowEvent::Completed { run_id, success: true });
        info!(run = %run_id, applied = report.applied.len(), "Pipeline completed");

        Ok(report)
    }

    /// Compensate, record the failure and build the error to return
    ///
    /// Recording the failure is best effort: the store may be what failed.
    async fn fail(
        &self,
        pipeline: &Pipeline,
        ctx: &StepContext,
        run_id: Uuid,
        index: usize,
        source: StepError,
        applied: &[usize],
    ) -> WorkflowError {
        let step = pipeline.steps()[index].name().to_string();
        error!(
            run = %run_id,
            step = %step,
            kind = %source.kind(),
            error = %source,
            "Step failed"
        );
        let _ = self.event_sender.send(WorkflowEvent::StepFailed {
            run_id,
            index,
            step: step.clone(),
            kind: source.kind(),
            message: source.to_string(),
        });

        let compensation = self.compensate(pipeline, ctx, run_id, applied).await;

        let recorded = self
            .record(ctx, |m| {
                m.status = MaintenanceStatus::Error;
                m.current_step = Some(index);
                m.finished_at = Some(Utc::now());
            })
            .await;
        if let Err(e) = recorded {
            error!(run = %run_id, error = %e, "Could not record pipeline failure");
        }

        let _ = self.event_sender.send(WorkflowEvent::Completed { run_id, success: false });

        WorkflowError::StepFailed {
            step,
            index,
            source,
            compensation,
        }
    }

    /// Undo `applied` in reverse order
    async fn compensate(&self, pipeline: &Pipeline, ctx: &StepContext, run_id: Uuid, applied: &[usize]) -> Compensation {
        let mut compensation = Compensation::default();

        for &index in applied.iter().rev() {
            let step = &pipeline.steps()[index];
            let name = step.name().to_string();
            let _ = self.event_sender.send(WorkflowEvent::Compensating {
                run_id,
                index,
                step: name.clone(),
            });

            match run_undo(step.as_ref(), ctx).await {
                Ok(_) => {
                    debug!(run = %run_id, step = %name, "Step compensated");
                    compensation.reverted.push(name);
                }
                Err(StepError::Irreversible(reason)) => {
                    warn!(run = %run_id, step = %name, %reason, "Compensation halted");
                    let _ = self.event_sender.send(WorkflowEvent::CompensationHalted {
                        run_id,
                        index,
                        step: name.clone(),
                    });
                    compensation.halted_at = Some(name);
                    break;
                }
                Err(e) => {
                    error!(run = %run_id, step = %name, error = %e, "Compensation failed");
                    let _ = self.event_sender.send(WorkflowEvent::CompensationFailed {
                        run_id,
                        index,
                        step: name.clone(),
                        message: e.to_string(),
                    });
                    compensation.failed.push((name, e.to_string()));
                }
            }
        }

        compensation
    }

    /// Apply `update` to the bound maintenance, if any
    async fn record<F>(&self, ctx: &StepContext, update: F) -> std::result::Result<(), StoreError>
    where
        F: FnOnce(&mut Maintenance),
    {
        let Some(id) = ctx.maintenance_id else {
            return Ok(());
        };
        let mut maintenance = ctx.store().get_maintenance(id).await?;
        update(&mut maintenance);
        ctx.store().put_maintenance(&maintenance).await?;
        Ok(())
    }
}
