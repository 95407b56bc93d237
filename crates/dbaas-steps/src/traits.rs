//! Step capability traits
//!
//! A step is split along what it can do:
//!
//! - [`Gated`]: whether the step applies to the current context at all
//! - [`Doable`]: the forward effect
//! - [`Undoable`]: the compensating effect, or an explicit irreversible
//!   marker
//!
//! [`Step`] ties them together and adds a name. Steps whose undo is the
//! forward effect of another step (mount/umount, attach/detach, grant/
//! revoke) implement [`Symmetric`] once and pick a [`Direction`] at
//! construction.

use crate::context::StepContext;
use crate::error::{Result, StepError};
use async_trait::async_trait;

/// Applicability predicates, evaluated before any effect
#[async_trait]
pub trait Gated: Send + Sync {
    /// Whether running the step is meaningful at all; `false` skips it
    async fn can_run(&self, ctx: &StepContext) -> Result<bool> {
        let _ = ctx;
        Ok(true)
    }

    /// Whether `apply`/`revert` may have any effect on this instance
    async fn is_valid(&self, ctx: &StepContext) -> Result<bool> {
        let _ = ctx;
        Ok(true)
    }
}

/// Forward effect of a step
#[async_trait]
pub trait Doable: Gated {
    async fn apply(&self, ctx: &StepContext) -> Result<()>;
}

/// Whether a step can be compensated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reversibility {
    Reversible,
    /// Undo must not be attempted; the message explains why
    Irreversible(&'static str),
}

/// Compensating effect of a step
#[async_trait]
pub trait Undoable: Gated {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn reversibility(&self) -> Reversibility {
        Reversibility::Reversible
    }
}

/// A named, gated, compensable unit of work
pub trait Step: Doable + Undoable {
    fn name(&self) -> &str;

    /// Human-readable progress line
    fn description(&self) -> String {
        self.name().to_string()
    }
}

/// Orientation of a symmetric step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// What undo does for a symmetric step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndoMode {
    /// Run the opposite direction
    #[default]
    Inverse,
    /// Nothing to compensate
    Skip,
}

/// A step whose undo is its own opposite
///
/// `forward` and `backward` are the two named effects; the direction picks
/// which one `apply` runs and `revert` runs the other unless the undo mode
/// is [`UndoMode::Skip`].
#[async_trait]
pub trait Symmetric: Gated {
    fn direction(&self) -> Direction;

    fn undo_mode(&self) -> UndoMode {
        UndoMode::Inverse
    }

    async fn forward(&self, ctx: &StepContext) -> Result<()>;

    async fn backward(&self, ctx: &StepContext) -> Result<()>;

    async fn run(&self, direction: Direction, ctx: &StepContext) -> Result<()> {
        match direction {
            Direction::Forward => self.forward(ctx).await,
            Direction::Reverse => self.backward(ctx).await,
        }
    }
}

#[async_trait]
impl<T: Symmetric> Doable for T {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        self.run(self.direction(), ctx).await
    }
}

#[async_trait]
impl<T: Symmetric> Undoable for T {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        match self.undo_mode() {
            UndoMode::Inverse => self.run(self.direction().flip(), ctx).await,
            UndoMode::Skip => Ok(()),
        }
    }
}

/// Outcome of a gated step call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// `can_run` said no
    Skipped,
    /// `is_valid` said no; nothing was called
    NotValid,
}

/// Run a step's forward effect behind its gates
pub async fn run_do(step: &dyn Step, ctx: &StepContext) -> Result<Outcome> {
    if !step.can_run(ctx).await? {
        return Ok(Outcome::Skipped);
    }
    if !step.is_valid(ctx).await? {
        return Ok(Outcome::NotValid);
    }
    step.apply(ctx).await?;
    Ok(Outcome::Applied)
}

/// Run a step's compensation behind its validity gate
///
/// Irreversible steps fail with [`StepError::Irreversible`] without being
/// called.
pub async fn run_undo(step: &dyn Step, ctx: &StepContext) -> Result<Outcome> {
    if !step.is_valid(ctx).await? {
        return Ok(Outcome::NotValid);
    }
    if let Reversibility::Irreversible(reason) = step.reversibility() {
        return Err(StepError::Irreversible(reason.to_string()));
    }
    step.revert(ctx).await?;
    Ok(Outcome::Applied)
}
