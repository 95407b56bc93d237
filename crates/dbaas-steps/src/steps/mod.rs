//! Step catalog
//!
//! Each module defines a handful of parameterized step types plus one
//! constructor function per named variant. Pipelines are assembled from the
//! constructors; the types themselves never know which operation they are
//! part of.

pub mod access;
pub mod copy;
pub mod mysql;
pub mod plan;
pub mod snapshot;
pub mod volume;

use crate::gating::Gate;

/// Name, progress line and gates shared by every catalog step
#[derive(Debug, Clone)]
pub struct Meta {
    pub name: &'static str,
    pub description: &'static str,
    /// `is_valid`
    pub gate: Gate,
    /// `can_run`
    pub run_if: Gate,
}

impl Meta {
    pub fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            gate: Gate::always(),
            run_if: Gate::always(),
        }
    }

    pub fn gate(mut self, gate: impl Into<Gate>) -> Self {
        self.gate = gate.into();
        self
    }

    pub fn run_if(mut self, gate: impl Into<Gate>) -> Self {
        self.run_if = gate.into();
        self
    }
}

/// `Gated` and `Step` for a type holding a `meta: Meta` field
macro_rules! catalog_step {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl $crate::traits::Gated for $ty {
            async fn can_run(&self, ctx: &$crate::context::StepContext) -> $crate::error::Result<bool> {
                self.meta.run_if.allows(ctx).await
            }

            async fn is_valid(&self, ctx: &$crate::context::StepContext) -> $crate::error::Result<bool> {
                self.meta.gate.allows(ctx).await
            }
        }

        impl $crate::traits::Step for $ty {
            fn name(&self) -> &str {
                self.meta.name
            }

            fn description(&self) -> String {
                self.meta.description.to_string()
            }
        }
    };
}

pub(crate) use catalog_step;
