//! Role-based validity gating
//!
//! A [`Gate`] is a conjunction of [`Role`] predicates over the context.
//! Steps carry one for `is_valid` and optionally one for `can_run`; the
//! [`first_node`] / [`last_node`] wrappers restrict any step to one end of
//! the topology.

use crate::context::StepContext;
use crate::error::Result;
use crate::traits::{Doable, Gated, Reversibility, Step, Undoable};
use async_trait::async_trait;

/// One context predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Instance serves data
    Database,
    Sentinel,
    Temporary,
    NotTemporary,
    /// Instance is a master of the bound restore
    RestoreMaster,
    FirstInstance,
    LastInstance,
    /// Host runs OL6
    Ol6,
    /// The infra's environment migrates with a new disk
    NewDiskMigration,
    NotNewDiskMigration,
    /// The host's most recent volume exists and is inactive
    LatestVolumeInactive,
    /// The current host migration belongs to a database migration
    DatabaseMigration,
    /// A disk type upgrade is bound and the instance has a snapshot to
    /// build the new disk from
    DiskUpgradeReady,
}

impl Role {
    async fn holds(self, ctx: &StepContext) -> Result<bool> {
        Ok(match self {
            Role::Database => ctx.instance.is_database,
            Role::Sentinel => ctx.instance.is_sentinel,
            Role::Temporary => ctx.instance.temporary,
            Role::NotTemporary => !ctx.instance.temporary,
            Role::RestoreMaster => ctx
                .restore
                .as_ref()
                .is_some_and(|r| r.is_master(ctx.instance.id)),
            Role::FirstInstance => ctx.is_first().await?,
            Role::LastInstance => ctx.is_last().await?,
            Role::Ol6 => ctx.host.is_ol6(),
            Role::NewDiskMigration => new_disk_migration(ctx).await?,
            Role::NotNewDiskMigration => !new_disk_migration(ctx).await?,
            Role::LatestVolumeInactive => ctx
                .store()
                .latest_volume(ctx.host.id)
                .await?
                .is_some_and(|v| !v.is_active),
            Role::DatabaseMigration => ctx.database_migrate().await?.is_some(),
            Role::DiskUpgradeReady => {
                ctx.disk_upgrade.is_some()
                    && !ctx
                        .store()
                        .instance_snapshots(ctx.instance.id)
                        .await?
                        .is_empty()
            }
        })
    }
}

async fn new_disk_migration(ctx: &StepContext) -> Result<bool> {
    let provider = ctx.provider_in(&ctx.infra.environment)?;
    Ok(provider.should_migrate_with_new_disk().await?)
}

/// Conjunction of roles; the empty gate always passes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gate(Vec<Role>);

impl Gate {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn only(role: Role) -> Self {
        Self(vec![role])
    }

    pub fn and(mut self, role: Role) -> Self {
        self.0.push(role);
        self
    }

    pub fn roles(&self) -> &[Role] {
        &self.0
    }

    /// Short-circuits on the first role that does not hold
    pub async fn allows(&self, ctx: &StepContext) -> Result<bool> {
        for role in &self.0 {
            if !role.holds(ctx).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl From<Role> for Gate {
    fn from(role: Role) -> Self {
        Gate::only(role)
    }
}

/// End of the topology a wrapper is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    First,
    Last,
}

/// Delegates to `inner` only on one end of the topology
pub struct Pinned {
    node: Node,
    name: String,
    inner: Box<dyn Step>,
}

impl Pinned {
    pub fn new(node: Node, inner: Box<dyn Step>) -> Self {
        let prefix = match node {
            Node::First => "first_node",
            Node::Last => "last_node",
        };
        Self {
            node,
            name: format!("{}::{}", prefix, inner.name()),
            inner,
        }
    }

    async fn on_node(&self, ctx: &StepContext) -> Result<bool> {
        match self.node {
            Node::First => ctx.is_first().await,
            Node::Last => ctx.is_last().await,
        }
    }
}

/// Run `inner` on the first instance of the topology only
pub fn first_node(inner: impl Step + 'static) -> Pinned {
    Pinned::new(Node::First, Box::new(inner))
}

/// Run `inner` on the last instance of the topology only
pub fn last_node(inner: impl Step + 'static) -> Pinned {
    Pinned::new(Node::Last, Box::new(inner))
}

#[async_trait]
impl Gated for Pinned {
    async fn can_run(&self, ctx: &StepContext) -> Result<bool> {
        self.inner.can_run(ctx).await
    }

    async fn is_valid(&self, ctx: &StepContext) -> Result<bool> {
        Ok(self.on_node(ctx).await? && self.inner.is_valid(ctx).await?)
    }
}

#[async_trait]
impl Doable for Pinned {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        self.inner.apply(ctx).await
    }
}

#[async_trait]
impl Undoable for Pinned {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        self.inner.revert(ctx).await
    }

    fn reversibility(&self) -> Reversibility {
        self.inner.reversibility()
    }
}

impl Step for Pinned {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.inner.description()
    }
}
