//! Snapshot lifecycle
//!
//! ```text
//!   pending ──provider accepted──▶ success
//!      │             └─warning──▶ warning
//!      └──provider rejected────▶ error
//! ```
//!
//! Records are written before the provider is called so a crash between
//! the two leaves a pending row to reconcile against.

use crate::error::{Result, VolumeError};
use crate::manager::InfraScope;
use crate::poll::{poll_until, PollPolicy};
use crate::provider::{ProviderFactory, SnapshotReply, TakenSnapshot, VolumeProvider};
use chrono::Utc;
use dbaas_common::{Id, Instance, Snapshot, SnapshotStatus, Store, Volume};
use std::sync::Arc;
use tracing::{info, warn};

/// Provider endpoint used to take a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotBackend {
    /// `snapshot/{volume}`
    #[default]
    Legacy,
    /// `gcp/snapshot/{volume}`
    Gcp,
}

/// Creates, classifies, polls and purges snapshots
#[derive(Clone)]
pub struct SnapshotManager {
    store: Arc<dyn Store>,
    providers: Arc<dyn ProviderFactory>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager").finish_non_exhaustive()
    }
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn Store>, providers: Arc<dyn ProviderFactory>) -> Self {
        Self { store, providers }
    }

    fn provider_in(&self, scope: &InfraScope, environment: &str) -> Result<Arc<dyn VolumeProvider>> {
        Ok(self.providers.provider(environment, &scope.namespace)?)
    }

    /// Back up `volume` on behalf of `instance`
    ///
    /// `persist` asks the provider to keep the snapshot out of its own
    /// retention cleanup.
    ///
    /// Always returns the persisted record; a provider rejection is recorded
    /// as an `error` snapshot carrying the rejection text. Use [`check`] to
    /// turn a non-success outcome into an error.
    ///
    /// [`check`]: SnapshotManager::check
    pub async fn make_backup(
        &self,
        scope: &InfraScope,
        instance: &Instance,
        volume: &Volume,
        group_id: Id,
        backend: SnapshotBackend,
        persist: bool,
    ) -> Result<Snapshot> {
        let mut snapshot = self
            .store
            .create_snapshot(Snapshot::pending(
                instance.id,
                group_id,
                Some(volume.id),
                scope.environment.clone(),
            ))
            .await?;

        info!(
            instance = %instance,
            volume = %volume.identifier,
            environment = %scope.environment,
            snapshot = snapshot.id,
            "Taking snapshot"
        );

        let provider = self.provider_in(scope, &scope.environment)?;
        let outcome = match backend {
            SnapshotBackend::Legacy => provider
                .take_snapshot(&volume.identifier, &scope.labels, persist)
                .await
                .map_err(|e| e.to_string()),
            SnapshotBackend::Gcp => match provider
                .new_take_snapshot(&volume.identifier, &scope.labels, persist)
                .await
            {
                Ok(SnapshotReply::Accepted(taken)) => Ok(taken),
                Ok(SnapshotReply::Rejected { status, body }) => {
                    Err(format!("status {}: {}", status, body))
                }
                Err(e) => Err(e.to_string()),
            },
        };

        match outcome {
            Ok(taken) => Self::accept(&mut snapshot, taken),
            Err(reason) => {
                warn!(
                    instance = %instance,
                    volume = %volume.identifier,
                    snapshot = snapshot.id,
                    error = %reason,
                    "Snapshot rejected by provider"
                );
                snapshot.status = SnapshotStatus::Error;
                snapshot.error = Some(reason);
            }
        }

        self.store.put_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    fn accept(snapshot: &mut Snapshot, taken: TakenSnapshot) {
        info!(
            snapshot = snapshot.id,
            identifier = %taken.identifier,
            "Snapshot accepted"
        );
        snapshot.snapshot_id = Some(taken.identifier);
        snapshot.size_bytes = taken.size;
        snapshot.volume_path = taken.description;
        snapshot.end_at = Some(Utc::now());
        match taken.warning {
            Some(warning) => {
                snapshot.status = SnapshotStatus::Warning;
                snapshot.error = Some(warning);
            }
            None => snapshot.status = SnapshotStatus::Success,
        }
    }

    /// Fail unless the snapshot finished cleanly
    pub fn check(snapshot: &Snapshot) -> Result<()> {
        if snapshot.has_warning() {
            return Err(VolumeError::SnapshotWarning(snapshot.to_string()));
        }
        if snapshot.was_error() {
            let mut message = "Backup was unsuccessful.".to_string();
            if let Some(error) = &snapshot.error {
                message.push_str(&format!(" Error: {}", error));
            }
            return Err(VolumeError::SnapshotFailed(message));
        }
        Ok(())
    }

    /// Delete a snapshot in its own environment; marks the record purged
    /// when the provider confirms
    pub async fn remove(&self, scope: &InfraScope, snapshot: &Snapshot, force: bool) -> Result<bool> {
        let identifier = snapshot.provider_id()?;
        let provider = self.provider_in(scope, &snapshot.environment)?;

        info!(
            snapshot = snapshot.id,
            identifier,
            environment = %snapshot.environment,
            force,
            "Removing snapshot"
        );
        let removed = provider.delete_snapshot(identifier, force).await?;
        if removed {
            let mut purged = snapshot.clone();
            purged.purge_at = Some(Utc::now());
            self.store.put_snapshot(&purged).await?;
        } else {
            warn!(snapshot = snapshot.id, identifier, "Provider kept snapshot");
        }
        Ok(removed)
    }

    /// Provider-side state string (e.g. `READY`)
    pub async fn state(&self, scope: &InfraScope, snapshot: &Snapshot) -> Result<String> {
        let identifier = snapshot.provider_id()?;
        let provider = self.provider_in(scope, &snapshot.environment)?;
        Ok(provider.snapshot_state(identifier).await?.snapshot_status)
    }

    /// Poll until the provider reports `expected`
    pub async fn wait_state(
        &self,
        scope: &InfraScope,
        snapshot: &Snapshot,
        expected: &str,
        policy: &PollPolicy,
    ) -> Result<()> {
        let what = format!("{} state {}", snapshot, expected);
        poll_until(policy, &what, |attempt| async move {
            let state = self.state(scope, snapshot).await?;
            info!(
                snapshot = snapshot.id,
                state = %state,
                expected,
                attempt,
                "Snapshot state"
            );
            Ok::<_, VolumeError>((state == expected).then_some(()))
        })
        .await
    }
}
