//! Maintenance retry
//!
//! A failed maintenance can be retried as a new record that resumes the
//! pipeline at the step the failed run stopped at.

use crate::error::{Result, WorkflowError};
use dbaas_common::{Id, Maintenance, MaintenanceStatus, Store};
use tracing::info;

/// Human form of a maintenance kind: `recreate_slave` → `recreate slave`
pub fn kind_label(kind: &str) -> String {
    kind.replace(['_', '-'], " ")
}

fn capitalized(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Reasons `maintenance` may not be retried, empty when it may
pub fn retry_blockers(maintenance: &Maintenance) -> Vec<String> {
    let label = kind_label(&maintenance.kind);
    let mut blockers = Vec::new();
    if !maintenance.is_status_error() {
        blockers.push(format!(
            "You can not do retry because {} status is '{}'",
            label, maintenance.status
        ));
    }
    if !maintenance.can_do_retry {
        blockers.push(format!("{} retry is disabled", capitalized(&label)));
    }
    blockers
}

/// Reject a retry of anything but an errored, retryable maintenance
pub fn check_retry(maintenance: &Maintenance) -> Result<()> {
    let blockers = retry_blockers(maintenance);
    if blockers.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::Precondition(blockers.join("\n")))
    }
}

/// Create the record retrying maintenance `id`
///
/// The new record starts where the failed one stopped; the failed one can
/// not be retried again.
pub async fn prepare_retry(store: &dyn Store, id: Id, new_id: Id) -> Result<Maintenance> {
    let mut failed = store.get_maintenance(id).await?;
    check_retry(&failed)?;

    let retry = Maintenance {
        id: new_id,
        status: MaintenanceStatus::Waiting,
        can_do_retry: true,
        current_step: failed.current_step,
        retry_of: Some(failed.id),
        started_at: None,
        finished_at: None,
        ..failed.clone()
    };
    store.put_maintenance(&retry).await?;

    failed.can_do_retry = false;
    store.put_maintenance(&failed).await?;

    info!(
        maintenance = failed.id,
        retry = retry.id,
        kind = %failed.kind,
        from_step = ?retry.current_step,
        "Retrying maintenance"
    );
    Ok(retry)
}
