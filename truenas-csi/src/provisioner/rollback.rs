//! Undo log for partially built iSCSI object chains.

use tracing::{error, info};
use truenas_client::Appliance;

use crate::catalog::ObjectKind;
use crate::metrics;

/// One appliance object to remove if creation fails later on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    Dataset(String),
    Extent(i64),
    Initiator(i64),
    Target(i64),
}

impl UndoAction {
    fn kind(&self) -> ObjectKind {
        match self {
            UndoAction::Dataset(_) => ObjectKind::Dataset,
            UndoAction::Extent(_) => ObjectKind::Extent,
            UndoAction::Initiator(_) => ObjectKind::Initiator,
            UndoAction::Target(_) => ObjectKind::Target,
        }
    }

    fn key(&self) -> String {
        match self {
            UndoAction::Dataset(name) => name.clone(),
            UndoAction::Extent(id) | UndoAction::Initiator(id) | UndoAction::Target(id) => {
                id.to_string()
            }
        }
    }

    async fn run(&self, appliance: &dyn Appliance) -> truenas_client::Result<()> {
        match self {
            UndoAction::Dataset(name) => appliance.delete_dataset(name).await,
            UndoAction::Extent(id) => appliance.delete_iscsi_extent(*id).await,
            UndoAction::Initiator(id) => appliance.delete_iscsi_initiator(*id).await,
            UndoAction::Target(id) => appliance.delete_iscsi_target(*id).await,
        }
    }
}

/// Objects pushed in creation order, removed in reverse.
///
/// Objects are pushed as dataset, extent, initiator, target, so unwinding
/// always deletes the target before the dataset it references.
#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// Run every action, newest first. Failures are logged and skipped so the
    /// caller can still report the error that triggered the rollback.
    pub async fn unwind(self, appliance: &dyn Appliance, volume_id: &str) {
        if self.actions.is_empty() {
            return;
        }
        info!(volume_id = %volume_id, actions = self.actions.len(), "Rolling back partially created volume");

        for action in self.actions.into_iter().rev() {
            let kind = action.kind();
            match action.run(appliance).await {
                Ok(()) => {
                    info!(volume_id = %volume_id, object = %kind, key = %action.key(), "Rolled back");
                    metrics::record_rollback(&kind.to_string(), true);
                }
                Err(e) => {
                    error!(
                        volume_id = %volume_id,
                        object = %kind,
                        key = %action.key(),
                        error = %e,
                        "Rollback step failed"
                    );
                    metrics::record_rollback(&kind.to_string(), false);
                }
            }
        }
    }
}
