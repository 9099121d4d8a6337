use std::path::PathBuf;

use crate::types::BackendKind;

/// Immutable driver settings, built once at startup.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub kind: BackendKind,
    /// Parent dataset for NFS volumes, e.g. `tank/k8s/nfs`
    pub nfs_storage_path: String,
    /// Parent dataset for iSCSI zvols, e.g. `tank/k8s/iscsi`
    pub iscsi_storage_path: String,
    /// Appliance portal id every target is bound to
    pub portal_id: i64,
    /// Host written into NFS volume contexts
    pub nfs_host: String,
    /// Where the node plugin keeps iSCSI connector files
    pub iscsi_config_dir: PathBuf,
    pub node_id: String,
}

impl DriverConfig {
    /// Parent dataset for the configured backend.
    pub fn storage_path(&self) -> &str {
        match self.kind {
            BackendKind::Nfs => &self.nfs_storage_path,
            BackendKind::Iscsi => &self.iscsi_storage_path,
        }
    }

    /// Full dataset name backing `volume_id`.
    pub fn dataset_name(&self, volume_id: &str) -> String {
        format!("{}/{}", self.storage_path(), volume_id)
    }
}
