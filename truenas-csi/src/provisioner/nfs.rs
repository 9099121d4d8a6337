use std::sync::Arc;

use tracing::{debug, info};
use truenas_client::Appliance;
use truenas_client::types::{CreateDatasetParams, CreateNfsShareParams, DatasetType};

use super::{ProvisionedVolume, VolumeRequest, check_create_request};
use crate::catalog::{ObjectKind, find_first};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::inventory::{self, VolumeEntry};
use crate::types::{BackendKind, NfsVolumeContext};

/// Filesystem dataset with a refquota, exported through one NFS share.
pub struct NfsProvisioner {
    appliance: Arc<dyn Appliance>,
    config: Arc<DriverConfig>,
}

impl NfsProvisioner {
    pub fn new(appliance: Arc<dyn Appliance>, config: Arc<DriverConfig>) -> Self {
        Self { appliance, config }
    }

    pub(super) fn appliance(&self) -> &dyn Appliance {
        self.appliance.as_ref()
    }

    pub(super) fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// No rollback here: a share failure leaves only the dataset, which the
    /// retried call reuses.
    pub async fn create_volume(&self, request: &VolumeRequest) -> Result<ProvisionedVolume> {
        let size = check_create_request(BackendKind::Nfs, request)?;
        let volume_id = BackendKind::Nfs.volume_id(&request.name);
        let dataset_name = self.config.dataset_name(&volume_id);

        debug!(volume_id = %volume_id, dataset = %dataset_name, size_bytes = size, "Creating NFS volume");

        let existing = find_first(
            ObjectKind::Dataset,
            &dataset_name,
            self.appliance.list_datasets(),
            |d| d.name == dataset_name,
        )
        .await?;

        let dataset = match existing {
            Some(dataset) => {
                debug!(dataset = %dataset_name, "Dataset exists, reusing");
                dataset
            }
            None => {
                let params = CreateDatasetParams {
                    name: dataset_name.clone(),
                    kind: Some(DatasetType::Filesystem),
                    refquota: Some(size),
                    casesensitivity: Some("SENSITIVE".to_string()),
                    copies: Some(1),
                    inherit_encryption: Some(true),
                    share_type: Some("GENERIC".to_string()),
                    ..Default::default()
                };
                let dataset = self
                    .appliance
                    .create_dataset(&params)
                    .await
                    .map_err(|e| DriverError::remote("create", ObjectKind::Dataset, &dataset_name, e))?;
                info!(dataset = %dataset_name, "Created dataset");
                dataset
            }
        };

        let mountpoint = dataset
            .mountpoint
            .filter(|mp| !mp.is_empty())
            .ok_or_else(|| {
                DriverError::Internal(format!("dataset '{}' has no mountpoint", dataset_name))
            })?;

        let share = find_first(
            ObjectKind::NfsShare,
            &mountpoint,
            self.appliance.list_nfs_shares(),
            |s| s.paths.len() == 1 && s.paths[0] == mountpoint,
        )
        .await?;

        if share.is_none() {
            let params = CreateNfsShareParams {
                paths: vec![mountpoint.clone()],
                comment: format!("Share for Kubernetes PV {}", request.name),
                enabled: true,
                ro: false,
            };
            let share = self
                .appliance
                .create_nfs_share(&params)
                .await
                .map_err(|e| DriverError::remote("create", ObjectKind::NfsShare, &mountpoint, e))?;
            info!(share_id = share.id, path = %mountpoint, "Created NFS share");
        }

        let context = NfsVolumeContext {
            host: self.config.nfs_host.clone(),
            mount_point: mountpoint,
        };

        Ok(ProvisionedVolume {
            volume_id,
            capacity_bytes: size,
            context: context.to_map(),
        })
    }

    /// The appliance removes the share along with the dataset.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let dataset_name = self.config.dataset_name(volume_id);

        let existing = find_first(
            ObjectKind::Dataset,
            &dataset_name,
            self.appliance.list_datasets(),
            |d| d.name == dataset_name,
        )
        .await?;

        let Some(dataset) = existing else {
            debug!(volume_id = %volume_id, "Dataset already gone");
            return Ok(());
        };

        self.appliance
            .delete_dataset(&dataset.id)
            .await
            .map_err(|e| DriverError::remote("delete", ObjectKind::Dataset, &dataset.id, e))?;
        info!(volume_id = %volume_id, dataset = %dataset.id, "Deleted dataset");
        Ok(())
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeEntry>> {
        let storage_path = &self.config.nfs_storage_path;
        let datasets = self
            .appliance
            .list_datasets()
            .await
            .map_err(|e| DriverError::remote("list", ObjectKind::Dataset, storage_path, e))?;
        let shares = self
            .appliance
            .list_nfs_shares()
            .await
            .map_err(|e| DriverError::remote("list", ObjectKind::NfsShare, storage_path, e))?;

        inventory::join_nfs(storage_path, &datasets, &shares)
    }
}
