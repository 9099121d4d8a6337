use std::sync::Arc;

use tracing::{debug, info, warn};
use truenas_client::Appliance;
use truenas_client::types::{
    CreateDatasetParams, CreateIscsiExtentParams, CreateIscsiInitiatorParams,
    CreateIscsiTargetExtentParams, CreateIscsiTargetParams, DatasetType, TargetGroup,
};

use super::rollback::{UndoAction, UndoStack};
use super::{ProvisionedVolume, VolumeRequest, check_create_request};
use crate::catalog::{ObjectKind, find_first};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::inventory::{self, VolumeEntry, zvol_path};
use crate::types::{BackendKind, IscsiVolumeContext};

const VOLUME_BLOCK_SIZE: &str = "16K";
const EXTENT_BLOCK_SIZE: i32 = 512;
const LUN_ID: i64 = 0;

/// Names shared by every step of one create call.
struct ChainPlan {
    volume_id: String,
    dataset_name: String,
    extent_path: String,
    size: i64,
}

/// Zvol exported as dataset → extent → initiator → target → mapping.
pub struct IscsiProvisioner {
    appliance: Arc<dyn Appliance>,
    config: Arc<DriverConfig>,
}

impl IscsiProvisioner {
    pub fn new(appliance: Arc<dyn Appliance>, config: Arc<DriverConfig>) -> Self {
        Self { appliance, config }
    }

    pub(super) fn appliance(&self) -> &dyn Appliance {
        self.appliance.as_ref()
    }

    pub(super) fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub async fn create_volume(&self, request: &VolumeRequest) -> Result<ProvisionedVolume> {
        let size = check_create_request(BackendKind::Iscsi, request)?;
        let volume_id = BackendKind::Iscsi.volume_id(&request.name);

        let global = self
            .appliance
            .get_iscsi_global_config()
            .await
            .map_err(|e| DriverError::remote("get", ObjectKind::GlobalConfig, "global", e))?;
        let target_portal = self.portal_address().await?;

        let dataset_name = self.config.dataset_name(&volume_id);
        let plan = ChainPlan {
            extent_path: zvol_path(&dataset_name),
            dataset_name,
            volume_id,
            size,
        };

        debug!(
            volume_id = %plan.volume_id,
            dataset = %plan.dataset_name,
            size_bytes = size,
            "Creating iSCSI volume"
        );

        let mut undo = UndoStack::new();
        if let Err(e) = self.build_chain(&plan, &mut undo).await {
            undo.unwind(self.appliance.as_ref(), &plan.volume_id).await;
            return Err(e);
        }

        let context = IscsiVolumeContext {
            target_portal,
            iqn: format!("{}:{}", global.basename, plan.volume_id),
            lun: LUN_ID.to_string(),
            portals: vec![],
        };

        info!(volume_id = %plan.volume_id, iqn = %context.iqn, "iSCSI volume ready");

        Ok(ProvisionedVolume {
            volume_id: plan.volume_id,
            capacity_bytes: size,
            context: context.to_map(),
        })
    }

    /// Listen address of the configured portal. The first one wins when the
    /// portal listens on several.
    async fn portal_address(&self) -> Result<String> {
        let portal_id = self.config.portal_id;
        let portal = self
            .appliance
            .get_iscsi_portal(portal_id)
            .await
            .map_err(|e| DriverError::remote("get", ObjectKind::Portal, portal_id.to_string(), e))?;

        let Some(first) = portal.listen.first() else {
            return Err(DriverError::Internal(format!(
                "iSCSI portal {} has no listen addresses",
                portal_id
            )));
        };
        if portal.listen.len() > 1 {
            warn!(
                portal_id = portal_id,
                listen = portal.listen.len(),
                "Portal has more than one listen address, using the first"
            );
        }
        Ok(first.address())
    }

    /// Find or create each link. Every object the chain ends up depending on
    /// is pushed to `undo`, reused or not.
    async fn build_chain(&self, plan: &ChainPlan, undo: &mut UndoStack) -> Result<()> {
        let appliance = self.appliance.as_ref();
        let volume_id = plan.volume_id.as_str();

        // Dataset
        let dataset = find_first(
            ObjectKind::Dataset,
            &plan.dataset_name,
            appliance.list_datasets(),
            |d| d.name == plan.dataset_name && d.kind == DatasetType::Volume,
        )
        .await?;
        let dataset_id = match dataset {
            Some(d) => {
                debug!(dataset = %plan.dataset_name, "Dataset exists, reusing");
                d.id
            }
            None => {
                let params = CreateDatasetParams {
                    name: plan.dataset_name.clone(),
                    kind: Some(DatasetType::Volume),
                    volsize: Some(plan.size),
                    volblocksize: Some(VOLUME_BLOCK_SIZE.to_string()),
                    ..Default::default()
                };
                let d = appliance.create_dataset(&params).await.map_err(|e| {
                    DriverError::remote("create", ObjectKind::Dataset, &plan.dataset_name, e)
                })?;
                info!(dataset = %d.id, "Created zvol");
                d.id
            }
        };
        undo.push(UndoAction::Dataset(dataset_id));

        // Extent
        let extent = find_first(
            ObjectKind::Extent,
            &plan.extent_path,
            appliance.list_iscsi_extents(),
            |e| e.path == plan.extent_path,
        )
        .await?;
        let extent_id = match extent {
            Some(e) => {
                debug!(extent_id = e.id, "Extent exists, reusing");
                e.id
            }
            None => {
                let params = CreateIscsiExtentParams {
                    name: volume_id.to_string(),
                    kind: "DISK".to_string(),
                    disk: plan.extent_path.clone(),
                    rpm: "SSD".to_string(),
                    insecure_tpc: true,
                    xen: false,
                    comment: format!("{}: Kubernetes managed iSCSI extent", volume_id),
                    blocksize: EXTENT_BLOCK_SIZE,
                };
                let e = appliance.create_iscsi_extent(&params).await.map_err(|e| {
                    DriverError::remote("create", ObjectKind::Extent, &plan.extent_path, e)
                })?;
                info!(extent_id = e.id, path = %plan.extent_path, "Created extent");
                e.id
            }
        };
        undo.push(UndoAction::Extent(extent_id));

        // Initiator, matched by the volume ID its comment starts with
        let initiator = find_first(
            ObjectKind::Initiator,
            volume_id,
            appliance.list_iscsi_initiators(),
            |i| initiator_belongs_to(&i.comment, volume_id),
        )
        .await?;
        let initiator_id = match initiator {
            Some(i) => {
                debug!(initiator_id = i.id, "Initiator exists, reusing");
                i.id
            }
            None => {
                let params = CreateIscsiInitiatorParams {
                    comment: format!("{}: Kubernetes managed iSCSI initiator", volume_id),
                };
                let i = appliance
                    .create_iscsi_initiator(&params)
                    .await
                    .map_err(|e| DriverError::remote("create", ObjectKind::Initiator, volume_id, e))?;
                info!(initiator_id = i.id, "Created initiator");
                i.id
            }
        };
        undo.push(UndoAction::Initiator(initiator_id));

        // Target
        let target = find_first(
            ObjectKind::Target,
            volume_id,
            appliance.list_iscsi_targets(),
            |t| t.name == volume_id,
        )
        .await?;
        let target_id = match target {
            Some(t) => {
                debug!(target_id = t.id, "Target exists, reusing");
                t.id
            }
            None => {
                let params = CreateIscsiTargetParams {
                    name: volume_id.to_string(),
                    alias: Some(format!("{}: Kubernetes managed iSCSI target", volume_id)),
                    mode: "ISCSI".to_string(),
                    groups: vec![TargetGroup {
                        portal: self.config.portal_id,
                        initiator: Some(initiator_id),
                        authmethod: "NONE".to_string(),
                    }],
                };
                let t = appliance
                    .create_iscsi_target(&params)
                    .await
                    .map_err(|e| DriverError::remote("create", ObjectKind::Target, volume_id, e))?;
                info!(target_id = t.id, "Created target");
                t.id
            }
        };
        undo.push(UndoAction::Target(target_id));

        // Target-extent mapping
        let mapping_key = format!("target {} / extent {}", target_id, extent_id);
        let mapping = find_first(
            ObjectKind::TargetExtent,
            &mapping_key,
            appliance.list_iscsi_target_extents(),
            |m| m.target == target_id && m.extent == extent_id,
        )
        .await?;
        if mapping.is_none() {
            let params = CreateIscsiTargetExtentParams {
                target: target_id,
                extent: extent_id,
                lunid: Some(LUN_ID),
            };
            let m = appliance
                .create_iscsi_target_extent(&params)
                .await
                .map_err(|e| DriverError::remote("create", ObjectKind::TargetExtent, &mapping_key, e))?;
            info!(
                mapping_id = m.id,
                target_id = target_id,
                extent_id = extent_id,
                "Created target-extent mapping"
            );
        }

        Ok(())
    }

    /// Remove target, then dataset, then initiator. Missing objects are skipped.
    ///
    /// The extent record is left in place; it is reused by path if the
    /// volume is ever created again.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let appliance = self.appliance.as_ref();

        // The dataset cannot be deleted while a target still references it
        let target = find_first(
            ObjectKind::Target,
            volume_id,
            appliance.list_iscsi_targets(),
            |t| t.name == volume_id,
        )
        .await?;
        if let Some(target) = target {
            appliance
                .delete_iscsi_target(target.id)
                .await
                .map_err(|e| DriverError::remote("delete", ObjectKind::Target, volume_id, e))?;
            info!(volume_id = %volume_id, target_id = target.id, "Deleted target");
        }

        let dataset_name = self.config.dataset_name(volume_id);
        let dataset = find_first(
            ObjectKind::Dataset,
            &dataset_name,
            appliance.list_datasets(),
            |d| d.name == dataset_name,
        )
        .await?;
        if let Some(dataset) = dataset {
            appliance
                .delete_dataset(&dataset.id)
                .await
                .map_err(|e| DriverError::remote("delete", ObjectKind::Dataset, &dataset.id, e))?;
            info!(volume_id = %volume_id, dataset = %dataset.id, "Deleted zvol");
        }

        let initiator = find_first(
            ObjectKind::Initiator,
            volume_id,
            appliance.list_iscsi_initiators(),
            |i| initiator_belongs_to(&i.comment, volume_id),
        )
        .await?;
        if let Some(initiator) = initiator {
            appliance
                .delete_iscsi_initiator(initiator.id)
                .await
                .map_err(|e| DriverError::remote("delete", ObjectKind::Initiator, volume_id, e))?;
            info!(volume_id = %volume_id, initiator_id = initiator.id, "Deleted initiator");
        }

        Ok(())
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeEntry>> {
        let appliance = self.appliance.as_ref();
        let storage_path = &self.config.iscsi_storage_path;

        let datasets = appliance
            .list_datasets()
            .await
            .map_err(|e| DriverError::remote("list", ObjectKind::Dataset, storage_path, e))?;
        let extents = appliance
            .list_iscsi_extents()
            .await
            .map_err(|e| DriverError::remote("list", ObjectKind::Extent, storage_path, e))?;
        let mappings = appliance
            .list_iscsi_target_extents()
            .await
            .map_err(|e| DriverError::remote("list", ObjectKind::TargetExtent, storage_path, e))?;
        let targets = appliance
            .list_iscsi_targets()
            .await
            .map_err(|e| DriverError::remote("list", ObjectKind::Target, storage_path, e))?;

        inventory::join_iscsi(storage_path, &datasets, &extents, &mappings, &targets)
    }
}

/// Initiator comments are written as `<volume id>: ...`.
///
/// Requiring the separator keeps `iscsi-pv1` from claiming `iscsi-pv10`'s
/// initiator.
fn initiator_belongs_to(comment: &str, volume_id: &str) -> bool {
    comment
        .strip_prefix(volume_id)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
}
