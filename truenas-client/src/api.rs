use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CreateDatasetParams, CreateIscsiExtentParams, CreateIscsiInitiatorParams,
    CreateIscsiTargetExtentParams, CreateIscsiTargetParams, CreateNfsShareParams, Dataset,
    IscsiExtent, IscsiGlobalConfig, IscsiInitiator, IscsiPortal, IscsiTarget, IscsiTargetExtent,
    NfsShare,
};

/// Per-object-type operations offered by the storage appliance.
///
/// List calls return the entire collection. The appliance has no server-side
/// filtering, so callers scan the result themselves.
#[async_trait]
pub trait Appliance: Send + Sync {
    async fn list_datasets(&self) -> Result<Vec<Dataset>>;
    async fn get_dataset(&self, id: &str) -> Result<Dataset>;
    async fn create_dataset(&self, params: &CreateDatasetParams) -> Result<Dataset>;
    /// Plain (non-recursive) delete. Fails while an iSCSI target still
    /// references the zvol.
    async fn delete_dataset(&self, id: &str) -> Result<()>;

    async fn list_nfs_shares(&self) -> Result<Vec<NfsShare>>;
    async fn create_nfs_share(&self, params: &CreateNfsShareParams) -> Result<NfsShare>;

    async fn list_iscsi_extents(&self) -> Result<Vec<IscsiExtent>>;
    async fn create_iscsi_extent(&self, params: &CreateIscsiExtentParams) -> Result<IscsiExtent>;
    async fn delete_iscsi_extent(&self, id: i64) -> Result<()>;

    async fn list_iscsi_initiators(&self) -> Result<Vec<IscsiInitiator>>;
    async fn create_iscsi_initiator(
        &self,
        params: &CreateIscsiInitiatorParams,
    ) -> Result<IscsiInitiator>;
    async fn delete_iscsi_initiator(&self, id: i64) -> Result<()>;

    async fn list_iscsi_targets(&self) -> Result<Vec<IscsiTarget>>;
    async fn create_iscsi_target(&self, params: &CreateIscsiTargetParams) -> Result<IscsiTarget>;
    async fn delete_iscsi_target(&self, id: i64) -> Result<()>;

    async fn list_iscsi_target_extents(&self) -> Result<Vec<IscsiTargetExtent>>;
    async fn create_iscsi_target_extent(
        &self,
        params: &CreateIscsiTargetExtentParams,
    ) -> Result<IscsiTargetExtent>;

    async fn get_iscsi_global_config(&self) -> Result<IscsiGlobalConfig>;
    async fn get_iscsi_portal(&self, id: i64) -> Result<IscsiPortal>;
}
