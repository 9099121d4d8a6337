//! Volume provisioning against the appliance.
//!
//! A volume is a chain of appliance objects. Each provisioner walks its chain
//! with find-or-create steps so that a retried CreateVolume reuses whatever
//! an earlier attempt already built.

mod iscsi;
mod nfs;
mod rollback;

use std::collections::HashMap;
use std::sync::Arc;

use truenas_client::Appliance;

use crate::capability::validate_capabilities;
use crate::catalog::{ObjectKind, find_first};
use crate::config::DriverConfig;
use crate::csi;
use crate::error::{DriverError, Result};
use crate::inventory::VolumeEntry;
use crate::types::{BackendKind, check_required_keys};

pub use iscsi::IscsiProvisioner;
pub use nfs::NfsProvisioner;
pub use rollback::{UndoAction, UndoStack};

const GIB: i64 = 1 << 30;

/// Smallest volume the driver will create.
pub const MINIMUM_VOLUME_SIZE_BYTES: i64 = GIB;
/// Largest volume the driver will create.
pub const MAXIMUM_VOLUME_SIZE_BYTES: i64 = 128 * GIB;
/// Size used when the request carries no capacity range.
pub const DEFAULT_VOLUME_SIZE_BYTES: i64 = 16 * GIB;

/// Parameters of a CreateVolume call that the provisioners care about.
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub name: String,
    pub capacity_range: Option<csi::CapacityRange>,
    pub capabilities: Vec<csi::VolumeCapability>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedVolume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub context: HashMap<String, String>,
}

impl From<ProvisionedVolume> for csi::Volume {
    fn from(volume: ProvisionedVolume) -> Self {
        csi::Volume {
            capacity_bytes: volume.capacity_bytes,
            volume_id: volume.volume_id,
            volume_context: volume.context,
            content_source: None,
            accessible_topology: vec![],
        }
    }
}

/// Pick the size to provision from an optional capacity range.
///
/// Out-of-range or inconsistent ranges are rejected, never silently clamped.
pub fn resolve_capacity(range: Option<&csi::CapacityRange>) -> Result<i64> {
    let Some(range) = range else {
        return Ok(DEFAULT_VOLUME_SIZE_BYTES);
    };
    let required = range.required_bytes;
    let limit = range.limit_bytes;

    if required < 0 || limit < 0 {
        return Err(DriverError::OutOfRange(format!(
            "invalid capacity range: negative size (required {}, limit {})",
            required, limit
        )));
    }

    let required_set = required > 0;
    let limit_set = limit > 0;

    if !required_set && !limit_set {
        return Ok(DEFAULT_VOLUME_SIZE_BYTES);
    }

    if required_set && limit_set && limit < required {
        return Err(DriverError::OutOfRange(format!(
            "invalid capacity range: limit ({}) is less than required ({})",
            limit, required
        )));
    }

    if required_set && required < MINIMUM_VOLUME_SIZE_BYTES {
        return Err(DriverError::OutOfRange(format!(
            "invalid capacity range: required ({}) is less than the minimum volume size ({})",
            required, MINIMUM_VOLUME_SIZE_BYTES
        )));
    }

    if required_set && required > MAXIMUM_VOLUME_SIZE_BYTES {
        return Err(DriverError::OutOfRange(format!(
            "invalid capacity range: required ({}) is greater than the maximum volume size ({})",
            required, MAXIMUM_VOLUME_SIZE_BYTES
        )));
    }

    if limit_set && limit < MINIMUM_VOLUME_SIZE_BYTES {
        return Err(DriverError::OutOfRange(format!(
            "invalid capacity range: limit ({}) is less than the minimum volume size ({})",
            limit, MINIMUM_VOLUME_SIZE_BYTES
        )));
    }

    if !required_set && limit > MAXIMUM_VOLUME_SIZE_BYTES {
        return Err(DriverError::OutOfRange(format!(
            "invalid capacity range: limit ({}) is greater than the maximum volume size ({})",
            limit, MAXIMUM_VOLUME_SIZE_BYTES
        )));
    }

    Ok(if required_set { required } else { limit })
}

/// Request checks shared by both backends. Runs before any remote call.
pub(crate) fn check_create_request(kind: BackendKind, request: &VolumeRequest) -> Result<i64> {
    if request.name.is_empty() {
        return Err(DriverError::InvalidArgument(
            "volume name must be provided".to_string(),
        ));
    }
    if request.capabilities.is_empty() {
        return Err(DriverError::InvalidArgument(
            "volume capabilities must be provided".to_string(),
        ));
    }
    validate_capabilities(kind, &request.capabilities)?;
    resolve_capacity(request.capacity_range.as_ref())
}

/// Available bytes under a parent dataset.
pub(crate) async fn available_capacity(appliance: &dyn Appliance, storage_path: &str) -> Result<i64> {
    let dataset = appliance
        .get_dataset(storage_path)
        .await
        .map_err(|e| DriverError::remote("get", ObjectKind::Dataset, storage_path, e))?;

    let available = dataset.available.unwrap_or_default();
    available.raw_i64().map_err(|e| {
        DriverError::Internal(format!(
            "failed to parse available bytes of dataset '{}': {}",
            storage_path, e
        ))
    })
}

/// The provisioner for the backend this process was started with.
pub enum Provisioner {
    Nfs(NfsProvisioner),
    Iscsi(IscsiProvisioner),
}

impl Provisioner {
    pub fn new(appliance: Arc<dyn Appliance>, config: Arc<DriverConfig>) -> Self {
        match config.kind {
            BackendKind::Nfs => Provisioner::Nfs(NfsProvisioner::new(appliance, config)),
            BackendKind::Iscsi => Provisioner::Iscsi(IscsiProvisioner::new(appliance, config)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Provisioner::Nfs(_) => BackendKind::Nfs,
            Provisioner::Iscsi(_) => BackendKind::Iscsi,
        }
    }

    fn parts(&self) -> (&dyn Appliance, &DriverConfig) {
        match self {
            Provisioner::Nfs(p) => (p.appliance(), p.config()),
            Provisioner::Iscsi(p) => (p.appliance(), p.config()),
        }
    }

    pub async fn create_volume(&self, request: &VolumeRequest) -> Result<ProvisionedVolume> {
        match self {
            Provisioner::Nfs(p) => p.create_volume(request).await,
            Provisioner::Iscsi(p) => p.create_volume(request).await,
        }
    }

    /// Delete a volume. A volume ID owned by another backend is NotFound.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.check_ownership(volume_id)?;
        match self {
            Provisioner::Nfs(p) => p.delete_volume(volume_id).await,
            Provisioner::Iscsi(p) => p.delete_volume(volume_id).await,
        }
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeEntry>> {
        match self {
            Provisioner::Nfs(p) => p.list_volumes().await,
            Provisioner::Iscsi(p) => p.list_volumes().await,
        }
    }

    pub async fn get_capacity(&self) -> Result<i64> {
        let (appliance, config) = self.parts();
        available_capacity(appliance, config.storage_path()).await
    }

    /// Confirm an existing volume can serve `capabilities`.
    pub async fn validate_volume(
        &self,
        volume_id: &str,
        capabilities: &[csi::VolumeCapability],
        context: &HashMap<String, String>,
    ) -> Result<()> {
        self.check_ownership(volume_id)?;
        validate_capabilities(self.kind(), capabilities)?;
        check_required_keys(self.kind(), context)?;

        let (appliance, config) = self.parts();
        let dataset_name = config.dataset_name(volume_id);
        let dataset = find_first(
            ObjectKind::Dataset,
            &dataset_name,
            appliance.list_datasets(),
            |d| d.name == dataset_name,
        )
        .await?;

        match dataset {
            Some(_) => Ok(()),
            None => Err(DriverError::NotFound(format!(
                "volume {} does not exist",
                volume_id
            ))),
        }
    }

    fn check_ownership(&self, volume_id: &str) -> Result<()> {
        if BackendKind::from_volume_id(volume_id) == Some(self.kind()) {
            Ok(())
        } else {
            Err(DriverError::NotFound(format!(
                "volume {} is not a {} volume",
                volume_id,
                self.kind()
            )))
        }
    }
}
