//! In-memory stand-ins for the appliance and the node's OS capabilities.
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use truenas_client::types::{
    CompositeValue, CreateDatasetParams, CreateIscsiExtentParams, CreateIscsiInitiatorParams,
    CreateIscsiTargetExtentParams, CreateIscsiTargetParams, CreateNfsShareParams, Dataset,
    DatasetType, IscsiExtent, IscsiGlobalConfig, IscsiInitiator, IscsiPortal, IscsiTarget,
    IscsiTargetExtent, NfsShare, PortalListen,
};
use truenas_client::{Appliance, ApiError};

use truenas_csi::connector::Connector;
use truenas_csi::csi;
use truenas_csi::platform::{IscsiError, IscsiSession, MountError, Mounter};
use truenas_csi::{BackendKind, DriverConfig};

pub const GIB: i64 = 1 << 30;
pub const NFS_STORAGE_PATH: &str = "pool/csi";
pub const ISCSI_STORAGE_PATH: &str = "pool/iscsi";
pub const IQN_BASE: &str = "iqn.2020-01.com.example";
pub const PORTAL_ID: i64 = 1;

pub fn config(kind: BackendKind) -> Arc<DriverConfig> {
    Arc::new(DriverConfig {
        kind,
        nfs_storage_path: NFS_STORAGE_PATH.to_string(),
        iscsi_storage_path: ISCSI_STORAGE_PATH.to_string(),
        portal_id: PORTAL_ID,
        nfs_host: "10.0.0.5".to_string(),
        iscsi_config_dir: PathBuf::from("/nonexistent"),
        node_id: "node-1".to_string(),
    })
}

pub fn mount_capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume {
                fs_type: String::new(),
                mount_flags: vec![],
                volume_mount_group: String::new(),
            },
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

pub fn capacity(required: i64) -> Option<csi::CapacityRange> {
    Some(csi::CapacityRange {
        required_bytes: required,
        limit_bytes: 0,
    })
}

fn status(method: &str, path: &str, code: u16, body: &str) -> ApiError {
    ApiError::Status {
        method: method.to_string(),
        path: path.to_string(),
        status: code,
        body: body.to_string(),
    }
}

// ============================================================================
// Appliance
// ============================================================================

#[derive(Debug, Default)]
pub struct ApplianceState {
    pub datasets: Vec<Dataset>,
    pub shares: Vec<NfsShare>,
    pub extents: Vec<IscsiExtent>,
    pub initiators: Vec<IscsiInitiator>,
    pub targets: Vec<IscsiTarget>,
    pub mappings: Vec<IscsiTargetExtent>,
    pub portals: Vec<IscsiPortal>,
    pub basename: String,
    next_id: i64,
}

impl ApplianceState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Appliance backed by plain vectors.
///
/// Records every call by name and fails any call named in `fail_on`.
/// Deleting a dataset removes its NFS shares and fails while a target
/// still maps its zvol, like the real appliance.
#[derive(Default)]
pub struct FakeAppliance {
    state: Mutex<ApplianceState>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<HashSet<String>>,
}

impl FakeAppliance {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            state.basename = IQN_BASE.to_string();
            state.portals.push(IscsiPortal {
                id: PORTAL_ID,
                listen: vec![PortalListen {
                    ip: "10.0.0.5".to_string(),
                    port: 3260,
                }],
                comment: String::new(),
            });
            for parent in [NFS_STORAGE_PATH, ISCSI_STORAGE_PATH] {
                state.datasets.push(Dataset {
                    id: parent.to_string(),
                    name: parent.to_string(),
                    kind: DatasetType::Filesystem,
                    mountpoint: Some(format!("/mnt/{}", parent)),
                    refquota: None,
                    volsize: None,
                    available: Some(CompositeValue::from_raw((100 * GIB).to_string())),
                });
            }
        }
        Arc::new(fake)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ApplianceState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Calls that change appliance state.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("create_") || c.starts_with("delete_"))
            .collect()
    }

    pub fn fail_on(&self, call: &str) {
        self.fail_on.lock().unwrap().insert(call.to_string());
    }

    pub fn set_portal_listen(&self, listen: Vec<PortalListen>) {
        self.state().portals[0].listen = listen;
    }

    /// Datasets below the parent datasets.
    pub fn volume_datasets(&self) -> Vec<Dataset> {
        self.state()
            .datasets
            .iter()
            .filter(|d| d.name != NFS_STORAGE_PATH && d.name != ISCSI_STORAGE_PATH)
            .cloned()
            .collect()
    }

    fn enter(&self, call: &str) -> truenas_client::Result<()> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.fail_on.lock().unwrap().contains(call) {
            return Err(status("POST", call, 500, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Appliance for FakeAppliance {
    async fn list_datasets(&self) -> truenas_client::Result<Vec<Dataset>> {
        self.enter("list_datasets")?;
        Ok(self.state().datasets.clone())
    }

    async fn get_dataset(&self, id: &str) -> truenas_client::Result<Dataset> {
        self.enter("get_dataset")?;
        self.state()
            .datasets
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| status("GET", "/pool/dataset/id", 404, "not found"))
    }

    async fn create_dataset(&self, params: &CreateDatasetParams) -> truenas_client::Result<Dataset> {
        self.enter("create_dataset")?;
        let mut state = self.state();
        if state.datasets.iter().any(|d| d.name == params.name) {
            return Err(status("POST", "/pool/dataset", 422, "dataset already exists"));
        }
        let kind = params.kind.unwrap_or(DatasetType::Filesystem);
        let dataset = Dataset {
            id: params.name.clone(),
            name: params.name.clone(),
            kind,
            mountpoint: match kind {
                DatasetType::Filesystem => Some(format!("/mnt/{}", params.name)),
                DatasetType::Volume => None,
            },
            refquota: params
                .refquota
                .map(|q| CompositeValue::from_raw(q.to_string())),
            volsize: params
                .volsize
                .map(|v| CompositeValue::from_raw(v.to_string())),
            available: None,
        };
        state.datasets.push(dataset.clone());
        Ok(dataset)
    }

    async fn delete_dataset(&self, id: &str) -> truenas_client::Result<()> {
        self.enter("delete_dataset")?;
        let mut state = self.state();
        let Some(pos) = state.datasets.iter().position(|d| d.id == id) else {
            return Err(status("DELETE", "/pool/dataset/id", 404, "not found"));
        };

        let zvol = format!("zvol/{}", id);
        let busy = state.mappings.iter().any(|m| {
            state
                .extents
                .iter()
                .any(|e| e.id == m.extent && e.path == zvol)
                && state.targets.iter().any(|t| t.id == m.target)
        });
        if busy {
            return Err(status("DELETE", "/pool/dataset/id", 422, "dataset is busy"));
        }

        let dataset = state.datasets.remove(pos);
        if let Some(mountpoint) = dataset.mountpoint {
            state.shares.retain(|s| !s.paths.contains(&mountpoint));
        }
        Ok(())
    }

    async fn list_nfs_shares(&self) -> truenas_client::Result<Vec<NfsShare>> {
        self.enter("list_nfs_shares")?;
        Ok(self.state().shares.clone())
    }

    async fn create_nfs_share(
        &self,
        params: &CreateNfsShareParams,
    ) -> truenas_client::Result<NfsShare> {
        self.enter("create_nfs_share")?;
        let mut state = self.state();
        let share = NfsShare {
            id: state.next_id(),
            paths: params.paths.clone(),
            comment: params.comment.clone(),
            enabled: params.enabled,
            ro: params.ro,
        };
        state.shares.push(share.clone());
        Ok(share)
    }

    async fn list_iscsi_extents(&self) -> truenas_client::Result<Vec<IscsiExtent>> {
        self.enter("list_iscsi_extents")?;
        Ok(self.state().extents.clone())
    }

    async fn create_iscsi_extent(
        &self,
        params: &CreateIscsiExtentParams,
    ) -> truenas_client::Result<IscsiExtent> {
        self.enter("create_iscsi_extent")?;
        let mut state = self.state();
        let extent = IscsiExtent {
            id: state.next_id(),
            name: params.name.clone(),
            path: params.disk.clone(),
            disk: Some(params.disk.clone()),
            comment: params.comment.clone(),
        };
        state.extents.push(extent.clone());
        Ok(extent)
    }

    async fn delete_iscsi_extent(&self, id: i64) -> truenas_client::Result<()> {
        self.enter("delete_iscsi_extent")?;
        let mut state = self.state();
        let before = state.extents.len();
        state.extents.retain(|e| e.id != id);
        if state.extents.len() == before {
            return Err(status("DELETE", "/iscsi/extent/id", 404, "not found"));
        }
        state.mappings.retain(|m| m.extent != id);
        Ok(())
    }

    async fn list_iscsi_initiators(&self) -> truenas_client::Result<Vec<IscsiInitiator>> {
        self.enter("list_iscsi_initiators")?;
        Ok(self.state().initiators.clone())
    }

    async fn create_iscsi_initiator(
        &self,
        params: &CreateIscsiInitiatorParams,
    ) -> truenas_client::Result<IscsiInitiator> {
        self.enter("create_iscsi_initiator")?;
        let mut state = self.state();
        let initiator = IscsiInitiator {
            id: state.next_id(),
            comment: params.comment.clone(),
            initiators: vec![],
        };
        state.initiators.push(initiator.clone());
        Ok(initiator)
    }

    async fn delete_iscsi_initiator(&self, id: i64) -> truenas_client::Result<()> {
        self.enter("delete_iscsi_initiator")?;
        let mut state = self.state();
        let before = state.initiators.len();
        state.initiators.retain(|i| i.id != id);
        if state.initiators.len() == before {
            return Err(status("DELETE", "/iscsi/initiator/id", 404, "not found"));
        }
        Ok(())
    }

    async fn list_iscsi_targets(&self) -> truenas_client::Result<Vec<IscsiTarget>> {
        self.enter("list_iscsi_targets")?;
        Ok(self.state().targets.clone())
    }

    async fn create_iscsi_target(
        &self,
        params: &CreateIscsiTargetParams,
    ) -> truenas_client::Result<IscsiTarget> {
        self.enter("create_iscsi_target")?;
        let mut state = self.state();
        let target = IscsiTarget {
            id: state.next_id(),
            name: params.name.clone(),
            alias: params.alias.clone(),
            mode: params.mode.clone(),
            groups: params.groups.clone(),
        };
        state.targets.push(target.clone());
        Ok(target)
    }

    async fn delete_iscsi_target(&self, id: i64) -> truenas_client::Result<()> {
        self.enter("delete_iscsi_target")?;
        let mut state = self.state();
        let before = state.targets.len();
        state.targets.retain(|t| t.id != id);
        if state.targets.len() == before {
            return Err(status("DELETE", "/iscsi/target/id", 404, "not found"));
        }
        state.mappings.retain(|m| m.target != id);
        Ok(())
    }

    async fn list_iscsi_target_extents(&self) -> truenas_client::Result<Vec<IscsiTargetExtent>> {
        self.enter("list_iscsi_target_extents")?;
        Ok(self.state().mappings.clone())
    }

    async fn create_iscsi_target_extent(
        &self,
        params: &CreateIscsiTargetExtentParams,
    ) -> truenas_client::Result<IscsiTargetExtent> {
        self.enter("create_iscsi_target_extent")?;
        let mut state = self.state();
        let mapping = IscsiTargetExtent {
            id: state.next_id(),
            target: params.target,
            extent: params.extent,
            lunid: params.lunid,
        };
        state.mappings.push(mapping.clone());
        Ok(mapping)
    }

    async fn get_iscsi_global_config(&self) -> truenas_client::Result<IscsiGlobalConfig> {
        self.enter("get_iscsi_global_config")?;
        Ok(IscsiGlobalConfig {
            id: 1,
            basename: self.state().basename.clone(),
        })
    }

    async fn get_iscsi_portal(&self, id: i64) -> truenas_client::Result<IscsiPortal> {
        self.enter("get_iscsi_portal")?;
        self.state()
            .portals
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| status("GET", "/iscsi/portal/id", 404, "not found"))
    }
}

// ============================================================================
// Mounter
// ============================================================================

/// Mount table kept in memory. `device_for_mount` counts table entries.
#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<(String, PathBuf)>>,
    calls: Mutex<Vec<String>>,
    fail_next_mount: Mutex<Option<MountError>>,
}

impl FakeMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_mount(&self, device: &str, target: &Path) {
        self.mounts
            .lock()
            .unwrap()
            .push((device.to_string(), target.to_path_buf()));
    }

    pub fn mounts(&self) -> Vec<(String, PathBuf)> {
        self.mounts.lock().unwrap().clone()
    }

    /// Mutating calls only (mount, format_and_mount, unmount).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_next_mount(&self, err: MountError) {
        *self.fail_next_mount.lock().unwrap() = Some(err);
    }

    fn record_mount(
        &self,
        call: &str,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(format!(
            "{} {} {} {} {}",
            call,
            source,
            target.display(),
            fs_type,
            options.join(",")
        ));
        if let Some(err) = self.fail_next_mount.lock().unwrap().take() {
            return Err(err);
        }
        self.add_mount(source, target);
        Ok(())
    }
}

impl Mounter for FakeMounter {
    fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        Ok(self.mounts.lock().unwrap().iter().any(|(_, t)| t == path))
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        self.record_mount("mount", source, target, fs_type, options)
    }

    fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        self.record_mount("format_and_mount", device, target, fs_type, options)
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("unmount {}", target.display()));
        self.mounts.lock().unwrap().retain(|(_, t)| t != target);
        Ok(())
    }

    fn device_for_mount(&self, target: &Path) -> Result<(Option<String>, usize), MountError> {
        let mounts = self.mounts.lock().unwrap();
        let Some((device, _)) = mounts.iter().find(|(_, t)| t == target) else {
            return Ok((None, 0));
        };
        let refs = mounts.iter().filter(|(d, _)| d == device).count();
        Ok((Some(device.clone()), refs))
    }
}

// ============================================================================
// iSCSI initiator
// ============================================================================

pub const FAKE_DEVICE: &str = "/dev/sdx";

#[derive(Default)]
pub struct FakeIscsi {
    logins: Mutex<Vec<Connector>>,
    logouts: Mutex<Vec<(String, Vec<String>)>>,
    fail_login: Mutex<bool>,
}

impl FakeIscsi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn logins(&self) -> Vec<Connector> {
        self.logins.lock().unwrap().clone()
    }

    pub fn logouts(&self) -> Vec<(String, Vec<String>)> {
        self.logouts.lock().unwrap().clone()
    }

    pub fn fail_login(&self) {
        *self.fail_login.lock().unwrap() = true;
    }
}

impl IscsiSession for FakeIscsi {
    fn login(&self, connector: &Connector) -> Result<String, IscsiError> {
        self.logins.lock().unwrap().push(connector.clone());
        if *self.fail_login.lock().unwrap() {
            return Err(IscsiError::Login {
                iqn: connector.target_iqn.clone(),
                reason: "no route to host".to_string(),
            });
        }
        Ok(FAKE_DEVICE.to_string())
    }

    fn logout(&self, iqn: &str, portals: &[String]) -> Result<(), IscsiError> {
        self.logouts
            .lock()
            .unwrap()
            .push((iqn.to_string(), portals.to_vec()));
        Ok(())
    }
}
