//! Node-side attach and detach.
//!
//! All methods block on OS tools; the gRPC layer runs them on the blocking pool.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::connector::{Connector, ConnectorStore};
use crate::error::{DriverError, Result};
use crate::metrics::record_node_operation;
use crate::platform::{IscsiSession, MountError, Mounter, validate_fs_type};
use crate::types::{IscsiVolumeContext, NfsVolumeContext};

pub struct NodeSessionManager {
    mounter: Arc<dyn Mounter>,
    iscsi: Arc<dyn IscsiSession>,
    store: ConnectorStore,
}

fn mount_error(err: MountError) -> DriverError {
    match err {
        MountError::PermissionDenied(msg) => DriverError::PermissionDenied(msg),
        MountError::InvalidArgument(msg) => DriverError::InvalidArgument(msg),
        other => DriverError::Internal(other.to_string()),
    }
}

fn internal(what: &str, err: impl std::fmt::Display) -> DriverError {
    DriverError::Internal(format!("{}: {}", what, err))
}

fn recorded<T>(operation: &str, backend: &str, result: Result<T>) -> Result<T> {
    record_node_operation(operation, backend, result.is_ok());
    result
}

impl NodeSessionManager {
    pub fn new(
        mounter: Arc<dyn Mounter>,
        iscsi: Arc<dyn IscsiSession>,
        store: ConnectorStore,
    ) -> Self {
        Self {
            mounter,
            iscsi,
            store,
        }
    }

    pub fn store(&self) -> &ConnectorStore {
        &self.store
    }

    // ========================================================================
    // NFS
    // ========================================================================

    /// Mount `host:mountPoint` at `target`. An existing mount is left alone.
    pub fn attach_nfs(
        &self,
        target: &Path,
        context: &NfsVolumeContext,
        mount_flags: &[String],
        readonly: bool,
    ) -> Result<()> {
        recorded("attach", "nfs", self.attach_nfs_inner(target, context, mount_flags, readonly))
    }

    fn attach_nfs_inner(
        &self,
        target: &Path,
        context: &NfsVolumeContext,
        mount_flags: &[String],
        readonly: bool,
    ) -> Result<()> {
        let source = context.mount_source();

        let mounted = if target.exists() {
            self.mounter.is_mount_point(target).map_err(mount_error)?
        } else {
            fs::create_dir_all(target)
                .map_err(|e| internal(&format!("failed to create {}", target.display()), e))?;
            fs::set_permissions(target, fs::Permissions::from_mode(0o777))
                .map_err(|e| internal(&format!("failed to chmod {}", target.display()), e))?;
            false
        };

        if mounted {
            debug!(target = %target.display(), "Target already mounted");
            return Ok(());
        }

        let mut options = mount_flags.to_vec();
        if readonly {
            options.push("ro".to_string());
        }

        self.mounter
            .mount(&source, target, "nfs", &options)
            .map_err(mount_error)?;

        info!(source = %source, target = %target.display(), readonly = readonly, "Mounted NFS volume");
        Ok(())
    }

    /// Unmount and remove `target`. A missing path is already detached.
    pub fn detach_nfs(&self, target: &Path) -> Result<()> {
        recorded("detach", "nfs", self.detach_nfs_inner(target))
    }

    fn detach_nfs_inner(&self, target: &Path) -> Result<()> {
        if !target.exists() {
            debug!(target = %target.display(), "Target path absent, nothing to detach");
            return Ok(());
        }

        if self.mounter.is_mount_point(target).map_err(mount_error)? {
            self.mounter.unmount(target).map_err(mount_error)?;
        }

        fs::remove_dir(target)
            .map_err(|e| internal(&format!("failed to remove {}", target.display()), e))?;

        info!(target = %target.display(), "Detached NFS volume");
        Ok(())
    }

    // ========================================================================
    // iSCSI
    // ========================================================================

    /// Log in, persist the connector, then format and mount the device.
    ///
    /// The connector is saved before mounting so that a session whose mount
    /// fails can still be found and logged out by a later detach.
    pub fn attach_iscsi(
        &self,
        volume_id: &str,
        target: &Path,
        context: &IscsiVolumeContext,
        fs_type: &str,
        mount_flags: &[String],
        readonly: bool,
    ) -> Result<()> {
        let result =
            self.attach_iscsi_inner(volume_id, target, context, fs_type, mount_flags, readonly);
        recorded("attach", "iscsi", result)
    }

    fn attach_iscsi_inner(
        &self,
        volume_id: &str,
        target: &Path,
        context: &IscsiVolumeContext,
        fs_type: &str,
        mount_flags: &[String],
        readonly: bool,
    ) -> Result<()> {
        let fs_type = validate_fs_type(fs_type).map_err(mount_error)?;
        let portals = context.login_portals()?.to_portal_strings();

        let mut connector = Connector {
            volume_id: volume_id.to_string(),
            target_iqn: context.iqn.clone(),
            target_portals: portals,
            lun: context.lun_number()?,
            device_path: None,
        };

        let device = self
            .iscsi
            .login(&connector)
            .map_err(|e| internal("iSCSI login failed", e))?;
        connector.device_path = Some(device.clone());
        debug!(volume_id = %volume_id, device = %device, "iSCSI session established");

        if target.exists() && self.mounter.is_mount_point(target).map_err(mount_error)? {
            debug!(target = %target.display(), "Target already mounted");
            return Ok(());
        }

        fs::create_dir_all(target)
            .map_err(|e| internal(&format!("failed to create {}", target.display()), e))?;
        fs::set_permissions(target, fs::Permissions::from_mode(0o750))
            .map_err(|e| internal(&format!("failed to chmod {}", target.display()), e))?;

        if let Err(e) = self.store.save(&connector) {
            error!(volume_id = %volume_id, error = %e, "Failed to persist connector, logging out");
            if let Err(logout_err) = self
                .iscsi
                .logout(&connector.target_iqn, &connector.target_portals)
            {
                error!(volume_id = %volume_id, error = %logout_err, "Logout after persist failure failed");
            }
            return Err(internal("failed to persist iSCSI connector", e));
        }

        let mut options = vec![if readonly { "ro" } else { "rw" }.to_string()];
        options.extend(mount_flags.iter().cloned());

        self.mounter
            .format_and_mount(&device, target, fs_type, &options)
            .map_err(mount_error)?;

        info!(
            volume_id = %volume_id,
            device = %device,
            target = %target.display(),
            fs_type = %fs_type,
            "Mounted iSCSI volume"
        );
        Ok(())
    }

    /// Unmount `target` and, when nothing else uses the device, log out.
    pub fn detach_iscsi(&self, volume_id: &str, target: &Path) -> Result<()> {
        recorded("detach", "iscsi", self.detach_iscsi_inner(volume_id, target))
    }

    fn detach_iscsi_inner(&self, volume_id: &str, target: &Path) -> Result<()> {
        if !target.exists() {
            debug!(target = %target.display(), "Target path absent, nothing to detach");
            return Ok(());
        }

        let (device, refs) = self
            .mounter
            .device_for_mount(target)
            .map_err(|e| internal("failed to read mount table", e))?;

        let connector = match self.store.load(volume_id) {
            Ok(Some(connector)) => connector,
            Ok(None) => {
                debug!(volume_id = %volume_id, "No connector on file, session already closed");
                return Ok(());
            }
            Err(e) => return Err(internal("failed to load iSCSI connector", e)),
        };

        self.mounter
            .unmount(target)
            .map_err(|e| internal(&format!("failed to unmount {}", target.display()), e))?;

        let remaining = refs.saturating_sub(1);
        if remaining > 0 {
            info!(
                volume_id = %volume_id,
                device = ?device,
                remaining = remaining,
                "Device still mounted elsewhere, keeping session"
            );
            return Ok(());
        }

        self.iscsi
            .logout(&connector.target_iqn, &connector.target_portals)
            .map_err(|e| internal("iSCSI logout failed", e))?;

        if let Err(e) = fs::remove_dir_all(target) {
            warn!(target = %target.display(), error = %e, "Failed to remove target directory");
        }
        if let Err(e) = self.store.remove(volume_id) {
            warn!(volume_id = %volume_id, error = %e, "Failed to remove connector file");
        }

        info!(volume_id = %volume_id, iqn = %connector.target_iqn, "Detached iSCSI volume");
        Ok(())
    }
}
