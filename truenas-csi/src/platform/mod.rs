//! OS capabilities used by the node plugin.
//!
//! [`Mounter`] covers filesystem mounts and [`IscsiSession`] covers the
//! iSCSI initiator. The node session manager only talks to these traits;
//! the Linux implementations shell out to the usual tools.
//!
//! # Usage
//!
//! ```ignore
//! use crate::platform::{IscsiAdm, LinuxMounter, Mounter};
//!
//! let mounter = LinuxMounter::new();
//! if !mounter.is_mount_point(target)? {
//!     mounter.mount("nas:/mnt/tank/pv", target, "nfs", &[])?;
//! }
//! ```

mod linux;

use std::path::Path;

use thiserror::Error;

use crate::connector::Connector;

pub use linux::{IscsiAdm, LinuxMounter, validate_fs_type};

/// Default filesystem for iSCSI volumes
pub const DEFAULT_FS_TYPE: &str = "ext4";

#[derive(Error, Debug)]
pub enum MountError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("iSCSI login to {iqn} failed: {reason}")]
    Login { iqn: String, reason: String },

    #[error("iSCSI logout from {iqn} failed: {reason}")]
    Logout { iqn: String, reason: String },

    #[error("no block device appeared for {iqn} lun {lun}")]
    DeviceNotFound { iqn: String, lun: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem mount operations.
pub trait Mounter: Send + Sync {
    fn is_mount_point(&self, path: &Path) -> Result<bool, MountError>;

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Create a filesystem on `device` if it has none, then mount it.
    fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmount `target`. Not being mounted is not an error.
    fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Device mounted at `target`, and how many mount points use that device.
    fn device_for_mount(&self, target: &Path) -> Result<(Option<String>, usize), MountError>;
}

/// iSCSI initiator session operations.
pub trait IscsiSession: Send + Sync {
    /// Log in on every portal of `connector` and return the block device.
    fn login(&self, connector: &Connector) -> Result<String, IscsiError>;

    fn logout(&self, iqn: &str, portals: &[String]) -> Result<(), IscsiError>;
}
