//! Linux platform implementation for CSI Node operations
//!
//! Uses Linux-specific tools:
//! - iscsiadm for iSCSI (open-iscsi)
//! - mount/umount for NFS and block filesystems
//! - mkfs.ext4/mkfs.xfs and blkid for formatting

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{DEFAULT_FS_TYPE, IscsiError, IscsiSession, MountError, Mounter};
use crate::connector::Connector;

const PROC_MOUNTS: &str = "/proc/mounts";
const DISK_BY_PATH: &str = "/dev/disk/by-path";
/// How long to wait for the SCSI disk to show up after login
const DEVICE_WAIT: Duration = Duration::from_secs(10);
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn run(program: &str, args: &[&str]) -> Result<Output, std::io::Error> {
    debug!(program = %program, args = ?args, "Running command");
    Command::new(program).args(args).output()
}

/// Decode the octal escapes (`\040` for space) used in /proc/mounts.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(code as u8);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// (device, mount point) pairs from a /proc/mounts style table.
fn parse_mount_table(table: &str) -> Vec<(String, String)> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some((unescape_mount_field(device), unescape_mount_field(mount_point)))
        })
        .collect()
}

/// Classify a failed mount by its stderr.
fn mount_failure(command: &str, stderr: &str) -> MountError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("access denied") {
        MountError::PermissionDenied(stderr.trim().to_string())
    } else if lower.contains("invalid argument") {
        MountError::InvalidArgument(stderr.trim().to_string())
    } else {
        MountError::CommandFailed {
            command: command.to_string(),
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Normalise a filesystem type for mkfs. Empty means the default.
pub fn validate_fs_type(fs_type: &str) -> Result<&'static str, MountError> {
    match fs_type.to_lowercase().as_str() {
        "" => Ok(DEFAULT_FS_TYPE),
        "ext4" => Ok("ext4"),
        "xfs" => Ok("xfs"),
        _ => Err(MountError::InvalidArgument(format!(
            "unsupported filesystem '{}': supported are ext4, xfs",
            fs_type
        ))),
    }
}

// ============================================================================
// Mounts
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LinuxMounter;

impl LinuxMounter {
    pub fn new() -> Self {
        Self
    }

    fn mount_table(&self) -> Result<Vec<(String, String)>, MountError> {
        Ok(parse_mount_table(&fs::read_to_string(PROC_MOUNTS)?))
    }

    /// Check if a device has no filesystem yet.
    fn needs_formatting(&self, device: &str) -> Result<bool, MountError> {
        let output = run("blkid", &["-p", device])?;

        // blkid returns non-zero if no filesystem found
        if !output.status.success() {
            return Ok(true);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(!stdout.contains("TYPE="))
    }

    fn format_device(&self, device: &str, fs_type: &str) -> Result<(), MountError> {
        info!(device = %device, fs_type = %fs_type, "Formatting device");

        let (program, force) = match fs_type {
            "xfs" => ("mkfs.xfs", "-f"),
            _ => ("mkfs.ext4", "-F"),
        };

        let output = run(program, &[force, device])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, program = %program, "mkfs failed");
            return Err(MountError::CommandFailed {
                command: program.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Mounter for LinuxMounter {
    fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        if !path.exists() {
            return Ok(false);
        }
        let target = path.to_string_lossy();
        Ok(self
            .mount_table()?
            .iter()
            .any(|(_, mount_point)| *mount_point == target))
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let target_str = target.to_string_lossy();
        info!(source = %source, target = %target_str, fs_type = %fs_type, options = ?options, "Mounting");

        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, &*target_str]);

        let output = run("mount", &args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, source = %source, "mount failed");
            return Err(mount_failure("mount", &stderr));
        }
        Ok(())
    }

    fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let fs_type = validate_fs_type(fs_type)?;
        if self.needs_formatting(device)? {
            self.format_device(device, fs_type)?;
        } else {
            debug!(device = %device, "Device already has a filesystem");
        }
        self.mount(device, target, fs_type, options)
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if !self.is_mount_point(target)? {
            debug!(target = %target.display(), "Path is not mounted, skipping unmount");
            return Ok(());
        }

        info!(target = %target.display(), "Unmounting");
        let target_str = target.to_string_lossy();
        let output = run("umount", &[&*target_str])?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Treat "not mounted" as success
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target_str, "Path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(mount_failure("umount", &stderr));
        }
        Ok(())
    }

    fn device_for_mount(&self, target: &Path) -> Result<(Option<String>, usize), MountError> {
        let table = self.mount_table()?;
        Ok(device_refs(&table, &target.to_string_lossy()))
    }
}

/// Device mounted at `target` and the number of its mount points.
fn device_refs(table: &[(String, String)], target: &str) -> (Option<String>, usize) {
    let Some((device, _)) = table.iter().find(|(_, mp)| mp == target) else {
        return (None, 0);
    };
    let refs = table.iter().filter(|(d, _)| d == device).count();
    (Some(device.clone()), refs)
}

// ============================================================================
// iSCSI
// ============================================================================

/// open-iscsi initiator driven through `iscsiadm`.
///
/// The binary path is configurable so a chroot wrapper can be used when the
/// plugin runs in a container.
#[derive(Debug, Clone)]
pub struct IscsiAdm {
    binary: PathBuf,
}

impl IscsiAdm {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn iscsiadm(&self, args: &[&str]) -> Result<Output, std::io::Error> {
        let program = self.binary.to_string_lossy();
        run(&program, args)
    }

    fn discover(&self, portal: &str) {
        match self.iscsiadm(&["-m", "discovery", "-t", "sendtargets", "-p", portal]) {
            Ok(output) if output.status.success() => {
                debug!(portal = %portal, "iSCSI discovery successful");
            }
            Ok(output) => {
                // Login can still succeed if the node record already exists
                warn!(
                    portal = %portal,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "iscsiadm discovery returned error"
                );
            }
            Err(e) => warn!(portal = %portal, error = %e, "Failed to execute iscsiadm discovery"),
        }
    }

    fn login_portal(&self, iqn: &str, portal: &str) -> Result<(), String> {
        let output = self
            .iscsiadm(&["-m", "node", "-T", iqn, "-p", portal, "--login"])
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            info!(target_iqn = %iqn, portal = %portal, "iSCSI login successful");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already present") || stderr.contains("session already exists") {
            info!(target_iqn = %iqn, portal = %portal, "iSCSI session already exists");
            return Ok(());
        }
        Err(stderr.trim().to_string())
    }

    /// Wait for `/dev/disk/by-path/ip-<portal>-iscsi-<iqn>-lun-<lun>`.
    fn wait_for_device(&self, connector: &Connector) -> Result<String, IscsiError> {
        let suffix = format!("-iscsi-{}-lun-{}", connector.target_iqn, connector.lun);
        let deadline = Instant::now() + DEVICE_WAIT;

        loop {
            if let Ok(entries) = fs::read_dir(DISK_BY_PATH) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if name.to_string_lossy().ends_with(&suffix)
                        && let Ok(device) = fs::canonicalize(entry.path())
                    {
                        return Ok(resolve_multipath_device(&device.to_string_lossy()));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(IscsiError::DeviceNotFound {
                    iqn: connector.target_iqn.clone(),
                    lun: connector.lun,
                });
            }
            thread::sleep(DEVICE_POLL_INTERVAL);
        }
    }
}

impl IscsiSession for IscsiAdm {
    fn login(&self, connector: &Connector) -> Result<String, IscsiError> {
        let iqn = connector.target_iqn.as_str();
        info!(target_iqn = %iqn, portals = ?connector.target_portals, "Connecting to iSCSI target");

        let mut failures = Vec::new();
        for portal in &connector.target_portals {
            self.discover(portal);
            if let Err(reason) = self.login_portal(iqn, portal) {
                warn!(target_iqn = %iqn, portal = %portal, reason = %reason, "iSCSI login failed for portal");
                failures.push(format!("{}: {}", portal, reason));
            }
        }

        // One working path is enough
        if failures.len() == connector.target_portals.len() {
            return Err(IscsiError::Login {
                iqn: iqn.to_string(),
                reason: if failures.is_empty() {
                    "no portals given".to_string()
                } else {
                    failures.join("; ")
                },
            });
        }

        let device = self.wait_for_device(connector)?;
        info!(target_iqn = %iqn, device = %device, "iSCSI target connected");
        Ok(device)
    }

    fn logout(&self, iqn: &str, portals: &[String]) -> Result<(), IscsiError> {
        info!(target_iqn = %iqn, portals = ?portals, "Disconnecting from iSCSI target");

        for portal in portals {
            let output = self.iscsiadm(&["-m", "node", "-T", iqn, "-p", portal, "--logout"])?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // Treat "not logged in" as success
                if !(stderr.contains("No matching sessions") || stderr.contains("not logged in")) {
                    error!(stderr = %stderr, portal = %portal, "iscsiadm logout failed");
                    return Err(IscsiError::Logout {
                        iqn: iqn.to_string(),
                        reason: stderr.trim().to_string(),
                    });
                }
                warn!(target_iqn = %iqn, portal = %portal, "iSCSI target was not logged in");
            }

            // Drop the node record so the session is not restored on boot
            if let Ok(output) = self.iscsiadm(&["-m", "node", "-T", iqn, "-p", portal, "-o", "delete"])
                && !output.status.success()
            {
                debug!(portal = %portal, "No iSCSI node record to delete");
            }
        }
        Ok(())
    }
}

/// Return the device-mapper device holding `device`, if it is multipathed.
fn resolve_multipath_device(device: &str) -> String {
    let dev_name = device.rsplit('/').next().unwrap_or(device);
    let holders = format!("/sys/block/{}/holders", dev_name);

    if let Ok(entries) = fs::read_dir(&holders) {
        for entry in entries.flatten() {
            let holder = entry.file_name().to_string_lossy().into_owned();
            if holder.starts_with("dm-") {
                let dm_device = format!("/dev/{}", holder);
                info!(original = %device, multipath = %dm_device, "Device is multipathed, using dm device");
                return dm_device;
            }
        }
    }
    device.to_string()
}
