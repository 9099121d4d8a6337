//! Access mode and access type checks per backend.

use std::collections::BTreeSet;

use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::error::{DriverError, Result};
use crate::types::BackendKind;

const NFS_MODES: &[Mode] = &[
    Mode::SingleNodeWriter,
    Mode::SingleNodeReaderOnly,
    Mode::MultiNodeReaderOnly,
    Mode::MultiNodeSingleWriter,
    Mode::MultiNodeMultiWriter,
    Mode::SingleNodeSingleWriter,
    Mode::SingleNodeMultiWriter,
];

const ISCSI_MODES: &[Mode] = &[
    Mode::SingleNodeWriter,
    Mode::SingleNodeReaderOnly,
    Mode::SingleNodeSingleWriter,
    Mode::SingleNodeMultiWriter,
];

pub fn supported_modes(kind: BackendKind) -> &'static [Mode] {
    match kind {
        BackendKind::Nfs => NFS_MODES,
        BackendKind::Iscsi => ISCSI_MODES,
    }
}

fn requested_mode(capability: &csi::VolumeCapability) -> std::result::Result<Mode, i32> {
    let raw = capability.access_mode.as_ref().map_or(0, |m| m.mode);
    Mode::try_from(raw).map_err(|_| raw)
}

/// Check every capability and report all violations at once.
///
/// Only filesystem (mount) access is offered; raw block is never supported.
pub fn validate_capabilities(
    kind: BackendKind,
    capabilities: &[csi::VolumeCapability],
) -> Result<()> {
    let supported = supported_modes(kind);
    // Sorted and deduplicated for a stable message
    let mut violations = BTreeSet::new();

    for capability in capabilities {
        match requested_mode(capability) {
            Ok(mode) if supported.contains(&mode) => {}
            Ok(mode) => {
                violations.insert(format!("unsupported access mode {}", mode.as_str_name()));
            }
            Err(raw) => {
                violations.insert(format!("unsupported access mode {}", raw));
            }
        }

        match &capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(_)) => {}
            Some(csi::volume_capability::AccessType::Block(_)) => {
                violations.insert("unsupported access type block".to_string());
            }
            None => {
                violations.insert("unsupported access type none".to_string());
            }
        }
    }

    if violations.is_empty() {
        return Ok(());
    }

    Err(DriverError::InvalidArgument(format!(
        "volume capabilities cannot be satisfied: {}",
        violations.into_iter().collect::<Vec<_>>().join("; ")
    )))
}

#[cfg(test)]
pub(crate) fn mount_capability(mode: Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}
