//! Wire model of the appliance REST API (v2.0).
//!
//! Only the fields the driver reads or writes are modelled; everything else
//! in a response is ignored on decode.

use std::fmt::{self, Display};
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Composite values
// ============================================================================

/// A ZFS property as reported by the appliance.
///
/// Sizes arrive as `{"parsed": ..., "rawvalue": "5368709120", "value": "5G"}`.
/// `rawvalue` is the only field with a stable encoding, so numeric reads go
/// through [`CompositeValue::raw_i64`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeValue {
    #[serde(default)]
    pub rawvalue: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub parsed: Option<serde_json::Value>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompositeParseError {
    #[error("composite value has no rawvalue")]
    Missing,
    #[error("rawvalue '{raw}' is not a base-10 integer: {source}")]
    Invalid {
        raw: String,
        #[source]
        source: ParseIntError,
    },
}

impl CompositeValue {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self {
            rawvalue: Some(raw.into()),
            ..Default::default()
        }
    }

    /// Parse `rawvalue` as a base-10 signed integer.
    pub fn raw_i64(&self) -> Result<i64, CompositeParseError> {
        let raw = self
            .rawvalue
            .as_deref()
            .ok_or(CompositeParseError::Missing)?;
        raw.trim()
            .parse::<i64>()
            .map_err(|source| CompositeParseError::Invalid {
                raw: raw.to_string(),
                source,
            })
    }
}

// ============================================================================
// Datasets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetType {
    Filesystem,
    Volume,
}

impl Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetType::Filesystem => write!(f, "FILESYSTEM"),
            DatasetType::Volume => write!(f, "VOLUME"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasetType,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub refquota: Option<CompositeValue>,
    #[serde(default)]
    pub volsize: Option<CompositeValue>,
    #[serde(default)]
    pub available: Option<CompositeValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateDatasetParams {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DatasetType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volblocksize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub casesensitivity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copies: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherit_encryption: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_type: Option<String>,
}

// ============================================================================
// NFS shares
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NfsShare {
    pub id: i64,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ro: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateNfsShareParams {
    pub paths: Vec<String>,
    pub comment: String,
    pub enabled: bool,
    pub ro: bool,
}

// ============================================================================
// iSCSI
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IscsiExtent {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// For DISK extents this is the `zvol/<dataset>` reference.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub disk: Option<String>,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateIscsiExtentParams {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub disk: String,
    pub rpm: String,
    pub insecure_tpc: bool,
    pub xen: bool,
    pub comment: String,
    pub blocksize: i32,
}

/// Body of `DELETE /iscsi/extent/id/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeleteIscsiExtentParams {
    pub remove: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IscsiInitiator {
    pub id: i64,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub initiators: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateIscsiInitiatorParams {
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub portal: i64,
    #[serde(default)]
    pub initiator: Option<i64>,
    pub authmethod: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IscsiTarget {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub groups: Vec<TargetGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateIscsiTargetParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub mode: String,
    pub groups: Vec<TargetGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IscsiTargetExtent {
    pub id: i64,
    pub target: i64,
    pub extent: i64,
    #[serde(default)]
    pub lunid: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateIscsiTargetExtentParams {
    pub target: i64,
    pub extent: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lunid: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IscsiGlobalConfig {
    #[serde(default)]
    pub id: i64,
    pub basename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalListen {
    pub ip: String,
    #[serde(default = "default_iscsi_port")]
    pub port: u16,
}

fn default_iscsi_port() -> u16 {
    3260
}

impl PortalListen {
    /// `ip:port`, with IPv6 addresses bracketed.
    pub fn address(&self) -> String {
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IscsiPortal {
    pub id: i64,
    #[serde(default)]
    pub listen: Vec<PortalListen>,
    #[serde(default)]
    pub comment: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_raw_i64() {
        let value: CompositeValue = serde_json::from_str(
            r#"{"parsed": 5368709120, "rawvalue": "5368709120", "value": "5G", "source": "LOCAL"}"#,
        )
        .unwrap();
        assert_eq!(value.raw_i64().unwrap(), 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_composite_raw_i64_errors() {
        assert_eq!(
            CompositeValue::default().raw_i64(),
            Err(CompositeParseError::Missing)
        );
        assert!(matches!(
            CompositeValue::from_raw("5G").raw_i64(),
            Err(CompositeParseError::Invalid { .. })
        ));
    }

    #[test]
    fn test_dataset_decode_ignores_unknown_fields() {
        let dataset: Dataset = serde_json::from_str(
            r#"{
                "id": "tank/csi/nfs-pv2",
                "name": "tank/csi/nfs-pv2",
                "pool": "tank",
                "type": "FILESYSTEM",
                "mountpoint": "/mnt/tank/csi/nfs-pv2",
                "refquota": {"parsed": 5368709120, "rawvalue": "5368709120", "value": "5G"},
                "children": []
            }"#,
        )
        .unwrap();
        assert_eq!(dataset.kind, DatasetType::Filesystem);
        assert_eq!(dataset.mountpoint.as_deref(), Some("/mnt/tank/csi/nfs-pv2"));
        assert!(dataset.volsize.is_none());
    }

    #[test]
    fn test_create_dataset_skips_unset_fields() {
        let params = CreateDatasetParams {
            name: "tank/csi/iscsi-pv1".to_string(),
            kind: Some(DatasetType::Volume),
            volsize: Some(1 << 30),
            volblocksize: Some("16K".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["type"], "VOLUME");
        assert_eq!(json["volsize"], 1 << 30);
        assert!(json.get("refquota").is_none());
        assert!(json.get("share_type").is_none());
    }

    #[test]
    fn test_portal_listen_address() {
        let v4 = PortalListen {
            ip: "10.0.0.5".to_string(),
            port: 3260,
        };
        assert_eq!(v4.address(), "10.0.0.5:3260");

        let v6 = PortalListen {
            ip: "fd00::5".to_string(),
            port: 3260,
        };
        assert_eq!(v6.address(), "[fd00::5]:3260");
    }
}
