//! Type-safe wrappers for volume identifiers and volume contexts.
//!
//! The volume context is the only contract between the controller and the
//! node plugin. Each backend has its own set of keys; both sides go through
//! the types here so the key names live in one place.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::DriverError;

// ============================================================================
// BackendKind
// ============================================================================

/// Storage backend a volume lives on.
///
/// Chosen once per process and encoded as the volume ID prefix, so every
/// later call can be routed without asking the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Filesystem dataset exported over NFS
    Nfs,
    /// Block zvol exported over iSCSI
    Iscsi,
}

impl BackendKind {
    /// Volume ID prefix owned by this backend.
    pub const fn prefix(self) -> &'static str {
        match self {
            BackendKind::Nfs => "nfs-",
            BackendKind::Iscsi => "iscsi-",
        }
    }

    pub const fn driver_name(self) -> &'static str {
        match self {
            BackendKind::Nfs => "nfs.truenas-scale.terrycain.github.com",
            BackendKind::Iscsi => "iscsi.truenas-scale.terrycain.github.com",
        }
    }

    /// Identify the owning backend from a volume ID prefix.
    pub fn from_volume_id(volume_id: &str) -> Option<Self> {
        [BackendKind::Nfs, BackendKind::Iscsi]
            .into_iter()
            .find(|kind| volume_id.starts_with(kind.prefix()))
    }

    pub fn volume_id(self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    /// Default CSI endpoint for this backend's driver.
    pub fn default_endpoint(self) -> String {
        format!("unix:///var/run/{}/csi.sock", self.driver_name())
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Nfs => write!(f, "nfs"),
            BackendKind::Iscsi => write!(f, "iscsi"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nfs" => Ok(BackendKind::Nfs),
            "iscsi" => Ok(BackendKind::Iscsi),
            _ => Err(BackendKindParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid backend kind.
#[derive(Debug, Clone)]
pub struct BackendKindParseError(String);

impl Display for BackendKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown volume type '{}': expected 'nfs' or 'iscsi'",
            self.0
        )
    }
}

impl std::error::Error for BackendKindParseError {}

// ============================================================================
// Volume context
// ============================================================================

/// Volume context keys.
pub mod keys {
    pub const HOST: &str = "host";
    pub const MOUNT_POINT: &str = "mountPoint";
    pub const TARGET_PORTAL: &str = "targetPortal";
    pub const IQN: &str = "iqn";
    pub const LUN: &str = "lun";
    pub const PORTALS: &str = "portals";
}

/// Keys a node needs to attach a volume of the given backend.
pub fn required_context_keys(kind: BackendKind) -> &'static [&'static str] {
    match kind {
        BackendKind::Nfs => &[keys::HOST, keys::MOUNT_POINT],
        BackendKind::Iscsi => &[keys::TARGET_PORTAL, keys::IQN, keys::LUN, keys::PORTALS],
    }
}

/// Fail with InvalidArgument naming every missing key.
///
/// A key whose value is empty or only whitespace counts as missing.
pub fn check_required_keys(
    kind: BackendKind,
    context: &HashMap<String, String>,
) -> Result<(), DriverError> {
    let missing: Vec<&str> = required_context_keys(kind)
        .iter()
        .copied()
        .filter(|key| context.get(*key).is_none_or(|value| value.trim().is_empty()))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DriverError::InvalidArgument(format!(
            "volume context is missing required keys: {}",
            missing.join(", ")
        )))
    }
}

fn require<'a>(context: &'a HashMap<String, String>, key: &str) -> &'a str {
    context.get(key).map(String::as_str).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsVolumeContext {
    pub host: String,
    pub mount_point: String,
}

impl NfsVolumeContext {
    pub fn from_map(context: &HashMap<String, String>) -> Result<Self, DriverError> {
        check_required_keys(BackendKind::Nfs, context)?;
        Ok(Self {
            host: require(context, keys::HOST).to_string(),
            mount_point: require(context, keys::MOUNT_POINT).to_string(),
        })
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (keys::HOST.to_string(), self.host.clone()),
            (keys::MOUNT_POINT.to_string(), self.mount_point.clone()),
        ])
    }

    /// `host:/path` source for the nfs mount. IPv6 hosts are bracketed.
    pub fn mount_source(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.mount_point)
        } else {
            format!("{}:{}", self.host, self.mount_point)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiVolumeContext {
    pub target_portal: String,
    pub iqn: String,
    pub lun: String,
    /// Additional discovery portals, empty unless multipath is configured.
    pub portals: Vec<String>,
}

impl IscsiVolumeContext {
    pub fn from_map(context: &HashMap<String, String>) -> Result<Self, DriverError> {
        check_required_keys(BackendKind::Iscsi, context)?;

        let raw_portals = require(context, keys::PORTALS).trim();
        let portals: Vec<String> = serde_json::from_str(raw_portals).map_err(|e| {
            DriverError::InvalidArgument(format!(
                "volume context key '{}' is not a JSON string list: {}",
                keys::PORTALS,
                e
            ))
        })?;

        Ok(Self {
            target_portal: require(context, keys::TARGET_PORTAL).to_string(),
            iqn: require(context, keys::IQN).to_string(),
            lun: require(context, keys::LUN).to_string(),
            portals,
        })
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        // A Vec<String> always serializes
        let portals = serde_json::to_string(&self.portals).unwrap_or_else(|_| "[]".to_string());
        HashMap::from([
            (keys::TARGET_PORTAL.to_string(), self.target_portal.clone()),
            (keys::IQN.to_string(), self.iqn.clone()),
            (keys::LUN.to_string(), self.lun.clone()),
            (keys::PORTALS.to_string(), portals),
        ])
    }

    pub fn lun_number(&self) -> Result<u32, DriverError> {
        self.lun.parse::<u32>().map_err(|_| {
            DriverError::InvalidArgument(format!("invalid LUN '{}' in volume context", self.lun))
        })
    }

    /// Portals to log in to: the explicit list, or the target portal alone.
    pub fn login_portals(&self) -> Result<Endpoints, DriverError> {
        let joined = if self.portals.is_empty() {
            self.target_portal.clone()
        } else {
            self.portals.join(",")
        };
        Endpoints::parse(&joined, ISCSI_DEFAULT_PORT)
            .map_err(|e| DriverError::InvalidArgument(e.to_string()))
    }
}

// ============================================================================
// Endpoint
// ============================================================================

pub const ISCSI_DEFAULT_PORT: u16 = 3260;

/// An iSCSI portal (host:port).
///
/// The host can be an IP address (v4 or v6) or a hostname. No resolution is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Format as the "host:port" string iscsiadm expects.
    pub fn to_portal_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_portal_string())
    }
}

/// Error returned when parsing an invalid endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParseError(String);

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid portal '{}': expected 'host:port' or 'host'", self.0)
    }
}

impl std::error::Error for EndpointParseError {}

/// Portal list for a (possibly multipath) iSCSI session.
#[derive(Debug, Clone)]
pub struct Endpoints {
    endpoints: Vec<Endpoint>,
}

impl Endpoints {
    /// Parse comma-separated portals, using `default_port` where none is given.
    ///
    /// Accepts `10.0.0.1:3260`, `10.0.0.1`, `[fd00::1]:3260` and hostnames.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, EndpointParseError> {
        let mut endpoints = Vec::new();

        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            endpoints.push(Self::parse_single(part, default_port)?);
        }

        if endpoints.is_empty() {
            return Err(EndpointParseError(s.to_string()));
        }

        Ok(Self { endpoints })
    }

    fn parse_single(s: &str, default_port: u16) -> Result<Endpoint, EndpointParseError> {
        // [v6]:port or [v6]
        if let Some(inner) = s.strip_prefix('[') {
            let Some(bracket_end) = inner.find(']') else {
                return Err(EndpointParseError(s.to_string()));
            };
            let host = &inner[..bracket_end];
            let rest = &inner[bracket_end + 1..];

            if rest.is_empty() {
                return Ok(Endpoint::new(host, default_port));
            }
            let port = rest
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| EndpointParseError(s.to_string()))?;
            return Ok(Endpoint::new(host, port));
        }

        // Exactly one colon means host:port; more is a bare IPv6 address
        if s.matches(':').count() == 1
            && let Some((host, port)) = s.split_once(':')
        {
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointParseError(s.to_string()))?;
            if host.is_empty() {
                return Err(EndpointParseError(s.to_string()));
            }
            return Ok(Endpoint::new(host, port));
        }

        Ok(Endpoint::new(s, default_port))
    }

    pub fn as_slice(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn to_portal_strings(&self) -> Vec<String> {
        self.as_slice().iter().map(Endpoint::to_portal_string).collect()
    }
}
