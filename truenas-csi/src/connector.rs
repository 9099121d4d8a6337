//! Node-local record of iSCSI sessions.
//!
//! Publish writes one JSON file per volume after login; unpublish reads it
//! back to know which session to log out of. A missing file means there is
//! nothing to tear down.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// What a node needs to reverse an iSCSI attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub volume_id: String,
    pub target_iqn: String,
    pub target_portals: Vec<String>,
    pub lun: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("invalid volume id for connector file: '{0}'")]
    InvalidVolumeId(String),

    #[error("connector file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connector file {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode connector: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Directory of `<volume id>.json` connector files.
#[derive(Debug, Clone)]
pub struct ConnectorStore {
    dir: PathBuf,
}

impl ConnectorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, volume_id: &str) -> Result<PathBuf, ConnectorError> {
        if volume_id.is_empty()
            || volume_id.contains('/')
            || volume_id.contains('\0')
            || volume_id.starts_with('.')
        {
            return Err(ConnectorError::InvalidVolumeId(volume_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", volume_id)))
    }

    /// Write the connector atomically: temp file in the same directory, then rename.
    pub fn save(&self, connector: &Connector) -> Result<PathBuf, ConnectorError> {
        let path = self.path_for(&connector.volume_id)?;
        let io_err = |source: io::Error| ConnectorError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(connector)?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        debug!(volume_id = %connector.volume_id, path = %path.display(), "Persisted iSCSI connector");
        Ok(path)
    }

    /// Load a connector. `Ok(None)` when no file exists.
    pub fn load(&self, volume_id: &str) -> Result<Option<Connector>, ConnectorError> {
        let path = self.path_for(volume_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ConnectorError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ConnectorError::Decode { path, source })
    }

    /// Remove a connector file. Already gone is fine.
    pub fn remove(&self, volume_id: &str) -> Result<(), ConnectorError> {
        let path = self.path_for(volume_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConnectorError::Io { path, source }),
        }
    }
}
