//! Find-in-collection primitive over the appliance's list endpoints.
//!
//! The appliance has no server-side filtering, so every lookup fetches the
//! whole collection and scans it. Errors are wrapped with the object kind and
//! lookup key so a failure can be diagnosed from the log alone.

use std::fmt::{self, Display};
use std::future::Future;

use tracing::debug;
use truenas_client::ApiError;

use crate::error::{DriverError, Result};

/// Appliance object kinds, for logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Dataset,
    NfsShare,
    Extent,
    Initiator,
    Target,
    TargetExtent,
    GlobalConfig,
    Portal,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Dataset => "dataset",
            ObjectKind::NfsShare => "NFS share",
            ObjectKind::Extent => "iSCSI extent",
            ObjectKind::Initiator => "iSCSI initiator",
            ObjectKind::Target => "iSCSI target",
            ObjectKind::TargetExtent => "iSCSI target-extent mapping",
            ObjectKind::GlobalConfig => "iSCSI global config",
            ObjectKind::Portal => "iSCSI portal",
        };
        f.write_str(name)
    }
}

/// List a collection and return the first object matching `predicate`.
pub async fn find_first<T, Fut, P>(
    kind: ObjectKind,
    key: &str,
    list: Fut,
    predicate: P,
) -> Result<Option<T>>
where
    Fut: Future<Output = std::result::Result<Vec<T>, ApiError>>,
    P: FnMut(&T) -> bool,
{
    let items = list
        .await
        .map_err(|e| DriverError::remote("list", kind, key, e))?;
    let found = items.into_iter().find(predicate);
    debug!(object = %kind, key = %key, found = found.is_some(), "Catalog lookup");
    Ok(found)
}
