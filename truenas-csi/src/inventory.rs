//! Rebuild the volume list by joining appliance collections.
//!
//! The joins are pure functions over already-fetched lists so they can be
//! tested without an appliance. Entries come back sorted by volume ID, which
//! keeps ListVolumes pagination tokens stable between calls.

use std::collections::{BTreeMap, HashMap};

use truenas_client::types::{
    CompositeValue, Dataset, DatasetType, IscsiExtent, IscsiTarget, IscsiTargetExtent, NfsShare,
};

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub volume_id: String,
    pub capacity_bytes: i64,
}

/// Extent path for a zvol dataset.
pub fn zvol_path(dataset_name: &str) -> String {
    format!("zvol/{}", dataset_name)
}

fn parse_size(dataset: &Dataset, field: &str, value: Option<&CompositeValue>) -> Result<i64> {
    value
        .cloned()
        .unwrap_or_default()
        .raw_i64()
        .map_err(|e| {
            DriverError::Internal(format!(
                "failed to parse {} of dataset '{}': {}",
                field, dataset.name, e
            ))
        })
}

/// NFS volumes: datasets under `storage_path` that have a single-path share
/// on their mountpoint. Capacity is the dataset's refquota.
pub fn join_nfs(
    storage_path: &str,
    datasets: &[Dataset],
    shares: &[NfsShare],
) -> Result<Vec<VolumeEntry>> {
    let prefix = format!("{}/", storage_path);

    let by_mountpoint: HashMap<&str, &Dataset> = datasets
        .iter()
        .filter(|d| d.name.starts_with(&prefix))
        .filter_map(|d| d.mountpoint.as_deref().map(|mp| (mp, d)))
        .collect();

    let mut entries = BTreeMap::new();
    for share in shares {
        let [path] = share.paths.as_slice() else {
            continue;
        };
        let Some(dataset) = by_mountpoint.get(path.as_str()) else {
            continue;
        };

        let volume_id = dataset.name[prefix.len()..].to_string();
        let capacity_bytes = parse_size(dataset, "refquota", dataset.refquota.as_ref())?;
        entries.insert(
            volume_id.clone(),
            VolumeEntry {
                volume_id,
                capacity_bytes,
            },
        );
    }

    Ok(entries.into_values().collect())
}

/// iSCSI volumes: dataset → extent (by zvol path) → mapping (by extent id)
/// → target (by target id). Targets with an incomplete chain are dropped.
/// Capacity is the zvol's volsize.
pub fn join_iscsi(
    storage_path: &str,
    datasets: &[Dataset],
    extents: &[IscsiExtent],
    mappings: &[IscsiTargetExtent],
    targets: &[IscsiTarget],
) -> Result<Vec<VolumeEntry>> {
    let prefix = format!("{}/", storage_path);

    let by_zvol: HashMap<String, &Dataset> = datasets
        .iter()
        .filter(|d| d.kind == DatasetType::Volume && d.name.starts_with(&prefix))
        .map(|d| (zvol_path(&d.name), d))
        .collect();

    let by_extent: HashMap<i64, &Dataset> = extents
        .iter()
        .filter_map(|e| by_zvol.get(&e.path).map(|d| (e.id, *d)))
        .collect();

    let by_target: HashMap<i64, &Dataset> = mappings
        .iter()
        .filter_map(|m| by_extent.get(&m.extent).map(|d| (m.target, *d)))
        .collect();

    let mut entries = BTreeMap::new();
    for target in targets {
        let Some(dataset) = by_target.get(&target.id) else {
            continue;
        };
        let capacity_bytes = parse_size(dataset, "volsize", dataset.volsize.as_ref())?;
        entries.insert(
            target.name.clone(),
            VolumeEntry {
                volume_id: target.name.clone(),
                capacity_bytes,
            },
        );
    }

    Ok(entries.into_values().collect())
}
