//! CSI Controller Service Implementation
//!
//! Thin gRPC layer over [`Provisioner`]: request unpacking, logging, metrics
//! and pagination. All appliance work happens in the provisioner.

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::csi;
use crate::error::{DriverError, Result};
use crate::inventory::VolumeEntry;
use crate::metrics::OperationTimer;
use crate::provisioner::{MINIMUM_VOLUME_SIZE_BYTES, Provisioner, VolumeRequest};

pub struct ControllerService {
    provisioner: Provisioner,
}

impl ControllerService {
    pub fn new(provisioner: Provisioner) -> Self {
        Self { provisioner }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }
}

/// Slice `items` by an index token. An unparsable or out-of-range token is Aborted.
fn paginate<T>(items: Vec<T>, max_entries: i32, starting_token: &str) -> Result<(Vec<T>, String)> {
    let total_len = items.len();

    let start_idx = if starting_token.is_empty() {
        0
    } else {
        starting_token
            .parse::<usize>()
            .ok()
            .filter(|idx| *idx <= total_len)
            .ok_or_else(|| {
                DriverError::Aborted(format!("invalid starting_token '{}'", starting_token))
            })?
    };

    if max_entries < 0 {
        return Err(DriverError::InvalidArgument(
            "max_entries must not be negative".to_string(),
        ));
    }
    let max_entries = if max_entries > 0 {
        max_entries as usize
    } else {
        total_len
    };

    let end_idx = total_len.min(start_idx.saturating_add(max_entries));
    let page: Vec<T> = items
        .into_iter()
        .skip(start_idx)
        .take(end_idx - start_idx)
        .collect();

    let next_token = if end_idx < total_len {
        end_idx.to_string()
    } else {
        String::new()
    };

    Ok((page, next_token))
}

fn list_entry(entry: VolumeEntry) -> csi::list_volumes_response::Entry {
    csi::list_volumes_response::Entry {
        volume: Some(csi::Volume {
            capacity_bytes: entry.capacity_bytes,
            volume_id: entry.volume_id,
            volume_context: Default::default(),
            content_source: None,
            accessible_topology: vec![],
        }),
        status: None,
    }
}

fn rpc_capability(
    kind: csi::controller_service_capability::rpc::Type,
) -> csi::ControllerServiceCapability {
    csi::ControllerServiceCapability {
        r#type: Some(csi::controller_service_capability::Type::Rpc(
            csi::controller_service_capability::Rpc {
                r#type: kind as i32,
            },
        )),
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();

        info!(name = %req.name, backend = %self.provisioner.kind(), "CreateVolume request");

        let volume_request = VolumeRequest {
            name: req.name,
            capacity_range: req.capacity_range,
            capabilities: req.volume_capabilities,
        };
        let volume = timer.finish(self.provisioner.create_volume(&volume_request).await)?;

        info!(
            volume_id = %volume.volume_id,
            capacity_bytes = volume.capacity_bytes,
            "Volume created"
        );

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(volume.into()),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID must be provided"));
        }

        info!(volume_id = %volume_id, "DeleteVolume request");

        timer.finish(self.provisioner.delete_volume(volume_id).await)?;

        info!(volume_id = %volume_id, "Volume deleted");
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerPublishVolume is not supported",
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerUnpublishVolume is not supported",
        ))
    }

    /// Confirmed only when every requested capability is supported and the
    /// volume exists; the response echoes what was asked for.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let timer = OperationTimer::new("validate_volume_capabilities");
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID must be provided"));
        }
        if req.volume_capabilities.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument(
                "volume capabilities must be provided",
            ));
        }

        info!(volume_id = %volume_id, "ValidateVolumeCapabilities request");

        timer.finish(
            self.provisioner
                .validate_volume(volume_id, &req.volume_capabilities, &req.volume_context)
                .await,
        )?;

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> std::result::Result<Response<csi::ListVolumesResponse>, Status> {
        let timer = OperationTimer::new("list_volumes");
        let req = request.into_inner();

        info!(
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListVolumes request"
        );

        let listed = self
            .provisioner
            .list_volumes()
            .await
            .and_then(|volumes| paginate(volumes, req.max_entries, &req.starting_token));
        let (volumes, next_token) = timer.finish(listed)?;

        let entries: Vec<_> = volumes.into_iter().map(list_entry).collect();
        info!(count = entries.len(), next_token = %next_token, "ListVolumes completed");

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        let timer = OperationTimer::new("get_capacity");

        let available_capacity = timer.finish(self.provisioner.get_capacity().await)?;
        debug!(available_capacity, "GetCapacity completed");

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity,
            maximum_volume_size: None,
            minimum_volume_size: Some(MINIMUM_VOLUME_SIZE_BYTES),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = vec![
            rpc_capability(Type::CreateDeleteVolume),
            rpc_capability(Type::ListVolumes),
            rpc_capability(Type::GetCapacity),
        ];

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerExpandVolume is not supported",
        ))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerGetVolume is not supported",
        ))
    }
}
