//! CSI Node Service Implementation
//!
//! NodePublishVolume performs the whole attach (mount for NFS, login plus
//! format and mount for iSCSI), so there is no staging step. The blocking
//! work runs on tokio's blocking pool through [`NodeSessionManager`].

use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::csi;
use crate::error::{DriverError, Result};
use crate::session::NodeSessionManager;
use crate::types::{BackendKind, IscsiVolumeContext, NfsVolumeContext, check_required_keys};

pub struct NodeService {
    sessions: Arc<NodeSessionManager>,
    node_id: String,
}

impl NodeService {
    pub fn new(sessions: Arc<NodeSessionManager>, node_id: String) -> Self {
        Self { sessions, node_id }
    }

    /// Validate that a path is safe to hand to mount tools.
    fn validate_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(DriverError::InvalidArgument(
                "target path must be provided".to_string(),
            ));
        }

        if !path.starts_with('/') {
            return Err(DriverError::InvalidArgument(format!(
                "target path '{}' must be absolute",
                path
            )));
        }

        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r', '\0',
        ];
        if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
            return Err(DriverError::InvalidArgument(format!(
                "target path contains forbidden character {:?}",
                c
            )));
        }

        if path.split('/').any(|component| component == "..") {
            return Err(DriverError::InvalidArgument(
                "target path cannot contain '..'".to_string(),
            ));
        }

        Ok(())
    }

    fn backend_for(volume_id: &str) -> Result<BackendKind> {
        BackendKind::from_volume_id(volume_id).ok_or_else(|| {
            DriverError::NotFound(format!("volume {} has an unknown backend prefix", volume_id))
        })
    }

    /// Run a blocking session call off the async executor.
    async fn blocking<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&NodeSessionManager) -> Result<()> + Send + 'static,
    {
        let sessions = self.sessions.clone();
        tokio::task::spawn_blocking(move || f(sessions.as_ref()))
            .await
            .map_err(|e| {
                error!(error = %e, "Node operation task failed");
                DriverError::Internal(format!("node operation task failed: {}", e))
            })?
    }

    async fn publish(&self, req: csi::NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume ID must be provided".to_string(),
            ));
        }
        Self::validate_path(&req.target_path)?;
        let capability = req.volume_capability.ok_or_else(|| {
            DriverError::InvalidArgument("volume capability must be provided".to_string())
        })?;

        let kind = Self::backend_for(&req.volume_id)?;
        check_required_keys(kind, &req.volume_context)?;

        let mount = match capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => mount,
            _ => {
                return Err(DriverError::InvalidArgument(
                    "only filesystem access is supported".to_string(),
                ));
            }
        };

        let target = PathBuf::from(&req.target_path);
        let readonly = req.readonly;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            backend = %kind,
            readonly = readonly,
            "NodePublishVolume request"
        );

        match kind {
            BackendKind::Nfs => {
                let context = NfsVolumeContext::from_map(&req.volume_context)?;
                self.blocking(move |s| {
                    s.attach_nfs(&target, &context, &mount.mount_flags, readonly)
                })
                .await
            }
            BackendKind::Iscsi => {
                let context = IscsiVolumeContext::from_map(&req.volume_context)?;
                let volume_id = req.volume_id;
                self.blocking(move |s| {
                    s.attach_iscsi(
                        &volume_id,
                        &target,
                        &context,
                        &mount.fs_type,
                        &mount.mount_flags,
                        readonly,
                    )
                })
                .await
            }
        }
    }

    async fn unpublish(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument(
                "volume ID must be provided".to_string(),
            ));
        }
        Self::validate_path(&req.target_path)?;
        let kind = Self::backend_for(&req.volume_id)?;
        let target = PathBuf::from(&req.target_path);

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            backend = %kind,
            "NodeUnpublishVolume request"
        );

        match kind {
            BackendKind::Nfs => self.blocking(move |s| s.detach_nfs(&target)).await,
            BackendKind::Iscsi => {
                let volume_id = req.volume_id;
                self.blocking(move |s| s.detach_iscsi(&volume_id, &target))
                    .await
            }
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.clone();
        self.publish(req).await?;

        info!(volume_id = %volume_id, "Volume published");
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.clone();
        self.unpublish(req).await?;

        info!(volume_id = %volume_id, "Volume unpublished");
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }

    /// No RPC capabilities: publish does the full attach.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![],
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}
