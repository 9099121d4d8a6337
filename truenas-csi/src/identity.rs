//! CSI Identity Service Implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::csi;
use crate::types::BackendKind;

pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin identification and readiness.
///
/// The readiness flag is shared with the process bootstrap, which sets it
/// once the listener is bound and clears it first on shutdown.
pub struct IdentityService {
    kind: BackendKind,
    ready: Arc<AtomicBool>,
}

impl IdentityService {
    pub fn new(kind: BackendKind, ready: Arc<AtomicBool>) -> Self {
        Self { kind, ready }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.kind.driver_name().to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::Service(
                csi::plugin_capability::Service {
                    r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                },
            )),
        }];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = self.ready.load(Ordering::SeqCst);
        debug!(ready = ready, "Probe");
        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}
