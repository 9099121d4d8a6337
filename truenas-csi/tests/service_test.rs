//! gRPC service behavior: status codes, pagination and unsupported RPCs.

mod common;

use std::sync::Arc;

use common::{FakeAppliance, FakeIscsi, FakeMounter, GIB, capacity, config, mount_capability};
use tempfile::TempDir;
use tonic::{Code, Request};
use truenas_csi::connector::ConnectorStore;
use truenas_csi::csi;
use truenas_csi::csi::controller_server::Controller;
use truenas_csi::csi::node_server::Node;
use truenas_csi::csi::volume_capability::access_mode::Mode;
use truenas_csi::{BackendKind, ControllerService, NodeService, NodeSessionManager, Provisioner};

fn controller(appliance: &Arc<FakeAppliance>) -> ControllerService {
    ControllerService::new(Provisioner::new(appliance.clone(), config(BackendKind::Nfs)))
}

fn create_request(name: &str, size: i64) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: capacity(size),
        volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
        ..Default::default()
    }
}

// ============================================================================
// Controller
// ============================================================================

#[tokio::test]
async fn test_create_volume_response() {
    let appliance = FakeAppliance::new();
    let response = controller(&appliance)
        .create_volume(Request::new(create_request("pv1", 2 * GIB)))
        .await
        .unwrap()
        .into_inner();

    let volume = response.volume.unwrap();
    assert_eq!(volume.volume_id, "nfs-pv1");
    assert_eq!(volume.capacity_bytes, 2 * GIB);
    assert_eq!(volume.volume_context.len(), 2);
}

#[tokio::test]
async fn test_create_volume_out_of_range() {
    let appliance = FakeAppliance::new();
    let status = controller(&appliance)
        .create_volume(Request::new(create_request("pv1", 200 * GIB)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);
    assert!(appliance.calls().is_empty());
}

#[tokio::test]
async fn test_create_volume_remote_failure_is_internal() {
    let appliance = FakeAppliance::new();
    appliance.fail_on("create_dataset");
    let status = controller(&appliance)
        .create_volume(Request::new(create_request("pv1", 2 * GIB)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
}

#[tokio::test]
async fn test_delete_volume_requires_id() {
    let appliance = FakeAppliance::new();
    let status = controller(&appliance)
        .delete_volume(Request::new(csi::DeleteVolumeRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_delete_foreign_volume_is_not_found() {
    let appliance = FakeAppliance::new();
    let status = controller(&appliance)
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: "iscsi-pv1".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn test_list_volumes_pages() {
    let appliance = FakeAppliance::new();
    let service = controller(&appliance);
    for name in ["pv3", "pv1", "pv2"] {
        service
            .create_volume(Request::new(create_request(name, GIB)))
            .await
            .unwrap();
    }

    let first = service
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 2,
            starting_token: String::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    let ids: Vec<_> = first
        .entries
        .iter()
        .map(|e| e.volume.as_ref().unwrap().volume_id.as_str())
        .collect();
    assert_eq!(ids, vec!["nfs-pv1", "nfs-pv2"]);
    assert_eq!(first.next_token, "2");

    let second = service
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 2,
            starting_token: first.next_token,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second.entries.len(), 1);
    assert!(second.next_token.is_empty());

    let status = service
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 2,
            starting_token: "garbage".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Aborted);
}

#[tokio::test]
async fn test_get_capacity() {
    let appliance = FakeAppliance::new();
    let response = controller(&appliance)
        .get_capacity(Request::new(csi::GetCapacityRequest::default()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.available_capacity, 100 * GIB);
    assert_eq!(response.minimum_volume_size, Some(GIB));
    assert_eq!(response.maximum_volume_size, None);
}

#[tokio::test]
async fn test_validate_volume_capabilities_confirmed() {
    let appliance = FakeAppliance::new();
    let service = controller(&appliance);
    let volume = service
        .create_volume(Request::new(create_request("pv1", GIB)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();

    let caps = vec![mount_capability(Mode::MultiNodeMultiWriter)];
    let response = service
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: volume.volume_id.clone(),
            volume_context: volume.volume_context.clone(),
            volume_capabilities: caps.clone(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    let confirmed = response.confirmed.unwrap();
    assert_eq!(confirmed.volume_capabilities, caps);
    assert_eq!(confirmed.volume_context, volume.volume_context);

    let status = service
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: volume.volume_id,
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_controller_capabilities() {
    use csi::controller_service_capability::{Type, rpc};

    let appliance = FakeAppliance::new();
    let response = controller(&appliance)
        .controller_get_capabilities(Request::new(csi::ControllerGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();

    let mut types: Vec<i32> = response
        .capabilities
        .iter()
        .filter_map(|c| match &c.r#type {
            Some(Type::Rpc(r)) => Some(r.r#type),
            _ => None,
        })
        .collect();
    types.sort();
    let mut expected = vec![
        rpc::Type::CreateDeleteVolume as i32,
        rpc::Type::ListVolumes as i32,
        rpc::Type::GetCapacity as i32,
    ];
    expected.sort();
    assert_eq!(types, expected);
}

#[tokio::test]
async fn test_unsupported_controller_rpcs() {
    let appliance = FakeAppliance::new();
    let service = controller(&appliance);

    let status = service
        .create_snapshot(Request::new(csi::CreateSnapshotRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = service
        .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = service
        .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);
}

// ============================================================================
// Node
// ============================================================================

struct NodeHarness {
    dir: TempDir,
    mounter: Arc<FakeMounter>,
    service: NodeService,
}

fn node() -> NodeHarness {
    let dir = TempDir::new().unwrap();
    let mounter = FakeMounter::new();
    let sessions = NodeSessionManager::new(
        mounter.clone(),
        FakeIscsi::new(),
        ConnectorStore::new(dir.path().join("connectors")),
    );
    NodeHarness {
        dir,
        mounter,
        service: NodeService::new(Arc::new(sessions), "node-1".to_string()),
    }
}

fn publish_request(h: &NodeHarness, volume_id: &str) -> csi::NodePublishVolumeRequest {
    csi::NodePublishVolumeRequest {
        volume_id: volume_id.to_string(),
        target_path: h.dir.path().join("mount").display().to_string(),
        volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
        volume_context: [
            ("host".to_string(), "10.0.0.5".to_string()),
            ("mountPoint".to_string(), "/mnt/pool/csi/nfs-pv1".to_string()),
        ]
        .into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_node_publish_and_unpublish_nfs() {
    let h = node();
    h.service
        .node_publish_volume(Request::new(publish_request(&h, "nfs-pv1")))
        .await
        .unwrap();
    assert_eq!(h.mounter.mounts().len(), 1);

    h.service
        .node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
            volume_id: "nfs-pv1".to_string(),
            target_path: h.dir.path().join("mount").display().to_string(),
        }))
        .await
        .unwrap();
    assert!(h.mounter.mounts().is_empty());
}

#[tokio::test]
async fn test_node_publish_rejects_bad_requests() {
    let h = node();

    let mut missing_key = publish_request(&h, "nfs-pv1");
    missing_key.volume_context.remove("host");
    let status = h
        .service
        .node_publish_volume(Request::new(missing_key))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("host"));

    let status = h
        .service
        .node_publish_volume(Request::new(publish_request(&h, "ceph-pv1")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let mut traversal = publish_request(&h, "nfs-pv1");
    traversal.target_path = "/var/lib/kubelet/../../etc".to_string();
    let status = h
        .service
        .node_publish_volume(Request::new(traversal))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut block = publish_request(&h, "nfs-pv1");
    block.volume_capability = Some(csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: None,
    });
    let status = h
        .service
        .node_publish_volume(Request::new(block))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    assert!(h.mounter.calls().is_empty());
}

#[tokio::test]
async fn test_node_publish_rejects_blank_context_values() {
    let h = node();
    let mut req = publish_request(&h, "nfs-pv1");
    req.volume_context
        .insert("host".to_string(), String::new());
    req.volume_context
        .insert("mountPoint".to_string(), String::new());

    let status = h
        .service
        .node_publish_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("host"));
    assert!(status.message().contains("mountPoint"));
    assert!(h.mounter.calls().is_empty());
    assert!(!h.dir.path().join("mount").exists());
}

#[tokio::test]
async fn test_node_get_info() {
    let h = node();
    let info = h
        .service
        .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.node_id, "node-1");
}
