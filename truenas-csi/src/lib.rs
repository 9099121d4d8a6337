//! TrueNAS CSI Driver Library
//!
//! Kubernetes CSI driver that provisions NFS shares and iSCSI zvols on a
//! TrueNAS appliance through its REST API, and attaches them on nodes.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - NFS and iSCSI provisioners with rollback of partial creates
//! - Node attach/detach over mount and iSCSI platform capabilities

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod capability;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod controller;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod provisioner;
pub mod session;
pub mod types;

pub use config::DriverConfig;
pub use controller::ControllerService;
pub use error::DriverError;
pub use identity::IdentityService;
pub use node::NodeService;
pub use provisioner::Provisioner;
pub use session::NodeSessionManager;
pub use types::BackendKind;
